//! Transport Selection
//!
//! Tries each transport candidate in order and keeps the first engine
//! that starts. Attempts are strictly sequential so two candidates never
//! contend for the same kernel device, and every failed attempt has
//! released its resources before the next one begins.

use crate::composer::{ComposeError, EngineComposer};
use crate::config::{Candidate, TransportSpec};
use crate::engine::{Engine, EngineError};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// The engine that started and the candidate it was built from
pub struct Selection {
    pub engine: Arc<dyn Engine>,
    pub candidate: Candidate,
}

impl Selection {
    pub fn is_userspace(&self) -> bool {
        self.candidate.is_userspace()
    }
}

impl fmt::Debug for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selection")
            .field("candidate", &self.candidate)
            .finish_non_exhaustive()
    }
}

/// Why one candidate failed
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error("engine: {0}")]
    Engine(#[from] EngineError),
}

/// One failed candidate
#[derive(Debug, thiserror::Error)]
#[error("{candidate}: {source}")]
pub struct TransportAttemptError {
    pub candidate: Candidate,
    #[source]
    pub source: AttemptError,
}

/// Selection errors
#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error("all transports failed: {}", join(.0))]
    AllFailed(Vec<TransportAttemptError>),
}

impl SelectError {
    /// Per-candidate errors in attempt order
    pub fn attempts(&self) -> &[TransportAttemptError] {
        match self {
            SelectError::AllFailed(errs) => errs,
        }
    }
}

fn join(errs: &[TransportAttemptError]) -> String {
    errs.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Picks the first working transport
pub struct TransportSelector {
    composer: EngineComposer,
}

impl TransportSelector {
    pub fn new(composer: EngineComposer) -> Self {
        Self { composer }
    }

    /// Try candidates in order, one attempt each
    pub fn select(&self, spec: &TransportSpec) -> Result<Selection, SelectError> {
        let mut errors = Vec::with_capacity(spec.len());

        for candidate in spec.candidates() {
            match self.attempt(candidate) {
                Ok(engine) => {
                    info!("Using transport {}", candidate);
                    return Ok(Selection {
                        engine,
                        candidate: candidate.clone(),
                    });
                }
                Err(source) => {
                    warn!("Transport {} failed: {}", candidate, source);
                    errors.push(TransportAttemptError {
                        candidate: candidate.clone(),
                        source,
                    });
                }
            }
        }

        Err(SelectError::AllFailed(errors))
    }

    fn attempt(&self, candidate: &Candidate) -> Result<Arc<dyn Engine>, AttemptError> {
        let config = self.composer.compose(candidate)?;
        Ok(self.composer.backend().new_engine(config)?)
    }
}
