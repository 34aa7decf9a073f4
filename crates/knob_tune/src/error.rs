//! Error conditions that callers branch on.
//!
//! Plumbing failures travel as `anyhow::Error` with context attached. The
//! variants below are the ones the evaluator (or an embedding optimizer)
//! needs to recognize, so they are raised as typed errors and recovered with
//! `anyhow::Error::downcast_ref::<TuneError>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TuneError {
    /// Every connection attempt failed, including the one made after the
    /// override file was removed.
    #[error("database unreachable after {attempts} attempts and override-file recovery: {last_error}")]
    ConnectExhausted { attempts: u32, last_error: String },

    /// The server could not be started again after applying a configuration,
    /// even after the override file was removed.
    #[error("server restart failed after remediation: {0}")]
    RestartFailed(String),

    /// The surrogate path was requested without a loaded artifact or without
    /// a baseline metrics snapshot.
    #[error("surrogate unavailable: {0}")]
    SurrogateUnavailable(String),

    /// Feature vector length differs from what the model was trained on.
    #[error("feature vector has {actual} entries, model expects {expected}")]
    FeatureMismatch { expected: usize, actual: usize },

    /// A knob name or catalog entry is not usable.
    #[error("invalid knob {name}: {reason}")]
    InvalidKnob { name: String, reason: String },
}

impl TuneError {
    /// Returns the typed error carried by an `anyhow::Error`, if any.
    pub fn from_anyhow(err: &anyhow::Error) -> Option<&TuneError> {
        err.downcast_ref::<TuneError>()
    }
}
