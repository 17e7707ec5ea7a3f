//! Step-level error types.

use thiserror::Error;

/// Errors returned by a step's `execute` or `execute_sub_operation`.
///
/// Any of these is fatal to the owning run: the engine records ERROR on the
/// step and stops progression.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StepError {
    /// The step's own logic failed.
    #[error("step execution failed: {0}")]
    Execution(String),

    /// A sub-operation was routed to a step that cannot run it.
    #[error("step '{label}' does not support sub-operation '{kind}'")]
    UnsupportedSubOperation { label: String, kind: String },
}

/// Raised by a step's verifier or event verifier.
///
/// The severity is orthogonal to the message: an *ignorable* failure is
/// logged and the pipeline carries on, any other failure halts the run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("verification failed: {message}")]
pub struct VerificationError {
    pub message: String,
    pub ignorable: bool,
}

impl VerificationError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self { message: message.into(), ignorable: false }
    }

    pub fn ignorable(message: impl Into<String>) -> Self {
        Self { message: message.into(), ignorable: true }
    }

    pub fn is_ignorable(&self) -> bool {
        self.ignorable
    }
}
