//! Error types for the run loop.

use std::fmt;
use thiserror::Error;

/// A specialized Result type for run loop operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// The operation was not permitted in the current resource state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateViolation {
    /// `load` was called while an engine is already allocated.
    AlreadyLoaded,
    /// The operation needs a loaded engine.
    NotLoaded,
    /// The identity cannot change while an engine is loaded.
    IdentityWhileLoaded,
}

impl fmt::Display for StateViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateViolation::AlreadyLoaded => write!(f, "model already loaded"),
            StateViolation::NotLoaded => write!(f, "no model loaded"),
            StateViolation::IdentityWhileLoaded => {
                write!(f, "cannot initialize identity after loading model")
            }
        }
    }
}

/// Allocation step of a `load`, in the order the steps run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocStage {
    Model,
    Context,
    Batch,
    Sampler,
}

impl fmt::Display for AllocStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AllocStage::Model => "load_model",
            AllocStage::Context => "new_context",
            AllocStage::Batch => "new_batch",
            AllocStage::Sampler => "new_sampler",
        };
        f.write_str(name)
    }
}

/// Run loop error type.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Operation not permitted in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(StateViolation),

    /// Configuration value outside its supported range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A native constructor returned a null handle.
    #[error("Allocation failed: {0}() returned null")]
    AllocationFailed(AllocStage),

    /// The worker faulted, died, or the engine is latched unusable.
    #[error("Engine fault: {0}")]
    EngineFault(String),

    /// The native library could not be opened or bound.
    #[error("Native library error: {0}")]
    Library(String),
}

impl EngineError {
    /// True for the `AlreadyLoaded` state violation.
    pub fn is_already_loaded(&self) -> bool {
        matches!(self, Self::InvalidState(StateViolation::AlreadyLoaded))
    }

    /// Faults leave the engine unusable until an unload/load cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::EngineFault(_) | Self::Library(_))
    }

    /// Create an engine fault.
    pub fn fault<S: Into<String>>(msg: S) -> Self {
        Self::EngineFault(msg.into())
    }

    /// Create a configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

impl From<StateViolation> for EngineError {
    fn from(violation: StateViolation) -> Self {
        Self::InvalidState(violation)
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

impl From<libloading::Error> for EngineError {
    fn from(err: libloading::Error) -> Self {
        Self::Library(err.to_string())
    }
}
