//! Serialized, cancellable access to a thread-affine llama.cpp engine.
//!
//! The native engine may only be touched from one thread. [`RunLoop`] owns
//! it on a dedicated thread and hands out a cloneable [`RunLoopClient`];
//! generations come back as a pull-based [`GenerationStream`].

pub mod cli;
pub mod config;
pub mod error;
pub mod generation;
pub mod handles;
pub mod native;
pub mod prompt;
pub mod runloop;
pub mod state;

pub use config::{ContextSize, Identity, RunLoopConfig};
pub use error::{EngineError, Result};
pub use generation::{GenerationOutcome, GenerationReport, GenerationStream};
pub use runloop::{LlamaClient, RunLoop, RunLoopClient};
pub use state::BenchParams;
