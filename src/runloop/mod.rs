//! Execution serializer for the native inference engine.
//!
//! Every operation that touches the engine is marshalled onto one dedicated
//! thread and executed there in submission order. Callers hold a cheap,
//! cloneable client and suspend on a reply channel until their request has
//! run.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              LlamaClient (trait)                │
//! │  - load()          - unload()                   │
//! │  - send()          - bench()                    │
//! │  - system_info()   - health_check()             │
//! └─────────────────────────────────────────────────┘
//!                         ▲
//!                         │
//!               ┌─────────┴─────────┐
//!               │   RunLoopClient   │
//!               │  (mpsc channels)  │
//!               └───────────────────┘
//!                         │
//!                         ▼
//! ┌─────────────────────────────────────────────────┐
//! │                   RunLoop                       │
//! │  - core: EngineCore (Idle / Loaded)             │
//! │  - runs on the "llm-runloop" thread             │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use futures::StreamExt;
//! use llm_runloop::{LlamaClient, RunLoop, RunLoopConfig};
//!
//! let client = RunLoop::start(RunLoopConfig::default()).await?;
//! client.load(Path::new("/models/tinyllama.Q4_0.gguf")).await?;
//!
//! let mut stream = client.send("Hello");
//! while let Some(fragment) = stream.next().await {
//!     print!("{}", fragment?);
//! }
//! let report = stream.finish().await;
//! ```
//!
//! # Thread Model
//!
//! The native engine is thread-affine, so the run loop owns it on a plain
//! `std::thread` and drains requests with `blocking_recv`. While a
//! generation is running the thread waits on that generation's pull channel
//! only, which keeps generation steps and every other request from
//! interleaving.

mod client;
mod request;
mod service;

pub use client::{LlamaClient, RunLoopClient};
pub use request::EngineRequest;
pub use service::{RunLoop, RUN_LOOP_THREAD};
