//! `engine` crate — workflow definitions and the distributed orchestration
//! engine that advances runs through them.

pub mod codec;
pub mod config;
pub mod correlator;
pub mod error;
pub mod keys;
pub mod lock;
pub mod messages;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod state;
pub mod worker;
pub mod workflow;

pub use config::EngineConfig;
pub use correlator::{Correlation, Correlator};
pub use error::EngineError;
pub use lock::{DistributedLock, Lock};
pub use messages::OrchestrationMessage;
pub use models::{ExecutionAspect, ExecutionInfo};
pub use pipeline::{Disposition, Orchestrator};
pub use state::ExecutionStateStore;
pub use worker::Worker;
pub use workflow::{WorkflowDefinition, WorkflowRegistry};

#[cfg(test)]
mod pipeline_tests;
