//! External chain events consumed by asynchronous steps.

use serde::{Deserialize, Serialize};

/// A deploy dispatched by a step has reached finality on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployFinalized {
    /// Node that reported the finalization.
    pub node_index: u32,
    /// Block in which the deploy was finalized.
    pub block_hash: String,
    pub deploy_hash: String,
}

impl DeployFinalized {
    pub fn new(node_index: u32, block_hash: impl Into<String>, deploy_hash: impl Into<String>) -> Self {
        Self {
            node_index,
            block_hash: block_hash.into(),
            deploy_hash: deploy_hash.into(),
        }
    }
}
