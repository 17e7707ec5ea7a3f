//! Reusable verification predicates for step verifiers.

use crate::{DeployFinalized, VerificationError};

/// The step has seen exactly `expected` finalized deploys.
///
/// A mismatch is ignorable: more deploys may still be in flight.
pub fn verify_deploy_count(actual: u64, expected: u64) -> Result<(), VerificationError> {
    if actual == expected {
        Ok(())
    } else {
        Err(VerificationError::ignorable(format!(
            "deploy count mismatch: actual={actual}, expected={expected}"
        )))
    }
}

/// The event names the block the deploy was finalized in.
pub fn verify_block_hash(event: &DeployFinalized) -> Result<(), VerificationError> {
    if event.block_hash.trim().is_empty() {
        Err(VerificationError::fatal(format!(
            "deploy {} finalized without a block hash",
            event.deploy_hash
        )))
    } else {
        Ok(())
    }
}

/// The event refers to a non-empty deploy hash.
pub fn verify_deploy_hash(event: &DeployFinalized) -> Result<(), VerificationError> {
    if event.deploy_hash.trim().is_empty() {
        Err(VerificationError::fatal("finalized deploy has no hash"))
    } else {
        Ok(())
    }
}
