//! `steps` crate — the `Step` capability traits and the types every step sees.
//!
//! A step is a capability bundle: it always executes, it may verify itself
//! once done, and it may verify external deploy events.  Declaring an event
//! verifier is what makes a step asynchronous.  The engine dispatches through
//! these traits; generator business logic lives behind them.

pub mod builtin;
pub mod context;
pub mod error;
pub mod event;
pub mod mock;
pub mod outcome;
pub mod traits;
pub mod verification;

pub use context::{ExecutionContext, ExecutionStatus};
pub use error::{StepError, VerificationError};
pub use event::DeployFinalized;
pub use outcome::{Batch, StepOutcome, SubOperation};
pub use traits::{EventVerifier, Step, Verifier};
