//! Network control-plane provisioning fuzzer.
//!
//! Creates batches of networks and subnets through the control-plane CLI
//! client, waits for the listing to show all of them, optionally keeps
//! re-verifying, and always cleans up after itself unless told to keep the
//! resources.

pub mod agents;
pub mod batch;
pub mod client;
pub mod config;
pub mod convergence;
pub mod error;
pub mod runner;
pub mod session;
pub mod signal;
#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use config::{FuzzConfig, FuzzConfigInput};
pub use error::HarnessError;
pub use session::{ResourceSession, SessionFailure, SessionReport, SessionState};
pub use signal::{AbortToken, SignalGate};
