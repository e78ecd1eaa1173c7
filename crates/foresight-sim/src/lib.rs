//! Loopback harness for the prediction stack.
//!
//! A [`Session`] pairs an authoritative server with the owning client of one
//! actor and routes every RPC and replication update through the MessagePack
//! codec with a fixed latency. [`Scenario`]s script the reconciliation cases
//! end to end and report their checks as JSON.

pub mod config;
pub mod report;
pub mod scenario;
pub mod session;

pub use config::{NetworkConfig, SimConfig};
pub use report::{Check, ScenarioReport};
pub use scenario::{demo_definitions, run_all, Scenario};
pub use session::{Definitions, Direction, Session, TranscriptEntry, WireStats};
