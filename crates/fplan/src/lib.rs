//! Umbrella crate for the fplan host.
//!
//! Re-exports the engine and protocol crates so hosts embedding the floor
//! plan can depend on a single crate name (`fplan`).

pub use fplan_engine as engine;
pub use fplan_protocol as protocol;

pub use fplan_engine::{BridgeChannel, BridgeHandlers, Engine, LoadPlan, ScriptEvaluator, Settings};
