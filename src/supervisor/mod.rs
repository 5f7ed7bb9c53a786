//! Engine lifecycle: start, stop, liveness, health and hot reload

mod control;
mod process;

pub use control::ControlClient;
pub use process::{InstanceHandle, InstanceState, PidRecord, ProcessSupervisor};
