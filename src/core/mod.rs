//! Frontend-independent station logic
//!
//! The workflow engine and everything it owns that is not I/O: the bus to
//! the frontend, the run log, scanner input assembly and stream waiters.
//! The coordinating loop in `runtime` ties them to the collaborators in
//! `crate::protocol`.

pub mod bus;
pub mod logs;
pub mod runtime;
pub mod scanner;
pub mod types;
pub mod waiter;
pub mod workflow;

pub use bus::{Bus, CoreToUi, KeyInput, UiToCore};
pub use runtime::{event_channels, run_core_thread, spawn_station, EventReceivers, EventSenders};
pub use types::{Failure, TestKey, TestVerdict, WorkflowState};
pub use workflow::{StepAction, Workflow};
