//! Driving-context orchestration.
//!
//! This module owns run lifecycle control (start/stop/restart), the ready acknowledgement
//! and outcome reporting. UI/CLI layers call into this module to keep responsibilities
//! separated from the worker context.

mod controller;
mod outcome;

pub use controller::{run_controller, Collaborators, RunController, UiCommand};
pub use outcome::Outcome;
