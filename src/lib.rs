//! Build bisection: narrow a faulty build within a range by fetching and evaluating midpoints.
//!
//! The search loop runs on a dedicated worker context per run ([`engine`]); the driving
//! context ([`orchestrator::RunController`]) starts and stops runs, delivers verdicts and
//! observes events.

pub mod cli;
pub mod engine;
pub mod error;
pub mod handler;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod text_summary;

pub use error::{BisectError, BisectResult};
