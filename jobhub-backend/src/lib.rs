//! HTTP surface of jobhub: job submission, control and progress polling.
//!
//! Every route lives under `/api`. Authorization is left to whatever sits in
//! front of this service.

pub mod app;
pub mod error;
pub mod handlers;
pub mod state;

pub use app::build_router;
