//! # Models Module
//!
//! Data structures describing a unit of dispatched work.
//!
//! - [`request`] - The request record, its status state machine and its result envelope
//! - [`cell`] - Simulation cell matrices and periodic boundary folding
//! - [`ids`] - Versioned arena keys used to identify queued records

pub mod cell;
pub mod ids;
pub mod request;
