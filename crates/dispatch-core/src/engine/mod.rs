//! # Engine Module
//!
//! This module implements the stateful dispatch machinery of FFDispatch: everything that
//! owns threads, locks or the lifecycle of a request.
//!
//! ## Overview
//!
//! A [`dispatcher::Dispatcher`] owns one request queue and one backend. Callers submit
//! configurations and receive handles, a polling thread (or the submitting thread, in
//! serial mode) drives queued records through the backend, and callers wait on and
//! release their handles. The [`fanout::FanOutDispatcher`] splits configurations into
//! independent baths on top of a dispatcher, and the [`forcefield::ForceField`] facade
//! selects between the two from configuration.
//!
//! ## Architecture
//!
//! - **Configuration** ([`config`]) - Force field, interface, external process and fan-out settings
//! - **Request Queue** ([`queue`]) - The shared, lock-guarded arena of tracked records
//! - **Backends** ([`backend`], [`external`], [`interface`]) - In-process, external-process and remote evaluation
//! - **Scheduling** ([`scheduler`], [`dispatcher`]) - The polling thread and the dispatch core
//! - **Aggregation** ([`fanout`]) - Fan-out/fan-in over independent baths
//! - **Shutdown** ([`shutdown`]) - Cooperative shutdown shared by every thread and wait loop
//! - **Progress Monitoring** ([`progress`]) - Progress reporting callbacks
//! - **Error Handling** ([`error`]) - Dispatch error types
//!
//! ## Locking
//!
//! Queue membership is guarded by one coarse lock per dispatcher. Backends sweep while
//! holding it, and remote interfaces apply worker results while holding it. Request status
//! is atomic so that waiters never take the queue lock. Shutdown is only ever triggered
//! after the queue lock has been released.

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod external;
pub mod fanout;
pub mod forcefield;
pub mod interface;
pub mod progress;
pub mod queue;
pub mod scheduler;
pub mod shutdown;
