//! # FFDispatch Core Library
//!
//! The job-dispatch core of a molecular-simulation driver: it accepts requests to evaluate the
//! energy and forces of an atomic configuration, routes each request to a pluggable evaluation
//! backend, and hands a structured result back to the caller.
//!
//! ## Architectural Philosophy
//!
//! The library follows a strict three-layer architecture.
//!
//! - **[`core`]: The Foundation.** Stateless data models (`ForceRequest`, `Cell`,
//!   `ForceResult`), the reference analytic potentials, bath dipole utilities and XYZ input.
//!
//! - **[`engine`]: The Logic Core.** The stateful dispatch machinery. It owns the shared request
//!   queue and its locking discipline, the request state machine, the polling scheduler, the
//!   backend plugins (in-process, external-process and remote-interface), the fan-out/fan-in
//!   aggregator and the cooperative shutdown token.
//!
//! - **[`workflows`]: The Public API.** Ties `engine` and `core` together into complete
//!   procedures, such as evaluating every replica of a path-integral system.

pub mod core;
pub mod engine;
pub mod workflows;
