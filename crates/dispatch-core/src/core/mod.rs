//! # Core Module
//!
//! Stateless building blocks shared by the dispatch engine.
//!
//! ## Architecture
//!
//! - **Request Representation** ([`models`]) - Request records, status, results, handles and cells
//! - **Reference Potentials** ([`potentials`]) - In-process analytic evaluators
//! - **Bath Dipoles** ([`dipole`]) - Per-bath dipole aggregates and post-processing corrections
//! - **File I/O** ([`io`]) - Reading atomic configurations from XYZ frames
//!
//! Nothing in this module owns threads or locks beyond the per-record state guards; all
//! scheduling decisions live in [`crate::engine`].

pub mod dipole;
pub mod io;
pub mod models;
pub mod potentials;
