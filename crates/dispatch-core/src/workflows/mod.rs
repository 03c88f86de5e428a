//! # Workflows Module
//!
//! High-level procedures built on the dispatch engine. Workflows are the entry points for
//! users of FFDispatch: they take a configured [`crate::engine::forcefield::ForceField`],
//! drive it through a complete job and hand back organized results.
//!
//! - **Replica Evaluation** ([`evaluate`]) - Evaluate every replica of a system concurrently

pub mod evaluate;
