//! # I/O Module
//!
//! Readers for atomic configurations handed to the dispatch engine.
//!
//! - [`xyz`] - Plain XYZ frames (atom count, comment, `label x y z` rows)

pub mod xyz;
