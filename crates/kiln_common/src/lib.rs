//! Shared foundational types used across the Kiln build cache.
//!
//! This crate provides the content hash used to detect source changes and to
//! derive stable identifiers for cached artifacts.

#![warn(missing_docs)]

pub mod hash;

pub use hash::{ContentHash, ParseHashError};
