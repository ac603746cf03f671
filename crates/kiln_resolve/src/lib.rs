//! Import specifier resolution.
//!
//! Maps an import specifier written in a source file (relative path, absolute
//! path, alias, or bare package name) to the absolute file it refers to,
//! following Node-style lookup: extensions, directory main files, package
//! manifest entry fields, and module directories searched upward from the
//! importing file.

#![warn(missing_docs)]

pub mod error;
pub mod path;
pub mod resolver;

pub use error::ResolveError;
pub use path::normalize;
pub use resolver::{resolve, Resolver};
