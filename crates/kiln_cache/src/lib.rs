//! Incremental compilation cache for a development-time module bundler.
//!
//! Decides, for every source file touched by a build, whether the previously
//! produced artifact can be served again or must be regenerated. State is kept
//! in a [`PersistentStore`] of lazily loaded, dirty-tracked tables on disk:
//!
//! - [`CacheIndex`] maps a source path to an opaque [`CacheId`] and its
//!   [`CacheRecord`] (content hash, mtime, plugin fingerprint, dependencies).
//! - [`DependencyGraph`] keeps the reverse "dependency -> dependents" index.
//! - [`StalenessChecker`] answers "is this artifact still valid?" and sweeps
//!   entries whose sources or dependencies disappeared.
//!
//! [`Cache`] ties these together with the import resolver for the transform
//! pipeline.

#![warn(missing_docs)]

pub mod artifact;
pub mod cache;
pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod hasher;
pub mod index;
pub mod record;
pub mod staleness;
pub mod store;

pub use artifact::{Artifact, ArtifactStore};
pub use cache::{Cache, CommitOutcome, CACHE_VERSION};
pub use error::CacheError;
pub use fingerprint::{CachePlugin, PluginFingerprint};
pub use graph::DependencyGraph;
pub use hasher::{FileStamp, SourceHasher};
pub use index::CacheIndex;
pub use record::{CacheId, CacheRecord, DependencyStamp};
pub use staleness::{StaleReason, Staleness, StalenessChecker, SweepReport};
pub use store::{DependentsMap, IdTable, PersistentStore, RecordTable, Table, TableGuard};
