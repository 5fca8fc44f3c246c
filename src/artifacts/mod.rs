//! Artifact collection, storage and import

pub mod path_guard;
pub mod properties;
pub mod store;

pub use path_guard::{PathEscapeError, resolve_within};
pub use store::{ArtifactRecord, ArtifactStore, OutputMatch, collect_matches};
