pub mod cas;
pub mod error;
pub mod metadata;
pub mod router;
pub mod service;

pub use cas::{CasConfig, CasStore};
pub use error::{Result, StorageError};
pub use metadata::{FileMetadata, MetadataStore, UpsertOutcome, VersionRecord};
pub use router::{MountRoute, PathRouter, ResolvedPath};
pub use service::{FileService, RequestContext};
