pub mod closure;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod graph;
pub mod namespace;
pub mod resource_map;
pub mod service;
pub mod tiger;
pub mod tuple;

pub use closure::{GroupClosure, DEFAULT_MAX_DEPTH};
pub use coordinator::{CacheCoordinator, CoordinatorStats};
pub use engine::PolicyEngine;
pub use error::{RebacError, Result};
pub use graph::{ZoneGraph, ZoneGraphCache};
pub use namespace::{MountPoint, NamespaceView, NamespaceViewStore};
pub use resource_map::ResourceIdMap;
pub use service::{PermissionService, ServiceConfig};
pub use tiger::{StoredBitmap, TigerCache, TigerConfig};
pub use tuple::{TupleFilter, TupleRow, TupleStore, WriteTupleRequest};
