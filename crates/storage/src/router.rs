//! Virtual-path routing.
//!
//! Maps a virtual path to the backend that owns it by longest matching mount
//! prefix. Routes are static per process; a readonly mount refuses writes at
//! resolve time so callers fail before touching content.

use crate::error::{Result, StorageError};
use nexus_models::{is_same_or_descendant, normalize_path};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountRoute {
    pub prefix: String,
    pub backend_name: String,
    pub backend_path: String,
    pub readonly: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedPath {
    pub backend_name: String,
    pub physical_path: String,
    pub readonly: bool,
}

pub struct PathRouter {
    routes: Vec<MountRoute>,
}

impl PathRouter {
    /// Longest prefix wins, so order of the input does not matter.
    pub fn new(mut routes: Vec<MountRoute>) -> Self {
        for route in &mut routes {
            route.prefix = normalize_path(&route.prefix);
        }
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { routes }
    }

    /// A single catch-all mount at `/`.
    pub fn single(backend_name: impl Into<String>, backend_path: impl Into<String>) -> Self {
        Self::new(vec![MountRoute {
            prefix: "/".to_string(),
            backend_name: backend_name.into(),
            backend_path: backend_path.into(),
            readonly: false,
        }])
    }

    pub fn resolve(&self, path: &str) -> Result<ResolvedPath> {
        let path = normalize_path(path);
        let route = self
            .routes
            .iter()
            .find(|route| is_same_or_descendant(&path, &route.prefix))
            .ok_or_else(|| StorageError::NotFound(format!("no mount for {}", path)))?;

        let remainder = if route.prefix == "/" {
            path.trim_start_matches('/')
        } else {
            path[route.prefix.len()..].trim_start_matches('/')
        };
        let physical_path = if remainder.is_empty() {
            route.backend_path.clone()
        } else {
            format!("{}/{}", route.backend_path.trim_end_matches('/'), remainder)
        };

        Ok(ResolvedPath {
            backend_name: route.backend_name.clone(),
            physical_path,
            readonly: route.readonly,
        })
    }

    /// Resolve for a mutation; readonly mounts are refused here.
    pub fn resolve_for_write(&self, path: &str) -> Result<ResolvedPath> {
        let resolved = self.resolve(path)?;
        if resolved.readonly {
            return Err(StorageError::InvalidState(format!(
                "mount for {} is read-only",
                path
            )));
        }
        Ok(resolved)
    }

    pub fn routes(&self) -> &[MountRoute] {
        &self.routes
    }
}
