// Core modules
pub mod entity;
pub mod path;
pub mod relation;
pub mod zone;

// Re-export commonly used types
pub use entity::EntityRef;
pub use path::{ancestor_paths, is_same_or_descendant, normalize_path, parent_path};
pub use relation::{
    implied_permissions, is_cross_tenant_allowed, is_membership_relation, relation_spec,
    relations_granting, Permission, RelationSpec, CROSS_TENANT_ALLOWED_RELATIONS,
    RELATION_REGISTRY,
};
pub use zone::{ConsistencyMode, DEFAULT_ZONE};
