use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Action verbs that subjects check against objects.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
    Owner,
}

impl Permission {
    pub const ALL: [Permission; 4] = [
        Permission::Read,
        Permission::Write,
        Permission::Admin,
        Permission::Owner,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Admin => "admin",
            Permission::Owner => "owner",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Permission::Read),
            "write" => Ok(Permission::Write),
            "admin" => Ok(Permission::Admin),
            "owner" => Ok(Permission::Owner),
            other => Err(format!("Invalid permission: {}", other)),
        }
    }
}

/// Static description of a relation: what it grants and how it propagates.
#[derive(Debug, Clone)]
pub struct RelationSpec {
    /// Permissions a holder of this relation gets on the object.
    pub grants: &'static [Permission],
    /// Propagates from an ancestor directory to all descendants.
    pub inheritable: bool,
    /// Group-membership edge; feeds the transitive closure.
    pub membership: bool,
    /// Allowed to connect subjects and objects in different tenants.
    pub cross_tenant: bool,
}

/// Relations allowed to cross tenant boundaries. Fixed at the wire level.
pub const CROSS_TENANT_ALLOWED_RELATIONS: [&str; 3] =
    ["shared-viewer", "shared-editor", "shared-owner"];

const FULL: &[Permission] = &[
    Permission::Read,
    Permission::Write,
    Permission::Admin,
    Permission::Owner,
];
const READ_WRITE: &[Permission] = &[Permission::Read, Permission::Write];
const READ_ONLY: &[Permission] = &[Permission::Read];
const ADMIN: &[Permission] = &[Permission::Read, Permission::Write, Permission::Admin];

lazy_static! {
    /// The relation registry: every relation the evaluator understands.
    pub static ref RELATION_REGISTRY: HashMap<&'static str, RelationSpec> = {
        let mut m = HashMap::new();
        m.insert("direct_owner", RelationSpec { grants: FULL, inheritable: true, membership: false, cross_tenant: false });
        m.insert("owner", RelationSpec { grants: FULL, inheritable: true, membership: false, cross_tenant: false });
        m.insert("editor", RelationSpec { grants: READ_WRITE, inheritable: true, membership: false, cross_tenant: false });
        m.insert("writer", RelationSpec { grants: READ_WRITE, inheritable: true, membership: false, cross_tenant: false });
        m.insert("viewer", RelationSpec { grants: READ_ONLY, inheritable: true, membership: false, cross_tenant: false });
        m.insert("reader", RelationSpec { grants: READ_ONLY, inheritable: true, membership: false, cross_tenant: false });
        m.insert("admin", RelationSpec { grants: ADMIN, inheritable: true, membership: false, cross_tenant: false });
        m.insert("shared-owner", RelationSpec { grants: FULL, inheritable: true, membership: false, cross_tenant: true });
        m.insert("shared-editor", RelationSpec { grants: READ_WRITE, inheritable: true, membership: false, cross_tenant: true });
        m.insert("shared-viewer", RelationSpec { grants: READ_ONLY, inheritable: true, membership: false, cross_tenant: true });
        // Zone roles attach to the zone object, not to paths.
        m.insert("zone-admin", RelationSpec { grants: ADMIN, inheritable: false, membership: false, cross_tenant: false });
        m.insert("zone-owner", RelationSpec { grants: FULL, inheritable: false, membership: false, cross_tenant: false });
        // Membership edges. They grant read on the group object itself.
        m.insert("member", RelationSpec { grants: READ_ONLY, inheritable: false, membership: true, cross_tenant: false });
        m.insert("member-of", RelationSpec { grants: READ_ONLY, inheritable: false, membership: true, cross_tenant: false });
        // Structural edge between a path and its parent directory.
        m.insert("parent", RelationSpec { grants: &[], inheritable: false, membership: false, cross_tenant: false });
        m
    };
}

/// Look up a relation; unknown relations grant nothing and never propagate.
pub fn relation_spec(relation: &str) -> Option<&'static RelationSpec> {
    RELATION_REGISTRY.get(relation)
}

/// All relations whose grant set includes `permission`.
pub fn relations_granting(permission: Permission) -> Vec<&'static str> {
    let mut rels: Vec<&'static str> = RELATION_REGISTRY
        .iter()
        .filter(|(_, spec)| spec.grants.contains(&permission))
        .map(|(name, _)| *name)
        .collect();
    rels.sort_unstable();
    rels
}

/// Permissions implied by a relation change, used to target boundary-cache
/// invalidation. Unknown relations invalidate nothing.
pub fn implied_permissions(relation: &str) -> &'static [Permission] {
    relation_spec(relation).map(|s| s.grants).unwrap_or(&[])
}

/// True when the relation may link a subject and object in different tenants.
pub fn is_cross_tenant_allowed(relation: &str) -> bool {
    CROSS_TENANT_ALLOWED_RELATIONS.contains(&relation)
}

/// True when the relation is a group-membership edge.
pub fn is_membership_relation(relation: &str) -> bool {
    relation_spec(relation).map(|s| s.membership).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_round_trip() {
        for p in Permission::ALL {
            assert_eq!(p.as_str().parse::<Permission>().unwrap(), p);
        }
        assert!("root".parse::<Permission>().is_err());
    }

    #[test]
    fn test_owner_grants_everything() {
        let spec = relation_spec("direct_owner").unwrap();
        for p in Permission::ALL {
            assert!(spec.grants.contains(&p));
        }
    }

    #[test]
    fn test_viewer_grants_read_only() {
        let spec = relation_spec("viewer").unwrap();
        assert!(spec.grants.contains(&Permission::Read));
        assert!(!spec.grants.contains(&Permission::Write));
    }

    #[test]
    fn test_cross_tenant_allow_list() {
        assert!(is_cross_tenant_allowed("shared-viewer"));
        assert!(is_cross_tenant_allowed("shared-editor"));
        assert!(is_cross_tenant_allowed("shared-owner"));
        assert!(!is_cross_tenant_allowed("viewer"));
        assert!(!is_cross_tenant_allowed("editor"));
        assert!(!is_cross_tenant_allowed("owner"));
        assert!(!is_cross_tenant_allowed("member-of"));
    }

    #[test]
    fn test_zone_roles_not_inheritable() {
        assert!(!relation_spec("zone-admin").unwrap().inheritable);
        assert!(!relation_spec("zone-owner").unwrap().inheritable);
        assert!(relation_spec("viewer").unwrap().inheritable);
    }

    #[test]
    fn test_membership_relations() {
        assert!(is_membership_relation("member-of"));
        assert!(is_membership_relation("member"));
        assert!(!is_membership_relation("viewer"));
        assert!(!is_membership_relation("parent"));
    }

    #[test]
    fn test_relations_granting_write() {
        let rels = relations_granting(Permission::Write);
        assert!(rels.contains(&"editor"));
        assert!(rels.contains(&"direct_owner"));
        assert!(rels.contains(&"shared-editor"));
        assert!(!rels.contains(&"viewer"));
    }

    #[test]
    fn test_parent_grants_nothing() {
        assert!(implied_permissions("parent").is_empty());
        assert!(implied_permissions("no-such-relation").is_empty());
    }
}
