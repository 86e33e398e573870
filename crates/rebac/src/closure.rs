//! Transitive group-membership closure.
//!
//! The evaluator never chases membership pointers at check time; it expands
//! subjects against this precomputed `(member, group, depth)` table. Rows are
//! maintained transactionally with membership-tuple changes so a query never
//! observes a closure row without its underlying tuple.

use crate::error::Result;
use chrono::Utc;
use nexus_models::EntityRef;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;

pub const DEFAULT_MAX_DEPTH: u32 = 10;

#[derive(Clone)]
pub struct GroupClosure {
    pool: SqlitePool,
    max_depth: u32,
}

impl GroupClosure {
    pub fn new(pool: SqlitePool, max_depth: u32) -> Self {
        Self {
            pool,
            max_depth: max_depth.max(1),
        }
    }

    /// All groups the member transitively belongs to.
    pub async fn groups_of(&self, member: &EntityRef) -> Result<Vec<EntityRef>> {
        let rows: Vec<SqliteRow> = sqlx::query(
            r#"
            SELECT group_type, group_id FROM rebac_group_closure
            WHERE member_type = ?1 AND member_id = ?2
            ORDER BY depth, group_id
            "#,
        )
        .bind(&member.entity_type)
        .bind(&member.entity_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| EntityRef::new(r.get::<String, _>("group_type"), r.get::<String, _>("group_id")))
            .collect())
    }

    /// All members that transitively reach the group, the group's own
    /// sub-groups included.
    pub async fn transitive_members_of(&self, group: &EntityRef) -> Result<Vec<EntityRef>> {
        let rows: Vec<SqliteRow> = sqlx::query(
            r#"
            SELECT member_type, member_id FROM rebac_group_closure
            WHERE group_type = ?1 AND group_id = ?2
            ORDER BY depth, member_id
            "#,
        )
        .bind(&group.entity_type)
        .bind(&group.entity_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| {
                EntityRef::new(r.get::<String, _>("member_type"), r.get::<String, _>("member_id"))
            })
            .collect())
    }

    /// Closure rows above a member: `(group, depth)` pairs.
    async fn groups_with_depth(&self, member: &EntityRef) -> Result<Vec<(EntityRef, u32)>> {
        let rows: Vec<SqliteRow> = sqlx::query(
            r#"
            SELECT group_type, group_id, depth FROM rebac_group_closure
            WHERE member_type = ?1 AND member_id = ?2
            "#,
        )
        .bind(&member.entity_type)
        .bind(&member.entity_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| {
                (
                    EntityRef::new(
                        r.get::<String, _>("group_type"),
                        r.get::<String, _>("group_id"),
                    ),
                    r.get::<i64, _>("depth") as u32,
                )
            })
            .collect())
    }

    /// Closure rows below a group: `(member, depth)` pairs.
    async fn members_with_depth(&self, group: &EntityRef) -> Result<Vec<(EntityRef, u32)>> {
        let rows: Vec<SqliteRow> = sqlx::query(
            r#"
            SELECT member_type, member_id, depth FROM rebac_group_closure
            WHERE group_type = ?1 AND group_id = ?2
            "#,
        )
        .bind(&group.entity_type)
        .bind(&group.entity_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| {
                (
                    EntityRef::new(
                        r.get::<String, _>("member_type"),
                        r.get::<String, _>("member_id"),
                    ),
                    r.get::<i64, _>("depth") as u32,
                )
            })
            .collect())
    }

    /// Fold a new membership edge into the closure.
    ///
    /// The new rows are the product of everything below `member` (its own
    /// transitive members, plus itself) and everything above `group` (its
    /// transitive groups, plus itself), capped at `max_depth`. Set expansion
    /// rather than pointer chasing, so cycles cannot recurse.
    pub async fn apply_membership_write(
        &self,
        member: &EntityRef,
        group: &EntityRef,
        tenant_id: &str,
    ) -> Result<()> {
        let below = {
            let mut v = self.members_with_depth(member).await?;
            v.push((member.clone(), 0));
            v
        };
        let above = {
            let mut v = self.groups_with_depth(group).await?;
            v.push((group.clone(), 0));
            v
        };

        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for (m, dm) in &below {
            for (g, dg) in &above {
                let depth = dm + dg + 1;
                if depth > self.max_depth {
                    continue;
                }
                // Self-membership through a cycle adds nothing.
                if m == g {
                    continue;
                }
                sqlx::query(
                    r#"
                    INSERT INTO rebac_group_closure
                        (member_type, member_id, group_type, group_id, tenant_id, depth, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    ON CONFLICT (member_type, member_id, group_type, group_id, tenant_id)
                    DO UPDATE SET depth = MIN(depth, excluded.depth),
                                  updated_at = excluded.updated_at
                    "#,
                )
                .bind(&m.entity_type)
                .bind(&m.entity_id)
                .bind(&g.entity_type)
                .bind(&g.entity_id)
                .bind(tenant_id)
                .bind(depth as i64)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;

        tracing::debug!(
            "Closure updated for {} member-of {} ({}x{} candidate rows)",
            member,
            group,
            below.len(),
            above.len()
        );
        Ok(())
    }

    /// Recompute the closure of the subtree affected by a membership delete.
    ///
    /// Everything at or below `member` may have lost paths upward, so each of
    /// those members gets its closure rebuilt from the surviving membership
    /// tuples by bounded BFS.
    pub async fn apply_membership_delete(&self, member: &EntityRef, _group: &EntityRef) -> Result<()> {
        let mut affected = self.transitive_members_of(member).await?;
        affected.push(member.clone());

        for m in &affected {
            self.recompute_member(m).await?;
        }
        tracing::debug!("Closure recomputed for {} members after delete", affected.len());
        Ok(())
    }

    /// Rebuild one member's closure rows from the membership tuples.
    async fn recompute_member(&self, member: &EntityRef) -> Result<()> {
        let mut reached: Vec<(EntityRef, u32, String)> = Vec::new();
        let mut seen: HashSet<EntityRef> = HashSet::new();
        seen.insert(member.clone());
        let mut frontier = vec![member.clone()];

        for depth in 1..=self.max_depth {
            if frontier.is_empty() {
                break;
            }
            let mut next = Vec::new();
            for node in &frontier {
                let rows: Vec<SqliteRow> = sqlx::query(
                    r#"
                    SELECT object_type, object_id, tenant_id FROM rebac_tuples
                    WHERE subject_type = ?1 AND subject_id = ?2
                      AND relation IN ('member', 'member-of')
                      AND (expires_at IS NULL OR expires_at > ?3)
                    "#,
                )
                .bind(&node.entity_type)
                .bind(&node.entity_id)
                .bind(Utc::now().timestamp())
                .fetch_all(&self.pool)
                .await?;

                for row in rows {
                    let group = EntityRef::new(
                        row.get::<String, _>("object_type"),
                        row.get::<String, _>("object_id"),
                    );
                    if seen.insert(group.clone()) {
                        reached.push((group.clone(), depth, row.get::<String, _>("tenant_id")));
                        next.push(group);
                    }
                }
            }
            frontier = next;
        }

        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM rebac_group_closure WHERE member_type = ?1 AND member_id = ?2")
            .bind(&member.entity_type)
            .bind(&member.entity_id)
            .execute(&mut *tx)
            .await?;
        for (group, depth, tenant_id) in &reached {
            sqlx::query(
                r#"
                INSERT INTO rebac_group_closure
                    (member_type, member_id, group_type, group_id, tenant_id, depth, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(&member.entity_type)
            .bind(&member.entity_id)
            .bind(&group.entity_type)
            .bind(&group.entity_id)
            .bind(tenant_id)
            .bind(*depth as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::{TupleStore, WriteTupleRequest};
    use nexus_database::{schema, Database};

    async fn setup() -> (TupleStore, GroupClosure) {
        let db = Database::in_memory().await.unwrap();
        schema::migrate(db.pool()).await.unwrap();
        (
            TupleStore::new(db.pool().clone()),
            GroupClosure::new(db.pool().clone(), DEFAULT_MAX_DEPTH),
        )
    }

    async fn add_membership(
        store: &TupleStore,
        closure: &GroupClosure,
        member: EntityRef,
        group: EntityRef,
    ) {
        let request = WriteTupleRequest::new(member.clone(), "member-of", group.clone(), "z1", "acme");
        store.write(&request).await.unwrap();
        closure.apply_membership_write(&member, &group, "acme").await.unwrap();
    }

    #[tokio::test]
    async fn test_direct_membership() {
        let (store, closure) = setup().await;
        add_membership(&store, &closure, EntityRef::user("alice"), EntityRef::group("devs")).await;

        let groups = closure.groups_of(&EntityRef::user("alice")).await.unwrap();
        assert_eq!(groups, vec![EntityRef::group("devs")]);
    }

    #[tokio::test]
    async fn test_transitive_membership_both_directions() {
        let (store, closure) = setup().await;
        // alice -> g1 -> g2, then linking g2 -> g3 must lift alice too.
        add_membership(&store, &closure, EntityRef::user("alice"), EntityRef::group("g1")).await;
        add_membership(&store, &closure, EntityRef::group("g1"), EntityRef::group("g2")).await;
        add_membership(&store, &closure, EntityRef::group("g2"), EntityRef::group("g3")).await;

        let groups = closure.groups_of(&EntityRef::user("alice")).await.unwrap();
        assert!(groups.contains(&EntityRef::group("g1")));
        assert!(groups.contains(&EntityRef::group("g2")));
        assert!(groups.contains(&EntityRef::group("g3")));

        let members = closure.transitive_members_of(&EntityRef::group("g3")).await.unwrap();
        assert!(members.contains(&EntityRef::user("alice")));
        assert!(members.contains(&EntityRef::group("g1")));
    }

    #[tokio::test]
    async fn test_delete_recomputes_subtree() {
        let (store, closure) = setup().await;
        add_membership(&store, &closure, EntityRef::user("alice"), EntityRef::group("g1")).await;
        add_membership(&store, &closure, EntityRef::group("g1"), EntityRef::group("g2")).await;

        // Remove alice from g1: tuple first, then closure recompute.
        let id = store
            .find_tuple_id(&EntityRef::user("alice"), "member-of", &EntityRef::group("g1"), "z1")
            .await
            .unwrap()
            .unwrap();
        store.delete(id).await.unwrap();
        closure
            .apply_membership_delete(&EntityRef::user("alice"), &EntityRef::group("g1"))
            .await
            .unwrap();

        let groups = closure.groups_of(&EntityRef::user("alice")).await.unwrap();
        assert!(groups.is_empty());

        // g1 itself is untouched.
        let g1_groups = closure.groups_of(&EntityRef::group("g1")).await.unwrap();
        assert_eq!(g1_groups, vec![EntityRef::group("g2")]);
    }

    #[tokio::test]
    async fn test_cycle_is_bounded() {
        let (store, closure) = setup().await;
        add_membership(&store, &closure, EntityRef::group("a"), EntityRef::group("b")).await;
        add_membership(&store, &closure, EntityRef::group("b"), EntityRef::group("a")).await;

        // No self-membership rows, no runaway depth.
        let groups = closure.groups_of(&EntityRef::group("a")).await.unwrap();
        assert_eq!(groups, vec![EntityRef::group("b")]);
    }

    #[tokio::test]
    async fn test_depth_cap() {
        let (store, closure) = {
            let db = Database::in_memory().await.unwrap();
            schema::migrate(db.pool()).await.unwrap();
            (
                TupleStore::new(db.pool().clone()),
                GroupClosure::new(db.pool().clone(), 2),
            )
        };
        add_membership(&store, &closure, EntityRef::user("alice"), EntityRef::group("g1")).await;
        add_membership(&store, &closure, EntityRef::group("g1"), EntityRef::group("g2")).await;
        add_membership(&store, &closure, EntityRef::group("g2"), EntityRef::group("g3")).await;

        let groups = closure.groups_of(&EntityRef::user("alice")).await.unwrap();
        assert!(groups.contains(&EntityRef::group("g1")));
        assert!(groups.contains(&EntityRef::group("g2")));
        // Depth 3 exceeds the cap of 2.
        assert!(!groups.contains(&EntityRef::group("g3")));
    }
}
