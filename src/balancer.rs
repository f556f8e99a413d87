//! Instance selection for balanced sends.
//!
//! Two invariants hold at once:
//!
//! - contact affinity: the same contact never lands on the instance it
//!   just used, and cycles through every active instance before any
//!   repeat (tracked per contact in `used_instances`);
//! - global fairness: a round-robin cursor shared by all contacts of the
//!   group spreads load evenly across instances.
//!
//! Concurrent picks for the same contact are serialized through a
//! per-key async lock; picks for different contacts proceed in parallel
//! and the global cursor stays best-effort.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::groups;
use crate::registry::InstanceRegistry;
use crate::rotation::{GlobalRotation, ROTATION_TTL, RotationDescriptor, RotationStore};

#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    #[error("instance group not found: {0}")]
    GroupNotFound(String),
    #[error("instance group is disabled: {0}")]
    GroupDisabled(String),
    #[error("No active instances available")]
    NoActiveInstance,
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Rotation snapshot returned alongside the pick, echoed in the
/// balanced-send response.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BalancingInfo {
    pub contact: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub last_used_instance: String,
    pub used_instances_in_cycle: Vec<String>,
    pub rotation_count: i64,
    pub global_last_used_instance: String,
    pub global_rotation_count: i64,
}

pub struct Balancer {
    db: PgPool,
    store: Arc<RotationStore>,
    registry: Arc<InstanceRegistry>,
    contact_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Balancer {
    pub fn new(db: PgPool, store: Arc<RotationStore>, registry: Arc<InstanceRegistry>) -> Self {
        Self {
            db,
            store,
            registry,
            contact_locks: DashMap::new(),
        }
    }

    /// Pick an instance from `alias`'s pool for `contact`.
    pub async fn select_for_contact_in_group(
        &self,
        alias: &str,
        contact: &str,
    ) -> Result<(String, Uuid, BalancingInfo), BalancerError> {
        let group = groups::get_by_alias(&self.db, alias)
            .await?
            .ok_or_else(|| BalancerError::GroupNotFound(alias.to_string()))?;
        if !group.enabled {
            return Err(BalancerError::GroupDisabled(alias.to_string()));
        }

        let candidates = self.active_sorted(&group.instances.0);
        if candidates.is_empty() {
            return Err(BalancerError::NoActiveInstance);
        }

        let contact_norm = normalize_contact(contact);
        let contact_key = format!("group_rotation:{}:{}", group.id, contact_norm);
        let global_key = format!("group_rotation:{}:global", group.id);

        let (pick, mut info) = self
            .select_locked(&contact_key, &global_key, &candidates, &contact_norm)
            .await;
        info.group_id = Some(group.id.to_string());

        tracing::debug!(
            "balancer: group {} contact {} -> {} (cycle {}/{})",
            group.alias,
            contact_norm,
            pick,
            info.used_instances_in_cycle.len(),
            candidates.len()
        );
        Ok((pick, group.id, info))
    }

    /// Ungrouped variant: pick from an explicit instance list using the
    /// top-level rotation keys. Shares no state with the grouped path.
    pub async fn select_for_contact(
        &self,
        contact: &str,
        available: &[String],
    ) -> Result<(String, BalancingInfo), BalancerError> {
        let candidates = self.active_sorted(available);
        if candidates.is_empty() {
            return Err(BalancerError::NoActiveInstance);
        }

        let contact_norm = normalize_contact(contact);
        let contact_key = format!("instance_rotation:{}", contact_norm);

        let (pick, info) = self
            .select_locked(&contact_key, "global_rotation", &candidates, &contact_norm)
            .await;
        Ok((pick, info))
    }

    /// Active members of the pool, lexicographically sorted so the scan
    /// order is deterministic regardless of membership iteration order.
    fn active_sorted(&self, members: &[String]) -> Vec<String> {
        let mut candidates = self.registry.open_subset(members);
        candidates.sort();
        candidates
    }

    /// Serialize the read-modify-write per contact key, then run the
    /// selection scan. Lock scope covers both descriptor updates so two
    /// simultaneous picks for one contact cannot double-assign.
    async fn select_locked(
        &self,
        contact_key: &str,
        global_key: &str,
        candidates: &[String],
        contact: &str,
    ) -> (String, BalancingInfo) {
        let lock = self
            .contact_locks
            .entry(contact_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let mut contact_desc: RotationDescriptor =
            self.store.get(contact_key).await.unwrap_or_default();
        let mut global: GlobalRotation = self.store.get(global_key).await.unwrap_or_default();

        let pick = scan(candidates, &contact_desc, &global);

        // Contact descriptor: record the pick; when the cycle covers every
        // candidate, reset it to just the pick and bump the cycle counter.
        if !contact_desc.has_used(&pick) {
            contact_desc.used_instances.push(pick.clone());
        }
        if contact_desc.used_instances.len() >= candidates.len() {
            contact_desc.used_instances = vec![pick.clone()];
            contact_desc.rotation_count += 1;
        }
        contact_desc.last_used_instance = Some(pick.clone());
        self.store.set(contact_key, &contact_desc, ROTATION_TTL).await;

        global.last_used_instance = Some(pick.clone());
        global.rotation_count += 1;
        self.store.set(global_key, &global, ROTATION_TTL).await;

        let info = BalancingInfo {
            contact: contact.to_string(),
            group_id: None,
            last_used_instance: pick.clone(),
            used_instances_in_cycle: contact_desc.used_instances.clone(),
            rotation_count: contact_desc.rotation_count,
            global_last_used_instance: pick.clone(),
            global_rotation_count: global.rotation_count,
        };
        (pick, info)
    }
}

/// The selection scan over sorted candidates.
///
/// Start where the global cursor points (position of its last pick plus
/// one; a cursor pointing at an instance that left the pool restarts at
/// zero). First pass skips the contact's last-used instance and anything
/// already used this cycle; second pass only skips the last-used
/// instance; last resort takes the cursor position itself.
fn scan(candidates: &[String], contact: &RotationDescriptor, global: &GlobalRotation) -> String {
    let len = candidates.len();
    let start = global
        .last_used_instance
        .as_deref()
        .and_then(|last| candidates.iter().position(|c| c == last))
        .map(|i| (i + 1) % len)
        .unwrap_or(0);

    let differs_from_last =
        |c: &str| contact.last_used_instance.as_deref() != Some(c);

    for offset in 0..len {
        let c = &candidates[(start + offset) % len];
        if differs_from_last(c) && !contact.has_used(c) {
            return c.clone();
        }
    }
    for offset in 0..len {
        let c = &candidates[(start + offset) % len];
        if differs_from_last(c) {
            return c.clone();
        }
    }
    candidates[start].clone()
}

/// Contacts are keyed by their digits only, so `+55 11 9999-0001` and
/// `5511Nine...` variants collapse to one rotation identity.
pub fn normalize_contact(contact: &str) -> String {
    contact.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionState;

    fn balancer_with_open(instances: &[&str]) -> Balancer {
        let registry = Arc::new(InstanceRegistry::new());
        for name in instances {
            registry.set_state(name, ConnectionState::Open);
        }
        let db = PgPool::connect_lazy("postgres://test@localhost:1/test").expect("lazy pool");
        Balancer::new(db, Arc::new(RotationStore::new(None)), registry)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn distinct_contacts_rotate_round_robin() {
        let b = balancer_with_open(&["a", "b", "c"]);
        let pool = names(&["a", "b", "c"]);

        let mut picks = Vec::new();
        for i in 1..=6 {
            let contact = format!("551199999999{}", i);
            let (pick, _) = b.select_for_contact(&contact, &pool).await.unwrap();
            picks.push(pick);
        }
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn same_contact_cycles_all_instances_before_repeat() {
        let b = balancer_with_open(&["a", "b", "c"]);
        let pool = names(&["a", "b", "c"]);

        let mut picks = Vec::new();
        for _ in 0..3 {
            let (pick, _) = b.select_for_contact("5511111111111", &pool).await.unwrap();
            picks.push(pick);
        }
        let mut sorted = picks.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 3, "three picks must be distinct: {:?}", picks);

        // Fourth pick starts a new cycle but never repeats the third.
        let (fourth, info) = b.select_for_contact("5511111111111", &pool).await.unwrap();
        assert_ne!(fourth, picks[2]);
        assert!(info.rotation_count >= 1);
    }

    #[tokio::test]
    async fn shrunk_pool_only_uses_remaining_instances() {
        let b = balancer_with_open(&["a", "b", "c"]);
        let full = names(&["a", "b", "c"]);
        for i in 0..6 {
            let contact = format!("55110000000{:02}", i);
            b.select_for_contact(&contact, &full).await.unwrap();
        }

        let shrunk = names(&["a", "c"]);
        for i in 6..9 {
            let contact = format!("55110000000{:02}", i);
            let (pick, _) = b.select_for_contact(&contact, &shrunk).await.unwrap();
            assert!(pick == "a" || pick == "c", "got {}", pick);
        }
    }

    #[tokio::test]
    async fn closed_instances_are_not_candidates() {
        let b = balancer_with_open(&["a"]);
        b.registry.set_state("b", ConnectionState::Connecting);
        let pool = names(&["a", "b"]);

        for _ in 0..3 {
            let (pick, _) = b.select_for_contact("55119", &pool).await.unwrap();
            assert_eq!(pick, "a");
        }
    }

    #[tokio::test]
    async fn no_open_instance_is_an_error() {
        let b = balancer_with_open(&[]);
        b.registry.set_state("a", ConnectionState::Close);
        let pool = names(&["a"]);

        let err = b.select_for_contact("55119", &pool).await.unwrap_err();
        assert!(matches!(err, BalancerError::NoActiveInstance));
    }

    #[tokio::test]
    async fn single_instance_pool_repeats() {
        let b = balancer_with_open(&["only"]);
        let pool = names(&["only"]);
        for _ in 0..3 {
            let (pick, _) = b.select_for_contact("55110", &pool).await.unwrap();
            assert_eq!(pick, "only");
        }
    }

    #[tokio::test]
    async fn global_cursor_ignores_departed_instance() {
        let b = balancer_with_open(&["a", "b", "c"]);
        // Seed the global cursor with an instance not in the pool anymore.
        b.store
            .set(
                "global_rotation",
                &GlobalRotation {
                    last_used_instance: Some("zz".into()),
                    rotation_count: 7,
                },
                ROTATION_TTL,
            )
            .await;

        let (pick, _) = b
            .select_for_contact("55111", &names(&["a", "b", "c"]))
            .await
            .unwrap();
        assert_eq!(pick, "a");
    }

    #[tokio::test]
    async fn concurrent_picks_for_same_contact_stay_distinct() {
        let b = Arc::new(balancer_with_open(&["a", "b", "c"]));
        let pool = names(&["a", "b", "c"]);

        let mut handles = Vec::new();
        for _ in 0..3 {
            let b = b.clone();
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                b.select_for_contact("5511222222222", &pool).await.unwrap().0
            }));
        }
        let mut picks = Vec::new();
        for h in handles {
            picks.push(h.await.unwrap());
        }
        picks.sort();
        picks.dedup();
        assert_eq!(picks.len(), 3, "serialized same-contact picks must cover the pool");
    }

    #[test]
    fn contact_normalization_strips_non_digits() {
        assert_eq!(normalize_contact("+55 11 99999-0001"), "5511999990001");
        assert_eq!(normalize_contact("5511@c.us"), "5511");
        assert_eq!(normalize_contact("abc"), "");
    }
}
