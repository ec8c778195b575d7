//! Optimistic mutation manager.
//!
//! # Lifecycle
//! ```text
//! begin    → snapshot current value, apply speculative value (Pending)
//! commit   → server value becomes the confirmed base (Committed)
//! rollback → previous snapshot restored exactly (RolledBack)
//! ```
//!
//! # Overlapping mutations on one key
//! - ClientWins: the newest value shows; older mutations are superseded and
//!   their rollback leaves state alone (unless it is the last one on the
//!   key, which restores the confirmed base), their commit only moves the base
//! - ServerWins: local state shows the last confirmed value
//! - Merge: the merge function combines the base with every pending value

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::optimistic::state::LocalState;

/// Combines the confirmed base with pending speculative values (oldest first).
pub type MergeFn = Arc<dyn Fn(Option<&Value>, &[Value]) -> Value + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    #[default]
    ClientWins,
    ServerWins,
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationContext {
    pub mutation_id: Uuid,
    pub target_key: String,
    pub previous_snapshot: Option<Value>,
    pub speculative_value: Value,
    pub conflict_strategy: ConflictStrategy,
    pub status: MutationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    #[error("mutation {id} already settled as {status:?}")]
    AlreadySettled { id: Uuid, status: MutationStatus },

    #[error("no merge function configured for conflicting mutations on '{0}'")]
    Conflict(String),
}

#[derive(Debug)]
struct Pending {
    id: Uuid,
    value: Value,
    superseded: bool,
    commits_at_begin: u64,
}

#[derive(Debug)]
struct KeyRecord {
    /// Last server-confirmed value (or the value before the first mutation).
    base: Option<Value>,
    pending: Vec<Pending>,
    strategy: ConflictStrategy,
    commits: u64,
}

impl KeyRecord {
    fn active_values(&self) -> Vec<Value> {
        self.pending
            .iter()
            .filter(|p| !p.superseded)
            .map(|p| p.value.clone())
            .collect()
    }
}

pub struct MutationManager {
    state: LocalState,
    merge_fn: Option<MergeFn>,
    records: Mutex<HashMap<String, KeyRecord>>,
}

impl std::fmt::Debug for MutationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationManager")
            .field("has_merge_fn", &self.merge_fn.is_some())
            .finish()
    }
}

impl MutationManager {
    pub fn new(state: LocalState, merge_fn: Option<MergeFn>) -> Self {
        Self {
            state,
            merge_fn,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, KeyRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> &LocalState {
        &self.state
    }

    /// Number of unsettled mutations on `key`.
    pub fn pending_on(&self, key: &str) -> usize {
        self.lock().get(key).map_or(0, |r| r.pending.len())
    }

    /// Snapshot the current value of `target_key` and apply `speculative`.
    pub fn begin(
        &self,
        target_key: &str,
        speculative: Value,
        strategy: ConflictStrategy,
    ) -> Result<MutationContext, MutationError> {
        let mut records = self.lock();
        let current = self.state.get(target_key);
        let record = records.entry(target_key.to_string()).or_insert_with(|| KeyRecord {
            base: current.clone(),
            pending: Vec::new(),
            strategy,
            commits: 0,
        });

        let conflicting = record.pending.iter().any(|p| !p.superseded);
        let visible = if !conflicting {
            speculative.clone()
        } else {
            match strategy {
                ConflictStrategy::ClientWins => {
                    for p in record.pending.iter_mut() {
                        p.superseded = true;
                    }
                    speculative.clone()
                }
                ConflictStrategy::ServerWins => match record.base.clone() {
                    Some(base) => base,
                    None => Value::Null,
                },
                ConflictStrategy::Merge => {
                    let Some(merge) = &self.merge_fn else {
                        tracing::warn!(target_key, "Conflicting mutation without merge function");
                        return Err(MutationError::Conflict(target_key.to_string()));
                    };
                    let mut values = record.active_values();
                    values.push(speculative.clone());
                    merge(record.base.as_ref(), &values)
                }
            }
        };

        let id = Uuid::new_v4();
        record.strategy = strategy;
        record.pending.push(Pending {
            id,
            value: speculative.clone(),
            superseded: false,
            commits_at_begin: record.commits,
        });
        if strategy == ConflictStrategy::ServerWins && conflicting && record.base.is_none() {
            self.state.remove(target_key);
        } else {
            self.state.set(target_key, visible);
        }

        tracing::debug!(
            mutation_id = %id,
            target_key,
            conflicting,
            strategy = ?strategy,
            "Mutation applied"
        );
        Ok(MutationContext {
            mutation_id: id,
            target_key: target_key.to_string(),
            previous_snapshot: current,
            speculative_value: speculative,
            conflict_strategy: strategy,
            status: MutationStatus::Pending,
        })
    }

    /// Confirm a mutation. `server_value` is what the server returned, or
    /// `None` to confirm the speculative value as sent.
    pub fn commit(
        &self,
        ctx: &mut MutationContext,
        server_value: Option<Value>,
    ) -> Result<(), MutationError> {
        let mut records = self.lock();
        let (record, pending) = take_pending(&mut records, ctx)?;

        let confirmed = server_value.unwrap_or_else(|| pending.value.clone());
        record.base = Some(confirmed);
        record.commits += 1;
        if !pending.superseded {
            self.show(&ctx.target_key, record);
        }
        if record.pending.is_empty() {
            records.remove(&ctx.target_key);
        }

        ctx.status = MutationStatus::Committed;
        tracing::debug!(mutation_id = %ctx.mutation_id, target_key = %ctx.target_key, "Mutation committed");
        Ok(())
    }

    /// Undo a mutation. Restores the snapshot taken by `begin` unless a newer
    /// mutation owns the visible value.
    pub fn rollback(&self, ctx: &mut MutationContext) -> Result<(), MutationError> {
        let mut records = self.lock();
        let (record, pending) = take_pending(&mut records, ctx)?;

        if !pending.superseded {
            if record.pending.iter().any(|p| !p.superseded) {
                self.show(&ctx.target_key, record);
            } else if record.commits == pending.commits_at_begin {
                self.state.restore(&ctx.target_key, ctx.previous_snapshot.clone());
            } else {
                self.state.restore(&ctx.target_key, record.base.clone());
            }
        } else if record.pending.is_empty() {
            // Last one out: fall back to the confirmed base.
            self.state.restore(&ctx.target_key, record.base.clone());
        }
        if record.pending.is_empty() {
            records.remove(&ctx.target_key);
        }

        ctx.status = MutationStatus::RolledBack;
        tracing::info!(mutation_id = %ctx.mutation_id, target_key = %ctx.target_key, "Mutation rolled back");
        Ok(())
    }

    /// Recompute the visible value from the base and the remaining mutations.
    fn show(&self, key: &str, record: &KeyRecord) {
        let active = record.active_values();
        if active.is_empty() {
            self.state.restore(key, record.base.clone());
            return;
        }
        match (record.strategy, &self.merge_fn) {
            (ConflictStrategy::Merge, Some(merge)) => {
                self.state.set(key, merge(record.base.as_ref(), &active));
            }
            (ConflictStrategy::ServerWins, _) => self.state.restore(key, record.base.clone()),
            _ => {
                if let Some(newest) = active.last() {
                    self.state.set(key, newest.clone());
                }
            }
        }
    }
}

fn take_pending<'a>(
    records: &'a mut HashMap<String, KeyRecord>,
    ctx: &MutationContext,
) -> Result<(&'a mut KeyRecord, Pending), MutationError> {
    let settled = || MutationError::AlreadySettled {
        id: ctx.mutation_id,
        status: ctx.status,
    };
    if ctx.status != MutationStatus::Pending {
        return Err(settled());
    }
    let record = records.get_mut(&ctx.target_key).ok_or_else(settled)?;
    let position = record
        .pending
        .iter()
        .position(|p| p.id == ctx.mutation_id)
        .ok_or_else(settled)?;
    let pending = record.pending.remove(position);
    Ok((record, pending))
}

/// Field-wise merge of JSON objects, later values winning per field.
/// Non-object values replace the accumulator wholesale.
pub fn shallow_merge(base: Option<&Value>, values: &[Value]) -> Value {
    let mut merged = base.cloned().unwrap_or(Value::Null);
    for value in values {
        match (&mut merged, value) {
            (Value::Object(acc), Value::Object(fields)) => {
                for (k, v) in fields {
                    acc.insert(k.clone(), v.clone());
                }
            }
            _ => merged = value.clone(),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager(merge: bool) -> MutationManager {
        let merge_fn = merge.then(|| Arc::new(shallow_merge) as MergeFn);
        MutationManager::new(LocalState::new(), merge_fn)
    }

    #[test]
    fn test_rollback_restores_exact_snapshot() {
        let m = manager(false);
        m.state().set("user:1", json!({"name": "A"}));

        let mut ctx = m.begin("user:1", json!({"name": "B"}), ConflictStrategy::ClientWins).unwrap();
        assert_eq!(m.state().get("user:1"), Some(json!({"name": "B"})));

        m.rollback(&mut ctx).unwrap();
        assert_eq!(m.state().get("user:1"), Some(json!({"name": "A"})));
        assert_eq!(ctx.status, MutationStatus::RolledBack);
        assert_eq!(m.pending_on("user:1"), 0);
    }

    #[test]
    fn test_rollback_of_new_key_removes_it() {
        let m = manager(false);
        let mut ctx = m.begin("todo:9", json!({"done": false}), ConflictStrategy::ClientWins).unwrap();
        m.rollback(&mut ctx).unwrap();
        assert_eq!(m.state().get("todo:9"), None);
    }

    #[test]
    fn test_settles_exactly_once() {
        let m = manager(false);
        let mut ctx = m.begin("k", json!(1), ConflictStrategy::ClientWins).unwrap();
        m.commit(&mut ctx, Some(json!(2))).unwrap();
        assert_eq!(m.state().get("k"), Some(json!(2)));

        assert!(matches!(m.rollback(&mut ctx), Err(MutationError::AlreadySettled { .. })));
        let mut stale = ctx.clone();
        stale.status = MutationStatus::Pending;
        assert!(m.commit(&mut stale, None).is_err());
        assert_eq!(m.state().get("k"), Some(json!(2)));
    }

    #[test]
    fn test_client_wins_supersedes_older_mutation() {
        let m = manager(false);
        m.state().set("k", json!("base"));
        let mut first = m.begin("k", json!("one"), ConflictStrategy::ClientWins).unwrap();
        let mut second = m.begin("k", json!("two"), ConflictStrategy::ClientWins).unwrap();

        m.rollback(&mut first).unwrap();
        assert_eq!(m.state().get("k"), Some(json!("two")));

        m.commit(&mut second, None).unwrap();
        assert_eq!(m.state().get("k"), Some(json!("two")));
    }

    #[test]
    fn test_rolling_back_both_mutations_restores_base() {
        let m = manager(false);
        m.state().set("k", json!("base"));
        let mut first = m.begin("k", json!("one"), ConflictStrategy::ClientWins).unwrap();
        let mut second = m.begin("k", json!("two"), ConflictStrategy::ClientWins).unwrap();

        m.rollback(&mut second).unwrap();
        assert_eq!(m.state().get("k"), Some(json!("one")));

        m.rollback(&mut first).unwrap();
        assert_eq!(m.state().get("k"), Some(json!("base")));
        assert_eq!(m.pending_on("k"), 0);
    }

    #[test]
    fn test_superseded_commit_moves_base_only() {
        let m = manager(false);
        m.state().set("k", json!("base"));
        let mut first = m.begin("k", json!("one"), ConflictStrategy::ClientWins).unwrap();
        let mut second = m.begin("k", json!("two"), ConflictStrategy::ClientWins).unwrap();

        m.commit(&mut first, Some(json!("one-confirmed"))).unwrap();
        assert_eq!(m.state().get("k"), Some(json!("two")));

        m.rollback(&mut second).unwrap();
        assert_eq!(m.state().get("k"), Some(json!("one-confirmed")));
    }

    #[test]
    fn test_server_wins_shows_confirmed_value() {
        let m = manager(false);
        m.state().set("k", json!("server"));
        let mut first = m.begin("k", json!("one"), ConflictStrategy::ServerWins).unwrap();
        assert_eq!(m.state().get("k"), Some(json!("one")));

        let _second = m.begin("k", json!("two"), ConflictStrategy::ServerWins).unwrap();
        assert_eq!(m.state().get("k"), Some(json!("server")));

        m.commit(&mut first, Some(json!("one-confirmed"))).unwrap();
        assert_eq!(m.state().get("k"), Some(json!("one-confirmed")));
    }

    #[test]
    fn test_merge_combines_pending_values() {
        let m = manager(true);
        m.state().set("k", json!({"a": 1, "b": 1}));
        let _first = m.begin("k", json!({"a": 2}), ConflictStrategy::Merge).unwrap();
        let _second = m.begin("k", json!({"b": 3}), ConflictStrategy::Merge).unwrap();
        assert_eq!(m.state().get("k"), Some(json!({"a": 2, "b": 3})));
    }

    #[test]
    fn test_merge_without_function_is_a_conflict() {
        let m = manager(false);
        let _first = m.begin("k", json!({"a": 2}), ConflictStrategy::Merge).unwrap();
        let err = m.begin("k", json!({"b": 3}), ConflictStrategy::Merge).unwrap_err();
        assert_eq!(err, MutationError::Conflict("k".into()));
        assert_eq!(m.state().get("k"), Some(json!({"a": 2})));
    }

    #[test]
    fn test_shallow_merge_last_writer_wins() {
        let merged = shallow_merge(
            Some(&json!({"a": 1, "b": 1})),
            &[json!({"a": 2}), json!({"a": 3, "c": 1})],
        );
        assert_eq!(merged, json!({"a": 3, "b": 1, "c": 1}));
        assert_eq!(shallow_merge(Some(&json!({"a": 1})), &[json!(5)]), json!(5));
    }
}
