//! VersionStore: append-only config versions plus the signed audit trail
//!
//! Mutations on one config id are serialized by a per-id lock; the new version
//! row and its audit record are written in a single transaction. The scope
//! cache entry for the config's (scope, scope_id) is invalidated before the
//! mutating call returns.

use chrono::Utc;
use dashmap::DashMap;
use rusqlite::Connection;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use crate::db::{self, Database};
use crate::error::{EngineError, EngineResult};
use crate::provenance::{content_hash, verify_audit_chain, ChainVerification, Provenance};
use crate::resolver::ScopeCache;
use crate::types::{
    AuditAction, AuditRecord, Config, ConfigFilter, ConfigPayload, ConfigUpdate, FieldChange,
    NewConfig,
};
use crate::validate;

pub struct VersionStore {
    db: Arc<Database>,
    provenance: Arc<Provenance>,
    cache: Arc<ScopeCache>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    max_parent_depth: usize,
}

/// What a mutation writes, before version numbering
struct Draft {
    name: String,
    enabled: bool,
    deleted: bool,
    payload: ConfigPayload,
    /// Stored bytes, when they must be kept verbatim (rollback)
    payload_json: Option<String>,
}

impl VersionStore {
    pub fn new(
        db: Arc<Database>,
        provenance: Arc<Provenance>,
        cache: Arc<ScopeCache>,
        max_parent_depth: usize,
    ) -> Self {
        Self {
            db,
            provenance,
            cache,
            locks: DashMap::new(),
            max_parent_depth,
        }
    }

    pub fn cache(&self) -> &Arc<ScopeCache> {
        &self.cache
    }

    fn lock_for(&self, config_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(config_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` inside the critical section for `config_id`
    fn serialized<T>(&self, config_id: &str, f: impl FnOnce() -> EngineResult<T>) -> EngineResult<T> {
        let lock = self.lock_for(config_id);
        let _guard = lock
            .lock()
            .map_err(|_| EngineError::Storage(format!("lock for {} poisoned", config_id)))?;
        f()
    }

    // ========================================================================
    // MUTATIONS
    // ========================================================================

    /// Create a config at version 1
    pub fn create(&self, new: NewConfig, user_id: &str) -> EngineResult<Config> {
        validate::validate_name(&new.name)?;
        validate::validate_scope(new.scope, new.scope_id.as_deref())?;

        let mut payload = new.payload;
        if let Some(keywords) = payload.keywords.as_mut() {
            validate::normalize_keywords(keywords);
        }
        validate::validate_payload(&payload)?;

        let config_id = uuid::Uuid::new_v4().to_string();
        self.db
            .with_conn(|conn| self.check_parents(conn, &config_id, &payload))?;

        let draft = Draft {
            name: new.name.trim().to_string(),
            enabled: true,
            deleted: false,
            payload,
            payload_json: None,
        };

        self.serialized(&config_id, || {
            let template = Config {
                config_id: config_id.clone(),
                version: 0,
                name: String::new(),
                scope: new.scope,
                scope_id: new.scope_id.clone(),
                enabled: false,
                deleted_at: None,
                payload: ConfigPayload::default(),
                payload_hash: String::new(),
                created_by: user_id.to_string(),
                created_at: Utc::now(),
            };
            self.append(None, &template, draft, user_id, AuditAction::Create, None)
        })
    }

    /// Write version N+1 with the update's fields applied over version N
    pub fn update(
        &self,
        config_id: &str,
        update: ConfigUpdate,
        user_id: &str,
        reason: Option<&str>,
    ) -> EngineResult<Config> {
        if let Some(name) = &update.name {
            validate::validate_name(name)?;
        }

        self.serialized(config_id, || {
            let latest = self.latest_live(config_id)?;

            if let Some(expected) = update.expected_version {
                if expected != latest.version {
                    return Err(EngineError::Conflict {
                        config_id: config_id.to_string(),
                        expected,
                        actual: latest.version,
                    });
                }
            }

            let mut payload = update.apply(&latest.payload);
            if let Some(keywords) = payload.keywords.as_mut() {
                validate::normalize_keywords(keywords);
            }
            validate::validate_payload(&payload)?;
            self.db
                .with_conn(|conn| self.check_parents(conn, config_id, &payload))?;

            let draft = Draft {
                name: update
                    .name
                    .as_deref()
                    .map(|n| n.trim().to_string())
                    .unwrap_or_else(|| latest.name.clone()),
                enabled: latest.enabled,
                deleted: false,
                payload,
                payload_json: None,
            };
            self.append(Some(&latest), &latest, draft, user_id, AuditAction::Update, reason)
        })
    }

    /// Flip `enabled`. Setting the current state is a no-op returning the latest version.
    pub fn toggle(&self, config_id: &str, enabled: bool, user_id: &str) -> EngineResult<Config> {
        self.serialized(config_id, || {
            let latest = self.latest_live(config_id)?;
            if latest.enabled == enabled {
                return Ok(latest);
            }

            let draft = Draft {
                name: latest.name.clone(),
                enabled,
                deleted: false,
                payload: latest.payload.clone(),
                payload_json: self.stored_payload(config_id, latest.version)?,
            };
            let action = if enabled {
                AuditAction::Enable
            } else {
                AuditAction::Disable
            };
            self.append(Some(&latest), &latest, draft, user_id, action, None)
        })
    }

    /// Soft delete. Deleting an already-deleted config writes nothing.
    pub fn delete(&self, config_id: &str, user_id: &str) -> EngineResult<Config> {
        self.serialized(config_id, || {
            let latest = self
                .db
                .with_conn(|conn| db::latest_version(conn, config_id))?
                .ok_or_else(|| EngineError::not_found("config", config_id))?;
            if latest.is_deleted() {
                return Ok(latest);
            }

            let draft = Draft {
                name: latest.name.clone(),
                enabled: latest.enabled,
                deleted: true,
                payload: latest.payload.clone(),
                payload_json: self.stored_payload(config_id, latest.version)?,
            };
            self.append(Some(&latest), &latest, draft, user_id, AuditAction::Delete, None)
        })
    }

    /// Copy a historical version's payload into a new version. Un-deletes the config.
    pub fn rollback(&self, config_id: &str, to_version: u32, user_id: &str) -> EngineResult<Config> {
        self.rollback_with(config_id, to_version, user_id, None)
    }

    pub fn rollback_with(
        &self,
        config_id: &str,
        to_version: u32,
        user_id: &str,
        reason: Option<&str>,
    ) -> EngineResult<Config> {
        self.serialized(config_id, || {
            let (latest, target) = self.db.with_conn(|conn| {
                let latest = db::latest_version(conn, config_id)?
                    .ok_or_else(|| EngineError::not_found("config", config_id))?;
                let target = db::get_version(conn, config_id, to_version)?.ok_or_else(|| {
                    EngineError::not_found("config version", format!("{}@v{}", config_id, to_version))
                })?;
                Ok((latest, target))
            })?;

            // The target's parent chain may have changed since it was written
            self.db
                .with_conn(|conn| self.check_parents(conn, config_id, &target.payload))?;

            let draft = Draft {
                name: target.name.clone(),
                enabled: target.enabled,
                deleted: false,
                payload: target.payload.clone(),
                payload_json: self.stored_payload(config_id, target.version)?,
            };
            self.append(Some(&latest), &latest, draft, user_id, AuditAction::Rollback, reason)
        })
    }

    /// Number, persist and audit one new version
    fn append(
        &self,
        previous: Option<&Config>,
        template: &Config,
        draft: Draft,
        user_id: &str,
        action: AuditAction,
        reason: Option<&str>,
    ) -> EngineResult<Config> {
        let now = Utc::now();
        let payload_json = match draft.payload_json {
            Some(json) => json,
            None => serde_json::to_string(&draft.payload)?,
        };

        let version = previous.map_or(1, |p| p.version + 1);
        let config = Config {
            config_id: template.config_id.clone(),
            version,
            name: draft.name,
            scope: template.scope,
            scope_id: template.scope_id.clone(),
            enabled: draft.enabled,
            deleted_at: if draft.deleted {
                Some(previous.and_then(|p| p.deleted_at).unwrap_or(now))
            } else {
                None
            },
            payload: draft.payload,
            payload_hash: content_hash(payload_json.as_bytes()),
            created_by: user_id.to_string(),
            created_at: now,
        };

        let diff = diff_configs(previous, &config)?;

        let record = self.db.with_tx(|tx| {
            db::insert_version(tx, &config, &payload_json)?;

            let mut record = AuditRecord {
                seq: 0,
                config_id: config.config_id.clone(),
                user_id: user_id.to_string(),
                action,
                previous_version: previous.map(|p| p.version),
                new_version: version,
                diff,
                reason: reason.map(str::to_string),
                created_at: now,
                content_hash: String::new(),
                previous_hash: db::latest_audit_hash(tx, &config.config_id)?,
                signature: String::new(),
                agent_pubkey: String::new(),
            };
            self.provenance.seal(&mut record);
            record.seq = db::insert_audit(tx, &record)?;
            Ok(record)
        })?;

        self.cache.invalidate(config.scope, config.scope_id.as_deref());

        tracing::info!(
            config_id = %config.config_id,
            action = action.as_str(),
            version = config.version,
            audit_seq = record.seq,
            "config mutated"
        );

        Ok(config)
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Latest version, unless the config is deleted
    pub fn get_by_id(&self, config_id: &str) -> EngineResult<Config> {
        self.latest_live(config_id)
    }

    pub fn get_version(&self, config_id: &str, version: u32) -> EngineResult<Config> {
        self.db
            .with_conn(|conn| db::get_version(conn, config_id, version))?
            .ok_or_else(|| EngineError::not_found("config version", format!("{}@v{}", config_id, version)))
    }

    /// Latest version including deleted configs, for callers that inspect history
    pub fn latest(&self, config_id: &str) -> EngineResult<Config> {
        self.db
            .with_conn(|conn| db::latest_version(conn, config_id))?
            .ok_or_else(|| EngineError::not_found("config", config_id))
    }

    /// All versions, oldest first
    pub fn list_versions(&self, config_id: &str) -> EngineResult<Vec<Config>> {
        let versions = self.db.with_conn(|conn| db::list_versions(conn, config_id))?;
        if versions.is_empty() {
            return Err(EngineError::not_found("config", config_id));
        }
        Ok(versions)
    }

    /// Audit records, oldest first
    pub fn audit(&self, config_id: &str) -> EngineResult<Vec<AuditRecord>> {
        let records = self.db.with_conn(|conn| db::audit_for(conn, config_id))?;
        if records.is_empty() {
            return Err(EngineError::not_found("config", config_id));
        }
        Ok(records)
    }

    pub fn verify_audit(&self, config_id: &str) -> EngineResult<ChainVerification> {
        let records = self.audit(config_id)?;
        Ok(verify_audit_chain(&records))
    }

    pub fn list(&self, filter: &ConfigFilter) -> EngineResult<Vec<Config>> {
        self.db.with_conn(|conn| db::list_latest(conn, filter))
    }

    fn latest_live(&self, config_id: &str) -> EngineResult<Config> {
        self.db
            .with_conn(|conn| db::latest_version(conn, config_id))?
            .filter(|c| !c.is_deleted())
            .ok_or_else(|| EngineError::not_found("config", config_id))
    }

    fn stored_payload(&self, config_id: &str, version: u32) -> EngineResult<Option<String>> {
        self.db
            .with_conn(|conn| db::get_payload_json(conn, config_id, version))
    }

    /// Parent must exist and be live; the chain must neither loop back nor
    /// exceed the depth limit. Also validates the payload as it will resolve.
    fn check_parents(&self, conn: &Connection, config_id: &str, payload: &ConfigPayload) -> EngineResult<()> {
        let mut effective = payload.clone();
        let mut visited: HashSet<String> = HashSet::from([config_id.to_string()]);
        let mut next = payload.parent_config_id.clone();
        let mut depth = 0;

        while let Some(parent_id) = next {
            if !visited.insert(parent_id.clone()) {
                return Err(EngineError::Validation(format!(
                    "parent_config_id of {} loops back to {}",
                    config_id, parent_id
                )));
            }
            depth += 1;
            if depth > self.max_parent_depth {
                return Err(EngineError::Validation(format!(
                    "parent chain of {} is deeper than {}",
                    config_id, self.max_parent_depth
                )));
            }

            let parent = db::latest_version(conn, &parent_id)?.filter(|c| !c.is_deleted());
            let Some(parent) = parent else {
                if depth == 1 {
                    return Err(EngineError::Validation(format!(
                        "parent config {} does not exist",
                        parent_id
                    )));
                }
                break;
            };
            effective = effective.overlay(&parent.payload);
            next = parent.payload.parent_config_id.clone();
        }

        validate::validate_effective(&effective)
    }
}

/// Field-level before/after of everything a version carries
fn diff_configs(before: Option<&Config>, after: &Config) -> EngineResult<Vec<FieldChange>> {
    let mut changes = Vec::new();

    let before_name = before.map(|b| Value::from(b.name.clone())).unwrap_or(Value::Null);
    push_change(&mut changes, "name", before_name, Value::from(after.name.clone()));

    let before_enabled = before.map(|b| Value::from(b.enabled)).unwrap_or(Value::Null);
    push_change(&mut changes, "enabled", before_enabled, Value::from(after.enabled));

    let before_deleted = before
        .and_then(|b| b.deleted_at)
        .map(|d| Value::from(d.to_rfc3339()))
        .unwrap_or(Value::Null);
    let after_deleted = after
        .deleted_at
        .map(|d| Value::from(d.to_rfc3339()))
        .unwrap_or(Value::Null);
    push_change(&mut changes, "deleted_at", before_deleted, after_deleted);

    let before_payload = match before {
        Some(b) => serde_json::to_value(&b.payload)?,
        None => Value::Object(Default::default()),
    };
    let after_payload = serde_json::to_value(&after.payload)?;
    if let (Value::Object(b), Value::Object(a)) = (&before_payload, &after_payload) {
        let keys: BTreeSet<&String> = b.keys().chain(a.keys()).collect();
        for key in keys {
            push_change(
                &mut changes,
                key,
                b.get(key).cloned().unwrap_or(Value::Null),
                a.get(key).cloned().unwrap_or(Value::Null),
            );
        }
    }

    Ok(changes)
}

fn push_change(changes: &mut Vec<FieldChange>, field: &str, before: Value, after: Value) {
    if before != after {
        changes.push(FieldChange {
            field: field.to_string(),
            before,
            after,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Mode, Patch, Scope, Thresholds};
    use proptest::prelude::*;

    fn store() -> VersionStore {
        VersionStore::new(
            Arc::new(Database::open_in_memory().unwrap()),
            Arc::new(Provenance::ephemeral()),
            Arc::new(ScopeCache::new(100)),
            8,
        )
    }

    fn new_config(scope: Scope, scope_id: Option<&str>) -> NewConfig {
        NewConfig {
            name: "support".into(),
            scope,
            scope_id: scope_id.map(str::to_string),
            payload: ConfigPayload {
                mode: Some(Mode::Keyword),
                ..Default::default()
            },
        }
    }

    fn thresholds(n: f64, m: f64, p: f64) -> Thresholds {
        Thresholds {
            negative: n,
            neutral: m,
            positive: p,
            min_confidence: None,
        }
    }

    fn update_thresholds(t: Thresholds) -> ConfigUpdate {
        ConfigUpdate {
            thresholds: Patch::Set(t),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_writes_v1_and_audit() {
        let store = store();
        let config = store.create(new_config(Scope::Global, None), "alice").unwrap();
        assert_eq!(config.version, 1);
        assert!(config.enabled);

        let audit = store.audit(&config.config_id).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::Create);
        assert_eq!(audit[0].previous_version, None);
        assert!(audit[0].diff.iter().any(|c| c.field == "mode"));
    }

    #[test]
    fn test_invalid_config_never_stored() {
        let store = store();
        let mut bad = new_config(Scope::Global, None);
        bad.payload.thresholds = Some(thresholds(0.8, 0.5, 0.2));
        assert!(matches!(
            store.create(bad, "alice"),
            Err(EngineError::Validation(_))
        ));
        assert!(store.list(&ConfigFilter::default()).unwrap().is_empty());

        let config = store.create(new_config(Scope::Global, None), "alice").unwrap();
        let err = store
            .update(&config.config_id, update_thresholds(thresholds(0.8, 0.5, 0.2)), "alice", None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(store.list_versions(&config.config_id).unwrap().len(), 1);
        assert_eq!(store.audit(&config.config_id).unwrap().len(), 1);
    }

    #[test]
    fn test_update_carries_unset_fields_forward() {
        let store = store();
        let mut create = new_config(Scope::Company, Some("co-1"));
        create.payload.thresholds = Some(thresholds(0.3, 0.5, 0.7));
        let v1 = store.create(create, "alice").unwrap();

        let update = ConfigUpdate {
            name: Some("renamed".into()),
            ..Default::default()
        };
        let v2 = store.update(&v1.config_id, update, "bob", Some("rename")).unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.name, "renamed");
        assert_eq!(v2.payload.thresholds, v1.payload.thresholds);
        assert_eq!(v2.payload.mode, Some(Mode::Keyword));

        let audit = store.audit(&v1.config_id).unwrap();
        assert_eq!(audit[1].reason.as_deref(), Some("rename"));
        assert_eq!(audit[1].diff.len(), 1);
        assert_eq!(audit[1].diff[0].field, "name");
    }

    #[test]
    fn test_expected_version_conflict() {
        let store = store();
        let v1 = store.create(new_config(Scope::Global, None), "alice").unwrap();
        store
            .update(&v1.config_id, update_thresholds(thresholds(0.3, 0.5, 0.7)), "a", None)
            .unwrap();

        let stale = ConfigUpdate {
            expected_version: Some(1),
            ..update_thresholds(thresholds(0.2, 0.5, 0.8))
        };
        let err = store.update(&v1.config_id, stale, "b", None).unwrap_err();
        assert!(matches!(err, EngineError::Conflict { expected: 1, actual: 2, .. }));
    }

    #[test]
    fn test_toggle_noop_and_flip() {
        let store = store();
        let v1 = store.create(new_config(Scope::Global, None), "alice").unwrap();

        let same = store.toggle(&v1.config_id, true, "alice").unwrap();
        assert_eq!(same.version, 1);

        let off = store.toggle(&v1.config_id, false, "alice").unwrap();
        assert_eq!(off.version, 2);
        assert!(!off.enabled);
        let audit = store.audit(&v1.config_id).unwrap();
        assert_eq!(audit.last().unwrap().action, AuditAction::Disable);
    }

    #[test]
    fn test_delete_idempotent_and_terminal() {
        let store = store();
        let v1 = store.create(new_config(Scope::Global, None), "alice").unwrap();

        let deleted = store.delete(&v1.config_id, "alice").unwrap();
        assert_eq!(deleted.version, 2);
        assert!(deleted.is_deleted());

        let again = store.delete(&v1.config_id, "alice").unwrap();
        assert_eq!(again.version, 2);
        assert_eq!(store.audit(&v1.config_id).unwrap().len(), 2);

        assert!(matches!(
            store.get_by_id(&v1.config_id),
            Err(EngineError::NotFound { .. })
        ));
        assert!(matches!(
            store.update(&v1.config_id, ConfigUpdate::default(), "alice", None),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_rollback_copies_payload_bytes_and_undeletes() {
        let store = store();
        let mut create = new_config(Scope::Global, None);
        create.payload.thresholds = Some(thresholds(0.3, 0.5, 0.7));
        let v1 = store.create(create, "alice").unwrap();
        store
            .update(&v1.config_id, update_thresholds(thresholds(0.1, 0.5, 0.9)), "a", None)
            .unwrap();
        store.delete(&v1.config_id, "a").unwrap();

        let restored = store.rollback(&v1.config_id, 1, "bob").unwrap();
        assert_eq!(restored.version, 4);
        assert!(!restored.is_deleted());
        assert_eq!(restored.payload_hash, v1.payload_hash);

        let bytes = |v| {
            store
                .db
                .with_conn(|c| db::get_payload_json(c, &v1.config_id, v))
                .unwrap()
                .unwrap()
        };
        assert_eq!(bytes(1), bytes(4));

        let audit = store.audit(&v1.config_id).unwrap();
        let last = audit.last().unwrap();
        assert_eq!(last.action, AuditAction::Rollback);
        assert_eq!(last.previous_version, Some(3));
        assert_eq!(last.new_version, 4);
    }

    #[test]
    fn test_rollback_unknown_version() {
        let store = store();
        let v1 = store.create(new_config(Scope::Global, None), "alice").unwrap();
        assert!(matches!(
            store.rollback(&v1.config_id, 7, "alice"),
            Err(EngineError::NotFound { .. })
        ));
        assert!(matches!(
            store.rollback("missing", 1, "alice"),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_parent_must_exist_and_not_loop() {
        let store = store();
        let mut orphan = new_config(Scope::Campaign, Some("camp"));
        orphan.payload.parent_config_id = Some("nope".into());
        assert!(matches!(store.create(orphan, "a"), Err(EngineError::Validation(_))));

        let a = store.create(new_config(Scope::Global, None), "a").unwrap();
        let mut child = new_config(Scope::Campaign, Some("camp"));
        child.payload.parent_config_id = Some(a.config_id.clone());
        let b = store.create(child, "a").unwrap();

        let to_child = ConfigUpdate {
            parent_config_id: Patch::Set(b.config_id.clone()),
            ..Default::default()
        };
        let err = store.update(&a.config_id, to_child, "a", None).unwrap_err();
        assert!(err.to_string().contains("loops back"));

        let to_self = ConfigUpdate {
            parent_config_id: Patch::Set(a.config_id.clone()),
            ..Default::default()
        };
        assert!(store.update(&a.config_id, to_self, "a", None).is_err());
    }

    #[test]
    fn test_audit_chain_verifies() {
        let store = store();
        let v1 = store.create(new_config(Scope::Global, None), "alice").unwrap();
        store.toggle(&v1.config_id, false, "alice").unwrap();
        store.rollback(&v1.config_id, 1, "alice").unwrap();

        let report = store.verify_audit(&v1.config_id).unwrap();
        assert!(report.valid, "{:?}", report.errors);
        assert_eq!(report.chain_length, 3);
    }

    #[test]
    fn test_concurrent_updates_never_share_a_version() {
        let store = Arc::new(store());
        let v1 = store.create(new_config(Scope::Global, None), "alice").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let id = v1.config_id.clone();
                std::thread::spawn(move || {
                    let t = thresholds(0.1 + i as f64 * 0.01, 0.5, 0.9);
                    store.update(&id, update_thresholds(t), "writer", None)
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap().unwrap();
        }

        let versions: Vec<u32> = store
            .list_versions(&v1.config_id)
            .unwrap()
            .iter()
            .map(|c| c.version)
            .collect();
        assert_eq!(versions, (1..=9).collect::<Vec<_>>());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Update(f64, f64),
        Toggle(bool),
        Delete,
        Rollback(u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0.0..0.4f64, 0.6..1.0f64).prop_map(|(n, p)| Op::Update(n, p)),
            any::<bool>().prop_map(Op::Toggle),
            Just(Op::Delete),
            (1u32..12).prop_map(Op::Rollback),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_versions_stay_gapless(ops in prop::collection::vec(op(), 1..30)) {
            let store = store();
            let id = store.create(new_config(Scope::Global, None), "alice").unwrap().config_id;
            let mut written = 1u32;

            for op in ops {
                let before = store.latest(&id).unwrap();
                let result = match op {
                    Op::Update(n, p) => store.update(&id, update_thresholds(thresholds(n, 0.5, p)), "alice", None),
                    Op::Toggle(enabled) => store.toggle(&id, enabled, "alice"),
                    Op::Delete => store.delete(&id, "alice"),
                    Op::Rollback(v) => store.rollback(&id, v, "alice"),
                };
                let after = store.latest(&id).unwrap();

                match result {
                    Ok(config) => {
                        prop_assert_eq!(config.version, after.version);
                        prop_assert!(after.version == before.version || after.version == before.version + 1);
                    }
                    Err(e) => {
                        prop_assert_eq!(e.kind(), "not_found");
                        prop_assert_eq!(after.version, before.version);
                    }
                }
                if after.version > before.version {
                    written += 1;
                }
            }

            let versions: Vec<u32> = store.list_versions(&id).unwrap().iter().map(|c| c.version).collect();
            prop_assert_eq!(versions, (1..=written).collect::<Vec<_>>());
            prop_assert_eq!(store.audit(&id).unwrap().len(), written as usize);
            prop_assert!(store.verify_audit(&id).unwrap().valid);
        }
    }
}
