//! ScopeResolver: picks the single effective config for a request context
//!
//! Precedence is user -> campaign -> company -> workspace -> global, first hit
//! wins with no merging across levels. A hit that names a `parent_config_id`
//! is overlaid on its parent's effective payload, resolved at call time.
//!
//! The cache only holds per-level lookups. Parents are never cached, so a
//! parent update shows up on the next resolution of every child.

use moka::sync::Cache;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::db::{self, Database};
use crate::error::{EngineError, EngineResult};
use crate::types::{Config, ConfigPayload, Scope, ScopeContext};

type ScopeKey = (Scope, Option<String>);

/// Read-through cache of (scope, scope_id) -> active config at that level.
///
/// Negative lookups are cached too. Every invalidation bumps a generation
/// counter; a fill that raced an invalidation is dropped.
pub struct ScopeCache {
    entries: Cache<ScopeKey, Option<Arc<Config>>>,
    generation: AtomicU64,
}

impl ScopeCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: Cache::new(capacity),
            generation: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn get(&self, key: &ScopeKey) -> Option<Option<Arc<Config>>> {
        self.entries.get(key)
    }

    /// Insert a lookup made at `seen_generation`
    fn fill(&self, key: ScopeKey, value: Option<Arc<Config>>, seen_generation: u64) {
        self.entries.insert(key.clone(), value);
        if self.generation() != seen_generation {
            self.entries.invalidate(&key);
        }
    }

    /// Called by the store after a committed write, before it returns
    pub fn invalidate(&self, scope: Scope, scope_id: Option<&str>) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.entries.invalidate(&(scope, scope_id.map(str::to_string)));
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.entries.invalidate_all();
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }
}

/// A resolved config with its parent chain applied
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    /// The version that won resolution
    pub config: Config,
    /// `config.payload` overlaid on its parents
    pub payload: ConfigPayload,
    /// Sections taken from a parent rather than set on `config`
    pub inherited: Vec<&'static str>,
    /// Parent config ids walked, nearest first
    pub parents: Vec<String>,
}

impl EffectiveConfig {
    pub fn config_id(&self) -> &str {
        &self.config.config_id
    }

    pub fn version(&self) -> u32 {
        self.config.version
    }

    /// Wrap a config that has no parents to resolve
    pub fn standalone(config: Config) -> Self {
        let payload = config.payload.clone();
        Self {
            config,
            payload,
            inherited: Vec::new(),
            parents: Vec::new(),
        }
    }
}

pub struct ScopeResolver {
    db: Arc<Database>,
    cache: Arc<ScopeCache>,
    max_depth: usize,
}

impl ScopeResolver {
    pub fn new(db: Arc<Database>, cache: Arc<ScopeCache>, max_depth: usize) -> Self {
        Self { db, cache, max_depth }
    }

    /// Effective config for a full request context
    pub fn effective(&self, ctx: &ScopeContext) -> EngineResult<EffectiveConfig> {
        for (scope, scope_id) in ctx.chain() {
            if let Some(config) = self.level(scope, scope_id.as_deref())? {
                tracing::debug!(
                    scope = scope.as_str(),
                    scope_id = scope_id.as_deref().unwrap_or(""),
                    config_id = %config.config_id,
                    version = config.version,
                    "scope resolved"
                );
                return self.with_parents(config.as_ref().clone());
            }
        }
        Err(EngineError::not_found("effective config", describe(ctx)))
    }

    /// Effective config for one (scope, scope_id), falling back through global
    pub fn effective_for(&self, scope: Scope, scope_id: Option<&str>) -> EngineResult<EffectiveConfig> {
        self.effective(&ScopeContext::single(scope, scope_id))
    }

    /// Latest live version of a config with its parents applied, ignoring scope
    pub fn resolve_by_id(&self, config_id: &str) -> EngineResult<EffectiveConfig> {
        let config = self
            .db
            .with_conn(|conn| db::latest_version(conn, config_id))?
            .filter(|c| !c.is_deleted())
            .ok_or_else(|| EngineError::not_found("config", config_id))?;
        self.with_parents(config)
    }

    /// Overlay an arbitrary version on its parents (used for drift bookkeeping)
    pub fn resolve_version(&self, config: Config) -> EngineResult<EffectiveConfig> {
        self.with_parents(config)
    }

    fn level(&self, scope: Scope, scope_id: Option<&str>) -> EngineResult<Option<Arc<Config>>> {
        let key = (scope, scope_id.map(str::to_string));
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        let seen = self.cache.generation();
        let found = self
            .db
            .with_conn(|conn| db::latest_active_at_scope(conn, scope, scope_id))?
            .map(Arc::new);
        self.cache.fill(key, found.clone(), seen);
        Ok(found)
    }

    fn with_parents(&self, config: Config) -> EngineResult<EffectiveConfig> {
        let mut payload = config.payload.clone();
        let mut parents = Vec::new();
        let mut visited: HashSet<String> = HashSet::from([config.config_id.clone()]);
        let mut next = config.payload.parent_config_id.clone();

        while let Some(parent_id) = next {
            if !visited.insert(parent_id.clone()) || parents.len() >= self.max_depth {
                return Err(EngineError::ConfigCycle {
                    config_id: config.config_id.clone(),
                    max_depth: self.max_depth,
                });
            }

            let parent = self
                .db
                .with_conn(|conn| db::latest_version(conn, &parent_id))?
                .filter(|c| !c.is_deleted());
            let Some(parent) = parent else {
                tracing::warn!(
                    config_id = %config.config_id,
                    parent_id = %parent_id,
                    "parent config missing or deleted, chain ends here"
                );
                break;
            };

            payload = payload.overlay(&parent.payload);
            next = parent.payload.parent_config_id.clone();
            parents.push(parent_id);
        }

        let own = config.payload.set_fields();
        let inherited = payload
            .set_fields()
            .into_iter()
            .filter(|f| !own.contains(f))
            .collect();

        Ok(EffectiveConfig {
            config,
            payload,
            inherited,
            parents,
        })
    }
}

fn describe(ctx: &ScopeContext) -> String {
    ctx.chain()
        .iter()
        .map(|(scope, id)| match id {
            Some(id) => format!("{}:{}", scope, id),
            None => scope.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" > ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provenance::Provenance;
    use crate::store::VersionStore;
    use crate::types::{
        ConfigUpdate, Mode, NewConfig, Patch, SamplingConfig, SamplingStrategy, Thresholds,
    };

    struct Fixture {
        store: VersionStore,
        resolver: ScopeResolver,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let cache = Arc::new(ScopeCache::new(100));
        Fixture {
            store: VersionStore::new(db.clone(), Arc::new(Provenance::ephemeral()), cache.clone(), 8),
            resolver: ScopeResolver::new(db, cache, 8),
        }
    }

    fn create(f: &Fixture, scope: Scope, scope_id: Option<&str>, payload: ConfigPayload) -> Config {
        f.store
            .create(
                NewConfig {
                    name: format!("{}-cfg", scope),
                    scope,
                    scope_id: scope_id.map(str::to_string),
                    payload,
                },
                "tester",
            )
            .unwrap()
    }

    fn thresholds(n: f64, p: f64) -> Thresholds {
        Thresholds {
            negative: n,
            neutral: 0.5,
            positive: p,
            min_confidence: None,
        }
    }

    #[test]
    fn test_most_specific_level_wins_without_merging() {
        let f = fixture();
        create(
            &f,
            Scope::Global,
            None,
            ConfigPayload {
                mode: Some(Mode::Keyword),
                sampling: Some(SamplingConfig {
                    rate: 0.5,
                    strategy: SamplingStrategy::All,
                    store_low_confidence: false,
                }),
                ..Default::default()
            },
        );
        let company = create(
            &f,
            Scope::Company,
            Some("co-1"),
            ConfigPayload {
                thresholds: Some(thresholds(0.2, 0.8)),
                ..Default::default()
            },
        );

        let ctx = ScopeContext {
            company_id: Some("co-1".into()),
            campaign_id: Some("unknown".into()),
            ..Default::default()
        };
        let eff = f.resolver.effective(&ctx).unwrap();
        assert_eq!(eff.config_id(), company.config_id);
        assert!(eff.payload.sampling.is_none(), "levels must not merge");

        let other = f.resolver.effective_for(Scope::Company, Some("co-2")).unwrap();
        assert_eq!(other.config.scope, Scope::Global);
    }

    #[test]
    fn test_not_found_when_nothing_matches() {
        let f = fixture();
        let err = f.resolver.effective_for(Scope::User, Some("u")).unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[test]
    fn test_invalidation_is_immediate() {
        let f = fixture();
        let global = create(&f, Scope::Global, None, ConfigPayload::default());
        assert_eq!(
            f.resolver.effective_for(Scope::Global, None).unwrap().version(),
            1
        );

        f.store
            .update(
                &global.config_id,
                ConfigUpdate {
                    thresholds: Patch::Set(thresholds(0.1, 0.9)),
                    ..Default::default()
                },
                "tester",
                None,
            )
            .unwrap();
        assert_eq!(
            f.resolver.effective_for(Scope::Global, None).unwrap().version(),
            2
        );

        f.store.toggle(&global.config_id, false, "tester").unwrap();
        assert!(f.resolver.effective_for(Scope::Global, None).is_err());
    }

    #[test]
    fn test_negative_lookup_invalidated_by_create() {
        let f = fixture();
        assert!(f.resolver.effective_for(Scope::Workspace, Some("ws")).is_err());
        let ws = create(&f, Scope::Workspace, Some("ws"), ConfigPayload::default());
        assert_eq!(
            f.resolver.effective_for(Scope::Workspace, Some("ws")).unwrap().config_id(),
            ws.config_id
        );
    }

    #[test]
    fn test_parent_overlay_tracks_live_parent() {
        let f = fixture();
        let parent = create(
            &f,
            Scope::Workspace,
            Some("ws"),
            ConfigPayload {
                mode: Some(Mode::Keyword),
                thresholds: Some(thresholds(0.3, 0.7)),
                ..Default::default()
            },
        );
        create(
            &f,
            Scope::Campaign,
            Some("camp"),
            ConfigPayload {
                sampling: Some(SamplingConfig::default()),
                parent_config_id: Some(parent.config_id.clone()),
                ..Default::default()
            },
        );

        let eff = f.resolver.effective_for(Scope::Campaign, Some("camp")).unwrap();
        assert_eq!(eff.payload.thresholds, Some(thresholds(0.3, 0.7)));
        assert_eq!(eff.inherited, vec!["mode", "thresholds"]);
        assert_eq!(eff.parents, vec![parent.config_id.clone()]);

        f.store
            .update(
                &parent.config_id,
                ConfigUpdate {
                    thresholds: Patch::Set(thresholds(0.1, 0.9)),
                    ..Default::default()
                },
                "tester",
                None,
            )
            .unwrap();
        let eff = f.resolver.effective_for(Scope::Campaign, Some("camp")).unwrap();
        assert_eq!(eff.payload.thresholds, Some(thresholds(0.1, 0.9)));
    }

    #[test]
    fn test_depth_limit_is_config_cycle() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let cache = Arc::new(ScopeCache::new(100));
        let store = VersionStore::new(db.clone(), Arc::new(Provenance::ephemeral()), cache.clone(), 8);
        let resolver = ScopeResolver::new(db, cache, 2);

        let mut parent: Option<String> = None;
        let mut last = None;
        for i in 0..4 {
            let config = store
                .create(
                    NewConfig {
                        name: format!("link-{}", i),
                        scope: Scope::User,
                        scope_id: Some(format!("u{}", i)),
                        payload: ConfigPayload {
                            parent_config_id: parent.clone(),
                            ..Default::default()
                        },
                    },
                    "tester",
                )
                .unwrap();
            parent = Some(config.config_id.clone());
            last = Some(config);
        }

        let err = resolver
            .resolve_by_id(&last.unwrap().config_id)
            .unwrap_err();
        assert!(matches!(err, EngineError::ConfigCycle { max_depth: 2, .. }));
    }

    #[test]
    fn test_stale_fill_is_dropped() {
        let cache = ScopeCache::new(10);
        let seen = cache.generation();
        cache.invalidate(Scope::Global, None);
        cache.fill((Scope::Global, None), None, seen);
        assert!(cache.get(&(Scope::Global, None)).is_none());

        let seen = cache.generation();
        cache.fill((Scope::Global, None), None, seen);
        assert_eq!(cache.get(&(Scope::Global, None)), Some(None));
    }
}
