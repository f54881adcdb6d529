//! `SentimentEngine`: one handle over every component
//!
//! Initialize once at startup and share (`Arc`) across request handlers.
//!
//! ```rust,ignore
//! let engine = Arc::new(SentimentEngine::open(EngineSettings::load()?)?);
//!
//! let config = engine.create(new_config, "admin@acme")?;
//! let prediction = engine.predict(request, None).await?;
//! engine.submit_feedback(NewFeedback { prediction_id: &prediction.id, .. })?;
//! ```

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant as StdInstant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::Instrument;

use crate::db::Database;
use crate::drift::{DriftMonitor, DriftResult, LabelDistribution};
use crate::error::{EngineError, EngineResult};
use crate::events::{EventSink, TracingSink};
use crate::feedback::{should_sample, FeedbackLedger, NewFeedback};
use crate::normalize::{Normalizer, Source};
use crate::predictions::{MetricsFilter, PredictionLog, PredictionMetrics};
use crate::provenance::{content_hash, ChainVerification, Provenance};
use crate::provider::{Provider, ProviderRegistry, ProviderRequest, RawClassification};
use crate::resolver::{EffectiveConfig, ScopeCache, ScopeResolver};
use crate::settings::EngineSettings;
use crate::store::VersionStore;
use crate::types::{
    AuditRecord, Config, ConfigFilter, ConfigPayload, ConfigUpdate, Feedback, FeedbackSettings,
    KeywordRules, Mode, NewConfig, PredictRequest, Prediction, ReviewStatus, Scope, ScopeContext,
};

/// Config id of the fallback used when nothing resolves
pub const BUILTIN_CONFIG_ID: &str = "builtin:keyword";

const BUILTIN_POSITIVE: &[&str] = &[
    "great", "good", "thanks", "thank you", "love", "excellent", "happy", "perfect",
    "awesome", "appreciate", "helpful", "resolved",
];

const BUILTIN_NEGATIVE: &[&str] = &[
    "bad", "terrible", "awful", "hate", "angry", "broken", "refund", "cancel",
    "disappointed", "worst", "useless", "complaint",
];

/// Keyword-mode config served when no scope level has one
pub fn builtin_config() -> Config {
    let payload = ConfigPayload {
        mode: Some(Mode::Keyword),
        keywords: Some(KeywordRules {
            positive: BUILTIN_POSITIVE.iter().map(|s| s.to_string()).collect(),
            negative: BUILTIN_NEGATIVE.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }),
        ..Default::default()
    };
    let payload_hash = serde_json::to_vec(&payload)
        .map(|bytes| content_hash(&bytes))
        .unwrap_or_default();

    Config {
        config_id: BUILTIN_CONFIG_ID.to_string(),
        version: 0,
        name: "Built-in keyword sentiment".to_string(),
        scope: Scope::Global,
        scope_id: None,
        enabled: true,
        deleted_at: None,
        payload,
        payload_hash,
        created_by: "system".to_string(),
        created_at: Utc::now(),
    }
}

/// Per-item outcome of a bulk run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkItem {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction: Option<Prediction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemError {
    pub kind: String,
    pub message: String,
}

impl BulkItem {
    fn from_result(index: usize, result: EngineResult<Prediction>) -> Self {
        match result {
            Ok(prediction) => Self {
                index,
                prediction: Some(prediction),
                error: None,
            },
            Err(e) => Self {
                index,
                prediction: None,
                error: Some(ItemError {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                }),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.prediction.is_some()
    }
}

pub struct SentimentEngine {
    settings: EngineSettings,
    store: Arc<VersionStore>,
    resolver: ScopeResolver,
    predictions: PredictionLog,
    feedback: FeedbackLedger,
    drift: DriftMonitor,
    providers: RwLock<ProviderRegistry>,
    public_key: String,
}

impl SentimentEngine {
    /// Open the on-disk engine under `settings.data_dir`
    pub fn open(settings: EngineSettings) -> Result<Self> {
        std::fs::create_dir_all(&settings.data_dir)
            .with_context(|| format!("creating data dir {:?}", settings.data_dir))?;
        let db = Database::open(&settings.db_path())
            .with_context(|| format!("opening database {:?}", settings.db_path()))?;
        let provenance = Provenance::init(&settings.key_path())?;
        tracing::info!(
            data_dir = %settings.data_dir.display(),
            pubkey = %provenance.public_key_hex(),
            "engine opened"
        );
        Ok(Self::new(settings, Arc::new(db), provenance, Arc::new(TracingSink)))
    }

    /// Throwaway engine over `:memory:` with an ephemeral signing key
    pub fn in_memory(settings: EngineSettings, events: Arc<dyn EventSink>) -> EngineResult<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self::new(settings, Arc::new(db), Provenance::ephemeral(), events))
    }

    pub fn new(
        settings: EngineSettings,
        db: Arc<Database>,
        provenance: Provenance,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let public_key = provenance.public_key_hex();
        let cache = Arc::new(ScopeCache::new(settings.cache_capacity));
        let store = Arc::new(VersionStore::new(
            db.clone(),
            Arc::new(provenance),
            cache.clone(),
            settings.max_parent_depth,
        ));
        let drift = DriftMonitor::new(
            store.clone(),
            events.clone(),
            settings.drift_window,
            settings.drift_min_samples,
            settings.drift_baseline_size,
        );

        Self {
            resolver: ScopeResolver::new(db.clone(), cache, settings.max_parent_depth),
            predictions: PredictionLog::new(db.clone()),
            feedback: FeedbackLedger::new(db, events),
            providers: RwLock::new(ProviderRegistry::with_builtin()),
            store,
            drift,
            settings,
            public_key,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Hex public key that signs audit records
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn store(&self) -> &VersionStore {
        &self.store
    }

    /// Install a provider client, replacing any previous one of the same kind
    pub fn register_provider(&self, provider: Arc<dyn Provider>) -> EngineResult<()> {
        let kind = provider.kind();
        self.providers
            .write()
            .map_err(|_| EngineError::Storage("provider registry poisoned".to_string()))?
            .register(provider);
        tracing::info!(provider = kind.as_str(), "provider registered");
        Ok(())
    }

    fn provider(&self, kind: crate::types::ProviderKind) -> EngineResult<Arc<dyn Provider>> {
        self.providers
            .read()
            .map_err(|_| EngineError::Storage("provider registry poisoned".to_string()))?
            .get(kind)
    }

    // ------------------------------------------------------------------------
    // Configs
    // ------------------------------------------------------------------------

    pub fn list(&self, filter: &ConfigFilter) -> EngineResult<Vec<Config>> {
        self.store.list(filter)
    }

    pub fn get(&self, config_id: &str) -> EngineResult<Config> {
        self.store.get_by_id(config_id)
    }

    pub fn get_version(&self, config_id: &str, version: u32) -> EngineResult<Config> {
        self.store.get_version(config_id, version)
    }

    pub fn create(&self, new: NewConfig, user_id: &str) -> EngineResult<Config> {
        self.store.create(new, user_id)
    }

    pub fn update(
        &self,
        config_id: &str,
        update: ConfigUpdate,
        user_id: &str,
        reason: Option<&str>,
    ) -> EngineResult<Config> {
        self.store.update(config_id, update, user_id, reason)
    }

    pub fn toggle(&self, config_id: &str, enabled: bool, user_id: &str) -> EngineResult<Config> {
        self.store.toggle(config_id, enabled, user_id)
    }

    pub fn delete(&self, config_id: &str, user_id: &str) -> EngineResult<Config> {
        self.store.delete(config_id, user_id)
    }

    pub fn rollback(&self, config_id: &str, to_version: u32, user_id: &str) -> EngineResult<Config> {
        self.store.rollback(config_id, to_version, user_id)
    }

    pub fn versions(&self, config_id: &str) -> EngineResult<Vec<Config>> {
        self.store.list_versions(config_id)
    }

    pub fn audit(&self, config_id: &str) -> EngineResult<Vec<AuditRecord>> {
        self.store.audit(config_id)
    }

    pub fn verify_audit(&self, config_id: &str) -> EngineResult<ChainVerification> {
        self.store.verify_audit(config_id)
    }

    /// Effective config for a request context. No built-in fallback here.
    pub fn effective(&self, ctx: &ScopeContext) -> EngineResult<EffectiveConfig> {
        self.resolver.effective(ctx)
    }

    fn effective_or_builtin(&self, ctx: &ScopeContext) -> EngineResult<EffectiveConfig> {
        match self.resolver.effective(ctx) {
            Err(EngineError::NotFound { .. }) if self.settings.builtin_fallback => {
                tracing::debug!("no config resolved, using built-in keyword config");
                Ok(EffectiveConfig::standalone(builtin_config()))
            }
            other => other,
        }
    }

    // ------------------------------------------------------------------------
    // Classification
    // ------------------------------------------------------------------------

    /// Call the configured provider, bounded by the model timeout and the caller deadline
    async fn classify_raw(
        &self,
        payload: &ConfigPayload,
        text: &str,
        deadline: Option<Instant>,
    ) -> EngineResult<RawClassification> {
        let model = payload.model();
        let keywords = payload.keywords();
        let provider = self.provider(model.provider)?;
        // `timeout_at` polls the call once before looking at the clock
        check_deadline(deadline, "classification")?;
        let timeout_ms = if model.timeout_ms == 0 {
            self.settings.provider_timeout_ms
        } else {
            model.timeout_ms
        };

        let call = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            provider.classify(ProviderRequest {
                text,
                model: &model,
                keywords: &keywords,
            }),
        );

        let output = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, call)
                .await
                .map_err(|_| EngineError::DeadlineExceeded(format!("{} classification", model.provider)))?,
            None => call.await,
        }
        .map_err(|_| {
            EngineError::provider(model.provider.as_str(), format!("timed out after {} ms", timeout_ms))
        })??;

        if output.kind() != model.provider {
            return Err(EngineError::provider(
                model.provider.as_str(),
                format!("returned a {} response", output.kind()),
            ));
        }
        output.into_raw(payload.label_mapping.as_ref())
    }

    /// Classify one text, record it, and feed sampling and drift
    pub async fn predict(&self, request: PredictRequest, deadline: Option<Instant>) -> EngineResult<Prediction> {
        let span = tracing::info_span!("predict", channel = request.channel.as_str());
        async move {
            if request.text.trim().is_empty() {
                return Err(EngineError::Validation("text is empty".to_string()));
            }
            check_deadline(deadline, "predict")?;
            let effective = self.effective_or_builtin(&request.scope)?;

            let started = StdInstant::now();
            let raw = self
                .classify_raw(&effective.payload, &request.text, deadline)
                .await?;
            let elapsed = started.elapsed().as_millis() as u64;

            let mut prediction = Normalizer::classify(
                Source {
                    config_id: effective.config_id(),
                    version: effective.version(),
                    provider: effective.payload.model().provider,
                },
                &effective.payload,
                &request,
                raw,
                elapsed,
            );

            let builtin = effective.config_id() == BUILTIN_CONFIG_ID;
            if !builtin {
                prediction.sampled =
                    should_sample(&effective.payload.sampling(), &prediction, &mut rand::thread_rng());
            }

            self.predictions.insert(&prediction)?;
            tracing::debug!(
                prediction_id = %prediction.id,
                config_id = effective.config_id(),
                version = effective.version(),
                label = prediction.label.as_str(),
                sampled = prediction.sampled,
                "prediction recorded"
            );

            if !builtin {
                self.drift.observe(&effective, &prediction);
                if let Err(e) = self.drift.check_drift(effective.config_id()) {
                    tracing::warn!(config_id = effective.config_id(), error = %e, "drift check failed");
                }
            }
            Ok(prediction)
        }
        .instrument(span)
        .await
    }

    /// Fan out over `requests` with at most `concurrency` in flight.
    /// Results come back in input order; failures are per item.
    pub async fn bulk_predict(
        self: &Arc<Self>,
        requests: Vec<PredictRequest>,
        concurrency: Option<usize>,
        deadline: Option<Instant>,
    ) -> Vec<BulkItem> {
        let total = requests.len();
        let limit = concurrency.unwrap_or(self.settings.bulk_concurrency).max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut tasks = JoinSet::new();

        for (index, request) in requests.into_iter().enumerate() {
            let engine = Arc::clone(self);
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let result = match check_deadline(deadline, "bulk item") {
                    Err(e) => Err(e),
                    Ok(()) => match semaphore.acquire_owned().await {
                        Ok(_permit) => engine.predict(request, deadline).await,
                        Err(_) => Err(EngineError::Storage("bulk semaphore closed".to_string())),
                    },
                };
                (index, result)
            });
        }

        let mut slots: Vec<Option<BulkItem>> = (0..total).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(BulkItem::from_result(index, result)),
                Err(e) => tracing::warn!(error = %e, "bulk predict task failed"),
            }
        }

        let items: Vec<BulkItem> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    BulkItem::from_result(index, Err(EngineError::Storage("task aborted".to_string())))
                })
            })
            .collect();

        tracing::info!(
            total,
            failed = items.iter().filter(|i| !i.is_ok()).count(),
            concurrency = limit,
            "bulk predict finished"
        );
        items
    }

    /// Classify sample texts against a config's current effective payload.
    /// Nothing is recorded, sampled or observed.
    pub async fn preview(&self, config_id: &str, texts: &[String]) -> EngineResult<Vec<Prediction>> {
        let effective = self.resolver.resolve_by_id(config_id)?;
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let request = PredictRequest {
                text: text.clone(),
                channel: Default::default(),
                contact_id: None,
                scope: ScopeContext::default(),
            };
            let started = StdInstant::now();
            let raw = self.classify_raw(&effective.payload, text, None).await?;
            out.push(Normalizer::classify(
                Source {
                    config_id: effective.config_id(),
                    version: effective.version(),
                    provider: effective.payload.model().provider,
                },
                &effective.payload,
                &request,
                raw,
                started.elapsed().as_millis() as u64,
            ));
        }
        Ok(out)
    }

    pub fn prediction(&self, prediction_id: &str) -> EngineResult<Prediction> {
        self.predictions.get(prediction_id)
    }

    pub fn contact_history(&self, contact_id: &str, limit: usize) -> EngineResult<Vec<Prediction>> {
        self.predictions.contact_history(contact_id, limit)
    }

    pub fn metrics(&self, filter: &MetricsFilter) -> EngineResult<PredictionMetrics> {
        self.predictions.metrics(filter)
    }

    // ------------------------------------------------------------------------
    // Feedback
    // ------------------------------------------------------------------------

    /// Feedback settings from the config's current effective payload
    fn feedback_settings(&self, config_id: &str) -> EngineResult<FeedbackSettings> {
        if config_id == BUILTIN_CONFIG_ID {
            return Ok(FeedbackSettings::default());
        }
        match self.resolver.resolve_by_id(config_id) {
            Ok(effective) => Ok(effective.payload.feedback()),
            Err(EngineError::NotFound { .. }) => Ok(FeedbackSettings::default()),
            Err(e) => Err(e),
        }
    }

    pub fn submit_feedback(&self, input: NewFeedback<'_>) -> EngineResult<Feedback> {
        let prediction = self.predictions.get(input.prediction_id)?;
        let settings = self.feedback_settings(&prediction.config_id)?;
        self.feedback.submit(input, &settings)
    }

    pub fn review_feedback(&self, feedback_id: &str, status: ReviewStatus, reviewer: &str) -> EngineResult<Feedback> {
        let existing = self.feedback.get(feedback_id)?;
        let settings = self.feedback_settings(&existing.config_id)?;
        self.feedback.review(feedback_id, status, reviewer, &settings)
    }

    pub fn list_feedback(
        &self,
        config_id: &str,
        status: Option<ReviewStatus>,
        limit: usize,
    ) -> EngineResult<Vec<Feedback>> {
        self.feedback.list(config_id, status, limit)
    }

    pub fn pending_feedback(&self, config_id: &str, limit: usize) -> EngineResult<Vec<Feedback>> {
        self.feedback.pending_for(config_id, limit)
    }

    /// Sampled predictions still waiting for a correction
    pub fn sampled_for_review(&self, config_id: &str, limit: usize) -> EngineResult<Vec<Prediction>> {
        self.predictions.sampled_without_feedback(config_id, limit)
    }

    pub fn mark_batched(&self, config_id: &str, batch_id: &str, feedback_ids: &[String]) -> EngineResult<usize> {
        self.feedback.mark_batched(config_id, batch_id, feedback_ids)
    }

    // ------------------------------------------------------------------------
    // Drift
    // ------------------------------------------------------------------------

    pub fn check_drift(&self, config_id: &str) -> EngineResult<DriftResult> {
        self.drift.check_drift(config_id)
    }

    pub fn set_baseline(&self, config_id: &str, distribution: &LabelDistribution) -> EngineResult<()> {
        let effective = self.resolver.resolve_by_id(config_id)?;
        if !effective.payload.drift().enabled {
            return Err(EngineError::Validation(format!(
                "drift detection is disabled for config {}",
                config_id
            )));
        }
        self.drift.set_baseline(&effective, distribution)
    }
}

fn check_deadline(deadline: Option<Instant>, what: &str) -> EngineResult<()> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => {
            Err(EngineError::DeadlineExceeded(format!("{} started after the deadline", what)))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use crate::types::{Channel, SentimentLabel};

    fn engine() -> Arc<SentimentEngine> {
        Arc::new(SentimentEngine::in_memory(EngineSettings::default(), Arc::new(MemorySink::new())).unwrap())
    }

    fn request(text: &str) -> PredictRequest {
        PredictRequest {
            text: text.into(),
            channel: Channel::Email,
            contact_id: Some("contact-7".into()),
            scope: ScopeContext::default(),
        }
    }

    #[tokio::test]
    async fn test_builtin_fallback() {
        let engine = engine();
        let p = engine.predict(request("Thanks, this is great"), None).await.unwrap();
        assert_eq!(p.config_id, BUILTIN_CONFIG_ID);
        assert_eq!(p.config_version_used, 0);
        assert_eq!(p.label, SentimentLabel::Positive);
        assert!(!p.sampled);
        assert_eq!(engine.contact_history("contact-7", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_fallback_is_not_found() {
        let settings = EngineSettings {
            builtin_fallback: false,
            ..Default::default()
        };
        let engine = SentimentEngine::in_memory(settings, Arc::new(MemorySink::new())).unwrap();
        let err = engine.predict(request("hello"), None).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_expired_deadline_with_instant_provider() {
        let engine = engine();
        let past = Instant::now() - Duration::from_millis(5);

        let err = engine.predict(request("Thanks, this is great"), Some(past)).await.unwrap_err();
        assert_eq!(err.kind(), "deadline_exceeded");

        let items = engine
            .bulk_predict(vec![request("great"), request("broken")], Some(1), Some(past))
            .await;
        assert!(items
            .iter()
            .all(|i| i.error.as_ref().is_some_and(|e| e.kind == "deadline_exceeded")));
        assert!(engine.contact_history("contact-7", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let err = engine().predict(request("   "), None).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_missing_provider_is_provider_error() {
        let engine = engine();
        engine
            .create(
                NewConfig {
                    name: "ml".into(),
                    scope: Scope::Global,
                    scope_id: None,
                    payload: ConfigPayload {
                        mode: Some(Mode::Ml),
                        model: Some(crate::types::ModelConfig {
                            provider: crate::types::ProviderKind::Openai,
                            ..crate::types::ModelConfig::keyword()
                        }),
                        ..Default::default()
                    },
                },
                "tester",
            )
            .unwrap();
        let err = engine.predict(request("hello"), None).await.unwrap_err();
        assert_eq!(err.kind(), "provider");
        assert_eq!(engine.metrics(&MetricsFilter::default()).unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_bulk_keeps_order_and_reports_per_item() {
        let engine = engine();
        let requests = vec![request("great"), request(""), request("terrible")];
        let items = engine.bulk_predict(requests, Some(2), None).await;
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert_eq!(items[1].error.as_ref().unwrap().kind, "validation");
        assert_eq!(items[2].prediction.as_ref().unwrap().label, SentimentLabel::Negative);
        assert_eq!(items.iter().map(|i| i.index).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_feedback_on_builtin_is_rejected() {
        let engine = engine();
        let p = engine.predict(request("great"), None).await.unwrap();
        let err = engine
            .submit_feedback(NewFeedback {
                prediction_id: &p.id,
                user_label: SentimentLabel::Negative,
                user_id: "agent",
                user_confidence: None,
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_builtin_config_shape() {
        let config = builtin_config();
        assert_eq!(config.payload.mode(), Mode::Keyword);
        assert!(!config.payload.keywords().positive.is_empty());
        assert!(!config.payload_hash.is_empty());
    }
}
