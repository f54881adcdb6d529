//! sentiment-engine - Sentiment Configuration Resolution & Versioning
//!
//! Multi-tenant sentiment policy: which model, thresholds, label mapping,
//! derived metrics, sampling, feedback and drift rules apply to a request,
//! how those policies are versioned and audited, and how provider output is
//! normalized into one canonical prediction.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use sentiment_engine::{EngineSettings, SentimentEngine, NewConfig, Scope, PredictRequest};
//!
//! let engine = Arc::new(SentimentEngine::open(EngineSettings::load()?)?);
//!
//! // Policy for one workspace (version 1, audited and signed)
//! let config = engine.create(NewConfig { name, scope: Scope::Workspace, scope_id, payload }, "admin")?;
//!
//! // Classify with whatever config is effective for the request's scope
//! let prediction = engine.predict(request, None).await?;
//!
//! // Close the loop
//! engine.submit_feedback(NewFeedback { prediction_id: &prediction.id, .. })?;
//! let drift = engine.check_drift(&config.config_id)?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │        JSON-RPC (rpc.rs)  /  CLI + HTTP server (main.rs)      │
//! └──────────────────────────────┬────────────────────────────────┘
//!                                ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │                  SentimentEngine (engine.rs)                  │
//! │                                                               │
//! │  VersionStore ──invalidate──▶ ScopeCache ◀── ScopeResolver    │
//! │      │ append version + signed audit                          │
//! │      ▼                                                        │
//! │  SQLite (db.rs)   Provider ─▶ Normalizer ─▶ PredictionLog     │
//! │                                    │                          │
//! │            FeedbackLedger ◀────────┴────────▶ DriftMonitor    │
//! │                  │ RetrainRecommended          │ rollback     │
//! │                  ▼                             ▼              │
//! │              EventSink                  VersionStore          │
//! └───────────────────────────────────────────────────────────────┘
//! ```

pub mod db;
pub mod derived;
pub mod drift;
pub mod engine;
pub mod error;
pub mod events;
pub mod feedback;
pub mod normalize;
pub mod predictions;
pub mod provenance;
pub mod provider;
pub mod resolver;
pub mod rpc;
pub mod settings;
pub mod store;
pub mod types;
pub mod validate;

// Engine facade
pub use engine::{builtin_config, BulkItem, ItemError, SentimentEngine, BUILTIN_CONFIG_ID};
pub use error::{EngineError, EngineResult};
pub use settings::EngineSettings;
pub use types::*;

// Components
pub use drift::{DriftAction, DriftMonitor, DriftResult, LabelDistribution};
pub use events::{ChannelSink, EngineEvent, EventSink, FanoutSink, MemorySink, TracingSink};
pub use feedback::{should_sample, FeedbackLedger, NewFeedback};
pub use normalize::Normalizer;
pub use predictions::{MetricsFilter, PredictionMetrics};
pub use provenance::{verify_audit_chain, ChainVerification, Provenance};
pub use provider::{KeywordProvider, LabelScore, Provider, ProviderOutput, ProviderRegistry, ProviderRequest, RawClassification};
pub use resolver::{EffectiveConfig, ScopeCache, ScopeResolver};
pub use store::VersionStore;
