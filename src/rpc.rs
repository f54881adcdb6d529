//! JSON-RPC surface over `SentimentEngine`
//!
//! `methods()` is the catalogue (name, description, params schema) and
//! `handle()` turns one JSON-RPC 2.0 request body into a response body.
//! Transport is the caller's business; `main.rs` serves it over HTTP.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::drift::LabelDistribution;
use crate::engine::SentimentEngine;
use crate::error::EngineError;
use crate::feedback::NewFeedback;
use crate::predictions::MetricsFilter;
use crate::types::{
    ConfigFilter, ConfigPayload, ConfigUpdate, NewConfig, PredictRequest, ReviewStatus, Scope,
    ScopeContext, SentimentLabel,
};

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const ENGINE_ERROR: i64 = -32000;

const DEFAULT_LIMIT: usize = 50;

// ============================================================================
// METHOD CATALOGUE
// ============================================================================

pub fn methods() -> Vec<Value> {
    let config_id = json!({"type": "string", "description": "Config id"});
    let user_id = json!({"type": "string", "description": "Acting user, recorded in the audit log"});
    let limit = json!({"type": "integer", "minimum": 1, "default": DEFAULT_LIMIT});

    vec![
        // CONFIGS
        json!({
            "name": "configs.list",
            "description": "Latest version of every config, optionally filtered by scope and scope id.",
            "params": {
                "scope": {"type": "string", "enum": ["global", "workspace", "company", "campaign", "user"]},
                "scope_id": {"type": "string"},
                "include_deleted": {"type": "boolean", "default": false}
            }
        }),
        json!({
            "name": "configs.get",
            "description": "Latest live version of a config, or a specific historical version.",
            "params": {"config_id": config_id, "version": {"type": "integer"}},
            "required": ["config_id"]
        }),
        json!({
            "name": "configs.create",
            "description": "Create a config at version 1. Validated before anything is stored.",
            "params": {
                "user_id": user_id,
                "name": {"type": "string"},
                "scope": {"type": "string"},
                "scope_id": {"type": "string"},
                "payload": {"type": "object", "description": "mode, model, thresholds, label_mapping, derived_metrics, sampling, feedback, drift_detection, keywords, parent_config_id"}
            },
            "required": ["user_id", "name", "scope"]
        }),
        json!({
            "name": "configs.update",
            "description": "Append a new version. Omitted fields carry forward, null unsets a field.",
            "params": {
                "config_id": config_id,
                "user_id": user_id,
                "reason": {"type": "string"},
                "changes": {"type": "object", "description": "Field-level changes; expected_version enables the optimistic check"}
            },
            "required": ["config_id", "user_id", "changes"]
        }),
        json!({
            "name": "configs.toggle",
            "description": "Enable or disable a config. No-op when already in that state.",
            "params": {"config_id": config_id, "enabled": {"type": "boolean"}, "user_id": user_id},
            "required": ["config_id", "enabled", "user_id"]
        }),
        json!({
            "name": "configs.delete",
            "description": "Soft delete. Idempotent.",
            "params": {"config_id": config_id, "user_id": user_id},
            "required": ["config_id", "user_id"]
        }),
        json!({
            "name": "configs.rollback",
            "description": "Copy a historical version's payload into a new version.",
            "params": {"config_id": config_id, "to_version": {"type": "integer"}, "user_id": user_id},
            "required": ["config_id", "to_version", "user_id"]
        }),
        json!({
            "name": "configs.versions",
            "description": "Every version of a config, oldest first.",
            "params": {"config_id": config_id},
            "required": ["config_id"]
        }),
        json!({
            "name": "configs.audit",
            "description": "Signed audit records for a config, oldest first.",
            "params": {"config_id": config_id},
            "required": ["config_id"]
        }),
        json!({
            "name": "configs.verify_audit",
            "description": "Recompute the audit hash chain and check every signature.",
            "params": {"config_id": config_id},
            "required": ["config_id"]
        }),
        json!({
            "name": "configs.effective",
            "description": "The config that applies to a request context, with inherited parent fields applied.",
            "params": {
                "workspace_id": {"type": "string"},
                "company_id": {"type": "string"},
                "campaign_id": {"type": "string"},
                "user_id": {"type": "string"}
            }
        }),
        // PREDICTIONS
        json!({
            "name": "predict.preview",
            "description": "Classify sample texts against a config without recording anything.",
            "params": {"config_id": config_id, "texts": {"type": "array", "items": {"type": "string"}}},
            "required": ["config_id", "texts"]
        }),
        json!({
            "name": "predict.single",
            "description": "Classify one text with the effective config for its scope context.",
            "params": {
                "text": {"type": "string"},
                "channel": {"type": "string", "enum": ["sms", "email", "call", "ticket", "chat", "other"]},
                "contact_id": {"type": "string"},
                "scope": {"type": "object"},
                "deadline_ms": {"type": "integer", "description": "Abort with deadline_exceeded after this many ms"}
            },
            "required": ["text"]
        }),
        json!({
            "name": "predict.bulk",
            "description": "Classify many texts with bounded concurrency. Failures are reported per item.",
            "params": {
                "requests": {"type": "array"},
                "concurrency": {"type": "integer", "minimum": 1},
                "deadline_ms": {"type": "integer"}
            },
            "required": ["requests"]
        }),
        json!({
            "name": "predictions.contact_history",
            "description": "Recent predictions for a contact, newest first.",
            "params": {"contact_id": {"type": "string"}, "limit": limit},
            "required": ["contact_id"]
        }),
        json!({
            "name": "predictions.metrics",
            "description": "Aggregated label, channel and score metrics over stored predictions.",
            "params": {
                "config_id": {"type": "string"},
                "contact_id": {"type": "string"},
                "channel": {"type": "string"},
                "since": {"type": "string", "format": "date-time"},
                "until": {"type": "string", "format": "date-time"}
            }
        }),
        // FEEDBACK
        json!({
            "name": "feedback.submit",
            "description": "Submit a correction for a prediction.",
            "params": {
                "prediction_id": {"type": "string"},
                "user_label": {"type": "string", "enum": ["positive", "neutral", "negative", "mixed"]},
                "user_id": user_id,
                "user_confidence": {"type": "number", "minimum": 0, "maximum": 1}
            },
            "required": ["prediction_id", "user_label", "user_id"]
        }),
        json!({
            "name": "feedback.list",
            "description": "Feedback for a config, newest first.",
            "params": {"config_id": config_id, "status": {"type": "string"}, "limit": limit},
            "required": ["config_id"]
        }),
        json!({
            "name": "feedback.review",
            "description": "Accept or reject pending feedback. Fails with already_reviewed the second time.",
            "params": {
                "feedback_id": {"type": "string"},
                "status": {"type": "string", "enum": ["accepted", "rejected"]},
                "reviewer": {"type": "string"}
            },
            "required": ["feedback_id", "status", "reviewer"]
        }),
        json!({
            "name": "feedback.pending",
            "description": "Feedback waiting for review, oldest first.",
            "params": {"config_id": config_id, "limit": limit},
            "required": ["config_id"]
        }),
        json!({
            "name": "feedback.sampled",
            "description": "Sampled predictions without feedback yet, oldest first.",
            "params": {"config_id": config_id, "limit": limit},
            "required": ["config_id"]
        }),
        json!({
            "name": "feedback.mark_batched",
            "description": "Tag accepted feedback as consumed by a training batch.",
            "params": {
                "config_id": config_id,
                "batch_id": {"type": "string"},
                "feedback_ids": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["config_id", "batch_id", "feedback_ids"]
        }),
        // DRIFT
        json!({
            "name": "drift.check",
            "description": "Divergence of the live label window from the baseline; acts on a breach.",
            "params": {"config_id": config_id},
            "required": ["config_id"]
        }),
        json!({
            "name": "drift.set_baseline",
            "description": "Replace the drift baseline with explicit label weights.",
            "params": {
                "config_id": config_id,
                "distribution": {"type": "object", "description": "label -> non-negative weight"}
            },
            "required": ["config_id", "distribution"]
        }),
    ]
}

// ============================================================================
// DISPATCH
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn kind(&self) -> Option<&str> {
        self.data.as_ref()?.get("kind")?.as_str()
    }
}

impl From<EngineError> for RpcError {
    fn from(e: EngineError) -> Self {
        Self {
            code: ENGINE_ERROR,
            message: e.to_string(),
            data: Some(json!({"kind": e.kind()})),
        }
    }
}

type RpcResult = Result<Value, RpcError>;

fn params<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, RpcError> {
    serde_json::from_value(value)
        .map_err(|e| RpcError::new(INVALID_PARAMS, format!("invalid params for {}: {}", method, e)))
}

fn to_value<T: Serialize>(value: T) -> RpcResult {
    serde_json::to_value(value).map_err(|e| EngineError::from(e).into())
}

fn deadline(ms: Option<u64>) -> Option<Instant> {
    ms.map(|ms| Instant::now() + Duration::from_millis(ms))
}

#[derive(Deserialize)]
struct ConfigIdParams {
    config_id: String,
}

#[derive(Deserialize)]
struct GetParams {
    config_id: String,
    version: Option<u32>,
}

#[derive(Deserialize)]
struct CreateParams {
    user_id: String,
    name: String,
    scope: Scope,
    #[serde(default)]
    scope_id: Option<String>,
    #[serde(default)]
    payload: ConfigPayload,
}

#[derive(Deserialize)]
struct UpdateParams {
    config_id: String,
    user_id: String,
    #[serde(default)]
    reason: Option<String>,
    changes: ConfigUpdate,
}

#[derive(Deserialize)]
struct ToggleParams {
    config_id: String,
    enabled: bool,
    user_id: String,
}

#[derive(Deserialize)]
struct UserParams {
    config_id: String,
    user_id: String,
}

#[derive(Deserialize)]
struct RollbackParams {
    config_id: String,
    to_version: u32,
    user_id: String,
}

#[derive(Deserialize)]
struct PreviewParams {
    config_id: String,
    texts: Vec<String>,
}

#[derive(Deserialize)]
struct PredictParams {
    #[serde(flatten)]
    request: PredictRequest,
    #[serde(default)]
    deadline_ms: Option<u64>,
}

#[derive(Deserialize)]
struct BulkParams {
    requests: Vec<PredictRequest>,
    #[serde(default)]
    concurrency: Option<usize>,
    #[serde(default)]
    deadline_ms: Option<u64>,
}

#[derive(Deserialize)]
struct ContactParams {
    contact_id: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct SubmitParams {
    prediction_id: String,
    user_label: SentimentLabel,
    user_id: String,
    #[serde(default)]
    user_confidence: Option<f64>,
}

#[derive(Deserialize)]
struct ListFeedbackParams {
    config_id: String,
    #[serde(default)]
    status: Option<ReviewStatus>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct ReviewParams {
    feedback_id: String,
    status: ReviewStatus,
    reviewer: String,
}

#[derive(Deserialize)]
struct LimitParams {
    config_id: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct BatchParams {
    config_id: String,
    batch_id: String,
    feedback_ids: Vec<String>,
}

#[derive(Deserialize)]
struct BaselineParams {
    config_id: String,
    distribution: LabelDistribution,
}

/// Route one method call
pub async fn dispatch(engine: &Arc<SentimentEngine>, method: &str, raw: Value) -> RpcResult {
    let raw = if raw.is_null() { json!({}) } else { raw };

    match method {
        "configs.list" => {
            let filter: ConfigFilter = params(method, raw)?;
            to_value(engine.list(&filter)?)
        }
        "configs.get" => {
            let p: GetParams = params(method, raw)?;
            match p.version {
                Some(v) => to_value(engine.get_version(&p.config_id, v)?),
                None => to_value(engine.get(&p.config_id)?),
            }
        }
        "configs.create" => {
            let p: CreateParams = params(method, raw)?;
            let new = NewConfig {
                name: p.name,
                scope: p.scope,
                scope_id: p.scope_id,
                payload: p.payload,
            };
            to_value(engine.create(new, &p.user_id)?)
        }
        "configs.update" => {
            let p: UpdateParams = params(method, raw)?;
            to_value(engine.update(&p.config_id, p.changes, &p.user_id, p.reason.as_deref())?)
        }
        "configs.toggle" => {
            let p: ToggleParams = params(method, raw)?;
            to_value(engine.toggle(&p.config_id, p.enabled, &p.user_id)?)
        }
        "configs.delete" => {
            let p: UserParams = params(method, raw)?;
            to_value(engine.delete(&p.config_id, &p.user_id)?)
        }
        "configs.rollback" => {
            let p: RollbackParams = params(method, raw)?;
            to_value(engine.rollback(&p.config_id, p.to_version, &p.user_id)?)
        }
        "configs.versions" => {
            let p: ConfigIdParams = params(method, raw)?;
            to_value(engine.versions(&p.config_id)?)
        }
        "configs.audit" => {
            let p: ConfigIdParams = params(method, raw)?;
            to_value(engine.audit(&p.config_id)?)
        }
        "configs.verify_audit" => {
            let p: ConfigIdParams = params(method, raw)?;
            to_value(engine.verify_audit(&p.config_id)?)
        }
        "configs.effective" => {
            let ctx: ScopeContext = params(method, raw)?;
            to_value(engine.effective(&ctx)?)
        }
        "predict.preview" => {
            let p: PreviewParams = params(method, raw)?;
            to_value(engine.preview(&p.config_id, &p.texts).await?)
        }
        "predict.single" => {
            let p: PredictParams = params(method, raw)?;
            to_value(engine.predict(p.request, deadline(p.deadline_ms)).await?)
        }
        "predict.bulk" => {
            let p: BulkParams = params(method, raw)?;
            to_value(
                engine
                    .bulk_predict(p.requests, p.concurrency, deadline(p.deadline_ms))
                    .await,
            )
        }
        "predictions.contact_history" => {
            let p: ContactParams = params(method, raw)?;
            to_value(engine.contact_history(&p.contact_id, p.limit.unwrap_or(DEFAULT_LIMIT))?)
        }
        "predictions.metrics" => {
            let filter: MetricsFilter = params(method, raw)?;
            to_value(engine.metrics(&filter)?)
        }
        "feedback.submit" => {
            let p: SubmitParams = params(method, raw)?;
            to_value(engine.submit_feedback(NewFeedback {
                prediction_id: &p.prediction_id,
                user_label: p.user_label,
                user_id: &p.user_id,
                user_confidence: p.user_confidence,
            })?)
        }
        "feedback.list" => {
            let p: ListFeedbackParams = params(method, raw)?;
            to_value(engine.list_feedback(&p.config_id, p.status, p.limit.unwrap_or(DEFAULT_LIMIT))?)
        }
        "feedback.review" => {
            let p: ReviewParams = params(method, raw)?;
            to_value(engine.review_feedback(&p.feedback_id, p.status, &p.reviewer)?)
        }
        "feedback.pending" => {
            let p: LimitParams = params(method, raw)?;
            to_value(engine.pending_feedback(&p.config_id, p.limit.unwrap_or(DEFAULT_LIMIT))?)
        }
        "feedback.sampled" => {
            let p: LimitParams = params(method, raw)?;
            to_value(engine.sampled_for_review(&p.config_id, p.limit.unwrap_or(DEFAULT_LIMIT))?)
        }
        "feedback.mark_batched" => {
            let p: BatchParams = params(method, raw)?;
            let tagged = engine.mark_batched(&p.config_id, &p.batch_id, &p.feedback_ids)?;
            Ok(json!({"batch_id": p.batch_id, "tagged": tagged}))
        }
        "drift.check" => {
            let p: ConfigIdParams = params(method, raw)?;
            to_value(engine.check_drift(&p.config_id)?)
        }
        "drift.set_baseline" => {
            let p: BaselineParams = params(method, raw)?;
            engine.set_baseline(&p.config_id, &p.distribution)?;
            Ok(json!({"config_id": p.config_id, "baseline": "set"}))
        }
        "methods" => Ok(Value::Array(methods())),
        _ => Err(RpcError::new(METHOD_NOT_FOUND, format!("unknown method: {}", method))),
    }
}

/// One JSON-RPC 2.0 request body in, one response body out
pub async fn handle(engine: &Arc<SentimentEngine>, body: &str) -> Value {
    let request: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            return json!({
                "jsonrpc": "2.0",
                "id": Value::Null,
                "error": RpcError::new(PARSE_ERROR, format!("parse error: {}", e)),
            })
        }
    };

    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let raw = request.get("params").cloned().unwrap_or(Value::Null);

    match dispatch(engine, method, raw).await {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err(error) => {
            tracing::debug!(method, code = error.code, message = %error.message, "rpc error");
            json!({"jsonrpc": "2.0", "id": id, "error": error})
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use crate::settings::EngineSettings;

    fn engine() -> Arc<SentimentEngine> {
        Arc::new(SentimentEngine::in_memory(EngineSettings::default(), Arc::new(MemorySink::new())).unwrap())
    }

    async fn call(engine: &Arc<SentimentEngine>, method: &str, params: Value) -> Value {
        let body = json!({"jsonrpc": "2.0", "id": 7, "method": method, "params": params});
        handle(engine, &body.to_string()).await
    }

    #[test]
    fn test_catalogue_names_are_unique_and_dispatchable() {
        let names: Vec<String> = methods()
            .iter()
            .map(|m| m["name"].as_str().unwrap().to_string())
            .collect();
        let mut deduped = names.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(names.len(), deduped.len());
        assert!(names.contains(&"predict.bulk".to_string()));
    }

    #[tokio::test]
    async fn test_create_update_versions_roundtrip() {
        let engine = engine();
        let created = call(
            &engine,
            "configs.create",
            json!({"user_id": "admin", "name": "Acme", "scope": "workspace", "scope_id": "ws-1",
                   "payload": {"thresholds": {"negative": 0.3, "neutral": 0.5, "positive": 0.7}}}),
        )
        .await;
        let config_id = created["result"]["config_id"].as_str().unwrap().to_string();
        assert_eq!(created["id"], 7);

        let updated = call(
            &engine,
            "configs.update",
            json!({"config_id": config_id, "user_id": "admin", "reason": "tune",
                   "changes": {"thresholds": null}}),
        )
        .await;
        assert_eq!(updated["result"]["version"], 2);
        assert!(updated["result"]["payload"].get("thresholds").is_none());

        let versions = call(&engine, "configs.versions", json!({"config_id": config_id})).await;
        assert_eq!(versions["result"].as_array().unwrap().len(), 2);

        let effective = call(&engine, "configs.effective", json!({"workspace_id": "ws-1"})).await;
        assert_eq!(effective["result"]["config"]["config_id"], config_id.as_str());
    }

    #[tokio::test]
    async fn test_error_kinds() {
        let engine = engine();
        let missing = call(&engine, "configs.get", json!({"config_id": "nope"})).await;
        assert_eq!(missing["error"]["code"], ENGINE_ERROR);
        assert_eq!(missing["error"]["data"]["kind"], "not_found");

        let invalid = call(
            &engine,
            "configs.create",
            json!({"user_id": "admin", "name": "Bad", "scope": "global",
                   "payload": {"thresholds": {"negative": 0.8, "neutral": 0.5, "positive": 0.2}}}),
        )
        .await;
        assert_eq!(invalid["error"]["data"]["kind"], "validation");

        let bad_params = call(&engine, "configs.toggle", json!({"config_id": "x"})).await;
        assert_eq!(bad_params["error"]["code"], INVALID_PARAMS);

        let unknown = call(&engine, "configs.explode", json!({})).await;
        assert_eq!(unknown["error"]["code"], METHOD_NOT_FOUND);

        let garbage = handle(&engine, "{not json").await;
        assert_eq!(garbage["error"]["code"], PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_predict_and_metrics() {
        let engine = engine();
        let predicted = call(
            &engine,
            "predict.single",
            json!({"text": "thanks, great help", "channel": "sms", "contact_id": "c-1"}),
        )
        .await;
        assert_eq!(predicted["result"]["label"], "positive");

        let metrics = call(&engine, "predictions.metrics", json!({})).await;
        assert_eq!(metrics["result"]["total"], 1);

        let history = call(&engine, "predictions.contact_history", json!({"contact_id": "c-1"})).await;
        assert_eq!(history["result"].as_array().unwrap().len(), 1);
    }
}
