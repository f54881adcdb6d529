//! Feedback ledger: human corrections, review, retrain triggers
//!
//! The flywheel: predictions are sampled for review -> reviewers correct them
//! -> accepted corrections accumulate -> once enough are waiting, a retrain is
//! recommended and the batch is tagged when consumed.

use chrono::Utc;
use rand::Rng;
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;

use crate::db::{parse_opt_ts, parse_ts, to_ts, Database};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventSink};
use crate::types::{
    Feedback, FeedbackSettings, Prediction, ReviewStatus, SamplingConfig, SamplingStrategy,
    SentimentLabel,
};

pub const AUTO_ACCEPT_REVIEWER: &str = "system:auto-accept";

const COLUMNS: &str = "id, prediction_id, config_id, user_label, user_confidence, user_id, \
                       review_status, reviewed_by, reviewed_at, included_in_training, \
                       training_batch_id, created_at";

/// Whether a prediction goes to the review queue
pub fn should_sample<R: Rng + ?Sized>(sampling: &SamplingConfig, prediction: &Prediction, rng: &mut R) -> bool {
    let rate = sampling.rate.clamp(0.0, 1.0);
    let low_confidence = prediction.derived_metrics.low_confidence;

    match sampling.strategy {
        SamplingStrategy::All => true,
        _ if sampling.store_low_confidence && low_confidence => true,
        SamplingStrategy::Random => rng.gen_bool(rate),
        SamplingStrategy::ConfidenceBased => {
            // Full rate at confidence 1, rising linearly to certainty at confidence 0
            let confidence = prediction.confidence.clamp(0.0, 1.0);
            let p = rate + (1.0 - rate) * (1.0 - confidence);
            rng.gen_bool(p.clamp(0.0, 1.0))
        }
    }
}

/// Submission input
#[derive(Debug, Clone)]
pub struct NewFeedback<'a> {
    pub prediction_id: &'a str,
    pub user_label: SentimentLabel,
    pub user_id: &'a str,
    pub user_confidence: Option<f64>,
}

pub struct FeedbackLedger {
    db: Arc<Database>,
    events: Arc<dyn EventSink>,
}

impl FeedbackLedger {
    pub fn new(db: Arc<Database>, events: Arc<dyn EventSink>) -> Self {
        Self { db, events }
    }

    /// Record a correction. Without human review it is accepted immediately.
    pub fn submit(&self, input: NewFeedback<'_>, settings: &FeedbackSettings) -> EngineResult<Feedback> {
        if let Some(c) = input.user_confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(EngineError::Validation(format!(
                    "user_confidence must be in [0,1], got {}",
                    c
                )));
            }
        }
        if input.user_id.trim().is_empty() {
            return Err(EngineError::Validation("user_id is empty".to_string()));
        }

        let config_id: String = self
            .db
            .with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT config_id FROM predictions WHERE id = ?1",
                        [input.prediction_id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })?
            .ok_or_else(|| EngineError::not_found("prediction", input.prediction_id))?;

        if !settings.enabled {
            return Err(EngineError::Validation(format!(
                "feedback is disabled for config {}",
                config_id
            )));
        }

        let now = Utc::now();
        let auto_accept = !settings.human_review;
        let feedback = Feedback {
            id: uuid::Uuid::new_v4().to_string(),
            prediction_id: input.prediction_id.to_string(),
            config_id: config_id.clone(),
            user_label: input.user_label,
            user_confidence: input.user_confidence,
            user_id: input.user_id.to_string(),
            review_status: if auto_accept {
                ReviewStatus::Accepted
            } else {
                ReviewStatus::Pending
            },
            reviewed_by: auto_accept.then(|| AUTO_ACCEPT_REVIEWER.to_string()),
            reviewed_at: auto_accept.then_some(now),
            included_in_training: false,
            training_batch_id: None,
            created_at: now,
        };

        self.db.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO feedback (id, prediction_id, config_id, user_label, user_confidence,
                                      user_id, review_status, reviewed_by, reviewed_at,
                                      included_in_training, training_batch_id, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, NULL, ?10)
                "#,
                params![
                    feedback.id,
                    feedback.prediction_id,
                    feedback.config_id,
                    feedback.user_label.as_str(),
                    feedback.user_confidence,
                    feedback.user_id,
                    feedback.review_status.as_str(),
                    feedback.reviewed_by,
                    feedback.reviewed_at.as_ref().map(to_ts),
                    to_ts(&feedback.created_at),
                ],
            )?;
            Ok(())
        })?;

        tracing::info!(
            feedback_id = %feedback.id,
            config_id = %config_id,
            status = feedback.review_status.as_str(),
            "feedback submitted"
        );

        if let Some(url) = &settings.webhook_url {
            self.events.emit(&EngineEvent::FeedbackSubmitted {
                config_id: config_id.clone(),
                feedback_id: feedback.id.clone(),
                webhook_url: url.clone(),
            });
        }
        if auto_accept {
            self.check_retrain(&config_id, settings)?;
        }

        Ok(feedback)
    }

    /// pending -> accepted | rejected, exactly once
    pub fn review(
        &self,
        feedback_id: &str,
        status: ReviewStatus,
        reviewer: &str,
        settings: &FeedbackSettings,
    ) -> EngineResult<Feedback> {
        if status == ReviewStatus::Pending {
            return Err(EngineError::Validation(
                "review status must be accepted or rejected".to_string(),
            ));
        }

        let now = to_ts(&Utc::now());
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                r#"
                UPDATE feedback SET review_status = ?1, reviewed_by = ?2, reviewed_at = ?3
                WHERE id = ?4 AND review_status = 'pending'
                "#,
                params![status.as_str(), reviewer, now, feedback_id],
            )?)
        })?;

        if changed == 0 {
            // Either it never existed or someone else reviewed it first
            self.get(feedback_id)?;
            return Err(EngineError::AlreadyReviewed(feedback_id.to_string()));
        }

        let feedback = self.get(feedback_id)?;
        tracing::info!(
            feedback_id,
            config_id = %feedback.config_id,
            status = status.as_str(),
            reviewer,
            "feedback reviewed"
        );

        if status == ReviewStatus::Accepted {
            self.check_retrain(&feedback.config_id, settings)?;
        }
        Ok(feedback)
    }

    /// Emit `RetrainRecommended` once enough accepted items are waiting
    fn check_retrain(&self, config_id: &str, settings: &FeedbackSettings) -> EngineResult<()> {
        if !settings.auto_retrain {
            return Ok(());
        }
        let candidates = self.batch_candidates(config_id)?;
        if candidates.len() >= settings.retrain_threshold as usize {
            tracing::info!(
                config_id,
                candidates = candidates.len(),
                threshold = settings.retrain_threshold,
                "retrain threshold reached"
            );
            self.events.emit(&EngineEvent::RetrainRecommended {
                config_id: config_id.to_string(),
                batch_candidate_ids: candidates,
                webhook_url: settings.webhook_url.clone(),
            });
        }
        Ok(())
    }

    /// Accepted feedback not yet in a training batch, oldest first
    pub fn batch_candidates(&self, config_id: &str) -> EngineResult<Vec<String>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id FROM feedback
                WHERE config_id = ?1 AND review_status = 'accepted' AND training_batch_id IS NULL
                ORDER BY created_at ASC, rowid ASC
                "#,
            )?;
            let ids = stmt
                .query_map([config_id], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }

    /// Tag accepted, unbatched items as consumed by a training batch.
    /// Returns how many were tagged; ids in any other state are skipped.
    pub fn mark_batched(&self, config_id: &str, batch_id: &str, ids: &[String]) -> EngineResult<usize> {
        if batch_id.trim().is_empty() {
            return Err(EngineError::Validation("batch_id is empty".to_string()));
        }
        let tagged = self.db.with_tx(|tx| {
            let mut stmt = tx.prepare(
                r#"
                UPDATE feedback SET training_batch_id = ?1, included_in_training = 1
                WHERE id = ?2 AND config_id = ?3
                  AND review_status = 'accepted' AND training_batch_id IS NULL
                "#,
            )?;
            let mut tagged = 0;
            for id in ids {
                tagged += stmt.execute(params![batch_id, id, config_id])?;
            }
            Ok(tagged)
        })?;
        tracing::info!(config_id, batch_id, tagged, "feedback batched for training");
        Ok(tagged)
    }

    pub fn get(&self, feedback_id: &str) -> EngineResult<Feedback> {
        let sql = format!("SELECT {} FROM feedback WHERE id = ?1", COLUMNS);
        self.db
            .with_conn(|conn| Ok(conn.query_row(&sql, [feedback_id], feedback_from_row).optional()?))?
            .ok_or_else(|| EngineError::not_found("feedback", feedback_id))?
    }

    /// Pending items for a config, oldest first
    pub fn pending_for(&self, config_id: &str, limit: usize) -> EngineResult<Vec<Feedback>> {
        let sql = format!(
            "SELECT {} FROM feedback WHERE config_id = ?1 AND review_status = 'pending' \
             ORDER BY created_at ASC, rowid ASC LIMIT ?2",
            COLUMNS
        );
        self.query(&sql, params![config_id, limit as i64])
    }

    /// Feedback for a config, newest first, optionally by status
    pub fn list(&self, config_id: &str, status: Option<ReviewStatus>, limit: usize) -> EngineResult<Vec<Feedback>> {
        let sql = format!(
            "SELECT {} FROM feedback WHERE config_id = ?1 AND (?2 IS NULL OR review_status = ?2) \
             ORDER BY created_at DESC, rowid DESC LIMIT ?3",
            COLUMNS
        );
        self.query(&sql, params![config_id, status.map(|s| s.as_str()), limit as i64])
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> EngineResult<Vec<Feedback>> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(params, feedback_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter().collect()
    }
}

/// Row -> Feedback, with decoding errors carried in the inner result
fn feedback_from_row(row: &Row<'_>) -> rusqlite::Result<EngineResult<Feedback>> {
    let user_label: String = row.get(3)?;
    let review_status: String = row.get(6)?;
    let reviewed_at: Option<String> = row.get(8)?;
    let created_at: String = row.get(11)?;

    let id: String = row.get(0)?;
    let prediction_id: String = row.get(1)?;
    let config_id: String = row.get(2)?;
    let user_confidence: Option<f64> = row.get(4)?;
    let user_id: String = row.get(5)?;
    let reviewed_by: Option<String> = row.get(7)?;
    let included_in_training: bool = row.get(9)?;
    let training_batch_id: Option<String> = row.get(10)?;

    let decode = || -> EngineResult<Feedback> {
        Ok(Feedback {
            id,
            prediction_id,
            config_id,
            user_label: user_label.parse()?,
            user_confidence,
            user_id,
            review_status: review_status.parse()?,
            reviewed_by,
            reviewed_at: parse_opt_ts(reviewed_at)?,
            included_in_training,
            training_batch_id,
            created_at: parse_ts(&created_at)?,
        })
    };
    Ok(decode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use crate::predictions::PredictionLog;
    use crate::types::{Channel, DerivedMetrics, ProviderKind};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Fixture {
        ledger: FeedbackLedger,
        log: PredictionLog,
        events: Arc<MemorySink>,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let events = Arc::new(MemorySink::new());
        Fixture {
            ledger: FeedbackLedger::new(db.clone(), events.clone()),
            log: PredictionLog::new(db),
            events,
        }
    }

    fn prediction(confidence: f64, low_confidence: bool) -> Prediction {
        Prediction {
            id: uuid::Uuid::new_v4().to_string(),
            config_id: "cfg".into(),
            config_version_used: 1,
            contact_id: None,
            channel: Channel::Chat,
            text: "meh".into(),
            label: SentimentLabel::Neutral,
            score: 0.0,
            confidence,
            raw_response: serde_json::Value::Null,
            derived_metrics: DerivedMetrics {
                low_confidence,
                ..Default::default()
            },
            model_provider: ProviderKind::Keyword,
            processing_time_ms: 1,
            sampled: false,
            created_at: Utc::now(),
        }
    }

    fn stored(f: &Fixture) -> String {
        let p = prediction(0.9, false);
        f.log.insert(&p).unwrap();
        p.id
    }

    fn submit(f: &Fixture, prediction_id: &str, settings: &FeedbackSettings) -> Feedback {
        f.ledger
            .submit(
                NewFeedback {
                    prediction_id,
                    user_label: SentimentLabel::Positive,
                    user_id: "agent-7",
                    user_confidence: Some(0.8),
                },
                settings,
            )
            .unwrap()
    }

    fn reviewed(threshold: u32) -> FeedbackSettings {
        FeedbackSettings {
            enabled: true,
            auto_retrain: true,
            retrain_threshold: threshold,
            human_review: true,
            webhook_url: None,
        }
    }

    #[test]
    fn test_review_exactly_once() {
        let f = fixture();
        let settings = reviewed(100);
        let pid = stored(&f);
        let fb = submit(&f, &pid, &settings);
        assert_eq!(fb.review_status, ReviewStatus::Pending);

        let accepted = f
            .ledger
            .review(&fb.id, ReviewStatus::Accepted, "lead", &settings)
            .unwrap();
        assert_eq!(accepted.review_status, ReviewStatus::Accepted);
        assert_eq!(accepted.reviewed_by.as_deref(), Some("lead"));

        let again = f.ledger.review(&fb.id, ReviewStatus::Rejected, "lead", &settings);
        assert!(matches!(again, Err(EngineError::AlreadyReviewed(_))));

        let missing = f.ledger.review("nope", ReviewStatus::Accepted, "lead", &settings);
        assert!(matches!(missing, Err(EngineError::NotFound { .. })));
    }

    #[test]
    fn test_pending_items_never_count_toward_retrain() {
        let f = fixture();
        let settings = reviewed(5);
        let ids: Vec<String> = (0..5)
            .map(|_| {
                let pid = stored(&f);
                submit(&f, &pid, &settings).id
            })
            .collect();
        assert_eq!(f.ledger.pending_for("cfg", 10).unwrap().len(), 5);
        assert_eq!(f.events.count("retrain_recommended"), 0);

        for id in &ids[..4] {
            f.ledger.review(id, ReviewStatus::Accepted, "lead", &settings).unwrap();
        }
        assert_eq!(f.events.count("retrain_recommended"), 0);

        f.ledger.review(&ids[4], ReviewStatus::Accepted, "lead", &settings).unwrap();
        let events = f.events.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            EngineEvent::RetrainRecommended {
                batch_candidate_ids, ..
            } => assert_eq!(batch_candidate_ids.len(), 5),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_auto_accept_without_human_review() {
        let f = fixture();
        let settings = FeedbackSettings {
            enabled: true,
            human_review: false,
            webhook_url: Some("https://hooks.example.test/fb".into()),
            ..Default::default()
        };
        let pid = stored(&f);
        let fb = submit(&f, &pid, &settings);
        assert_eq!(fb.review_status, ReviewStatus::Accepted);
        assert_eq!(fb.reviewed_by.as_deref(), Some(AUTO_ACCEPT_REVIEWER));
        assert_eq!(f.events.count("feedback_submitted"), 1);

        let again = f.ledger.review(&fb.id, ReviewStatus::Accepted, "lead", &settings);
        assert!(matches!(again, Err(EngineError::AlreadyReviewed(_))));
    }

    #[test]
    fn test_disabled_feedback_rejected() {
        let f = fixture();
        let pid = stored(&f);
        let err = f
            .ledger
            .submit(
                NewFeedback {
                    prediction_id: &pid,
                    user_label: SentimentLabel::Negative,
                    user_id: "u",
                    user_confidence: None,
                },
                &FeedbackSettings::default(),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_mark_batched_consumes_candidates() {
        let f = fixture();
        let settings = FeedbackSettings {
            enabled: true,
            ..Default::default()
        };
        let a = submit(&f, &stored(&f), &settings);
        let b = submit(&f, &stored(&f), &settings);
        assert_eq!(f.ledger.batch_candidates("cfg").unwrap(), vec![a.id.clone(), b.id.clone()]);

        let tagged = f
            .ledger
            .mark_batched("cfg", "batch-1", &[a.id.clone(), "unknown".into()])
            .unwrap();
        assert_eq!(tagged, 1);
        assert_eq!(f.ledger.batch_candidates("cfg").unwrap(), vec![b.id.clone()]);

        let a = f.ledger.get(&a.id).unwrap();
        assert!(a.included_in_training);
        assert_eq!(a.training_batch_id.as_deref(), Some("batch-1"));
    }

    #[test]
    fn test_list_filters_by_status() {
        let f = fixture();
        let settings = reviewed(100);
        let first = submit(&f, &stored(&f), &settings);
        submit(&f, &stored(&f), &settings);
        f.ledger
            .review(&first.id, ReviewStatus::Rejected, "lead", &settings)
            .unwrap();

        assert_eq!(f.ledger.list("cfg", None, 10).unwrap().len(), 2);
        let rejected = f.ledger.list("cfg", Some(ReviewStatus::Rejected), 10).unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].id, first.id);
    }

    #[test]
    fn test_sampling_strategies() {
        let mut rng = StdRng::seed_from_u64(7);
        let confident = prediction(1.0, false);
        let unsure = prediction(0.2, true);

        let all = SamplingConfig {
            rate: 0.0,
            strategy: SamplingStrategy::All,
            store_low_confidence: false,
        };
        assert!(should_sample(&all, &confident, &mut rng));

        let never = SamplingConfig {
            rate: 0.0,
            strategy: SamplingStrategy::Random,
            store_low_confidence: false,
        };
        assert!(!(0..100).any(|_| should_sample(&never, &confident, &mut rng)));

        let biased = SamplingConfig {
            rate: 0.0,
            strategy: SamplingStrategy::ConfidenceBased,
            store_low_confidence: true,
        };
        assert!(should_sample(&biased, &unsure, &mut rng));
        assert!(!(0..100).any(|_| should_sample(&biased, &confident, &mut rng)));
    }

    #[test]
    fn test_confidence_based_rate_rises_as_confidence_falls() {
        let mut rng = StdRng::seed_from_u64(42);
        let sampling = SamplingConfig {
            rate: 0.1,
            strategy: SamplingStrategy::ConfidenceBased,
            store_low_confidence: false,
        };
        let hits = |conf: f64, rng: &mut StdRng| {
            (0..2000)
                .filter(|_| should_sample(&sampling, &prediction(conf, false), rng))
                .count()
        };
        let high = hits(0.95, &mut rng);
        let low = hits(0.2, &mut rng);
        assert!(low > high * 3, "low={} high={}", low, high);
    }
}
