//! Prediction log
//!
//! Predictions are written once and never updated. Contact history and the
//! aggregated metrics are read-only projections over this table.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::db::{parse_ts, to_ts, Database};
use crate::error::{EngineError, EngineResult};
use crate::types::{Channel, Prediction, ProviderKind, SentimentLabel};

const COLUMNS: &str = "id, config_id, config_version, contact_id, channel, text, label, score, \
                       confidence, raw_response_json, derived_json, model_provider, \
                       processing_time_ms, sampled, created_at";

/// Filter for aggregated metrics; unset fields match everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsFilter {
    #[serde(default)]
    pub config_id: Option<String>,
    #[serde(default)]
    pub contact_id: Option<String>,
    #[serde(default)]
    pub channel: Option<Channel>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LabelStats {
    pub count: u64,
    pub average_score: f64,
    pub average_confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PredictionMetrics {
    pub total: u64,
    pub by_label: BTreeMap<String, LabelStats>,
    pub by_channel: BTreeMap<String, u64>,
    pub average_score: Option<f64>,
    pub low_confidence: u64,
    pub sampled: u64,
}

pub struct PredictionLog {
    db: Arc<Database>,
}

impl PredictionLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn insert(&self, p: &Prediction) -> EngineResult<()> {
        let raw = serde_json::to_string(&p.raw_response)?;
        let derived = serde_json::to_string(&p.derived_metrics)?;
        self.db.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO predictions (id, config_id, config_version, contact_id, channel, text,
                                         label, score, confidence, raw_response_json, derived_json,
                                         model_provider, processing_time_ms, sampled, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                "#,
                params![
                    p.id,
                    p.config_id,
                    p.config_version_used,
                    p.contact_id,
                    p.channel.as_str(),
                    p.text,
                    p.label.as_str(),
                    p.score,
                    p.confidence,
                    raw,
                    derived,
                    p.model_provider.as_str(),
                    p.processing_time_ms as i64,
                    p.sampled,
                    to_ts(&p.created_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, id: &str) -> EngineResult<Prediction> {
        let sql = format!("SELECT {} FROM predictions WHERE id = ?1", COLUMNS);
        let row = self
            .db
            .with_conn(|conn| Ok(conn.query_row(&sql, [id], PredictionRow::from_row).optional()?))?;
        row.ok_or_else(|| EngineError::not_found("prediction", id))?
            .into_prediction()
    }

    /// Newest first
    pub fn contact_history(&self, contact_id: &str, limit: usize) -> EngineResult<Vec<Prediction>> {
        let sql = format!(
            "SELECT {} FROM predictions WHERE contact_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            COLUMNS
        );
        self.query(&sql, params![contact_id, limit as i64])
    }

    /// Sampled predictions that nobody has given feedback on yet, oldest first
    pub fn sampled_without_feedback(&self, config_id: &str, limit: usize) -> EngineResult<Vec<Prediction>> {
        let sql = format!(
            r#"
            SELECT {} FROM predictions p
            WHERE p.config_id = ?1 AND p.sampled = 1
              AND NOT EXISTS (SELECT 1 FROM feedback f WHERE f.prediction_id = p.id)
            ORDER BY p.created_at ASC, p.rowid ASC
            LIMIT ?2
            "#,
            prefixed("p")
        );
        self.query(&sql, params![config_id, limit as i64])
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> EngineResult<Vec<Prediction>> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(params, PredictionRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(PredictionRow::into_prediction).collect()
    }

    pub fn metrics(&self, filter: &MetricsFilter) -> EngineResult<PredictionMetrics> {
        const WHERE: &str = r#"
            WHERE (?1 IS NULL OR config_id = ?1)
              AND (?2 IS NULL OR contact_id = ?2)
              AND (?3 IS NULL OR channel = ?3)
              AND (?4 IS NULL OR created_at >= ?4)
              AND (?5 IS NULL OR created_at <= ?5)
        "#;

        let since = filter.since.as_ref().map(to_ts);
        let until = filter.until.as_ref().map(to_ts);
        let channel = filter.channel.map(|c| c.as_str());
        let bind = params![filter.config_id, filter.contact_id, channel, since, until];

        self.db.with_conn(|conn| {
            let mut metrics = PredictionMetrics::default();

            let mut stmt = conn.prepare(&format!(
                "SELECT label, COUNT(*), AVG(score), AVG(confidence) FROM predictions {} GROUP BY label",
                WHERE
            ))?;
            let rows = stmt
                .query_map(bind, |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut score_sum = 0.0;
            for (label, count, avg_score, avg_confidence) in rows {
                metrics.total += count as u64;
                score_sum += avg_score * count as f64;
                metrics.by_label.insert(
                    label,
                    LabelStats {
                        count: count as u64,
                        average_score: avg_score,
                        average_confidence: avg_confidence,
                    },
                );
            }
            if metrics.total > 0 {
                metrics.average_score = Some(score_sum / metrics.total as f64);
            }

            let mut stmt = conn.prepare(&format!(
                "SELECT channel, COUNT(*) FROM predictions {} GROUP BY channel",
                WHERE
            ))?;
            let channels = stmt
                .query_map(bind, |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            metrics.by_channel = channels.into_iter().map(|(c, n)| (c, n as u64)).collect();

            let (low, sampled): (i64, i64) = conn.query_row(
                &format!(
                    "SELECT COALESCE(SUM(json_extract(derived_json, '$.low_confidence')), 0), \
                            COALESCE(SUM(sampled), 0) FROM predictions {}",
                    WHERE
                ),
                bind,
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            metrics.low_confidence = low as u64;
            metrics.sampled = sampled as u64;

            Ok(metrics)
        })
    }
}

fn prefixed(alias: &str) -> String {
    COLUMNS
        .split(',')
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

struct PredictionRow {
    id: String,
    config_id: String,
    config_version: u32,
    contact_id: Option<String>,
    channel: String,
    text: String,
    label: String,
    score: f64,
    confidence: f64,
    raw_response_json: String,
    derived_json: String,
    model_provider: String,
    processing_time_ms: i64,
    sampled: bool,
    created_at: String,
}

impl PredictionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            config_id: row.get(1)?,
            config_version: row.get(2)?,
            contact_id: row.get(3)?,
            channel: row.get(4)?,
            text: row.get(5)?,
            label: row.get(6)?,
            score: row.get(7)?,
            confidence: row.get(8)?,
            raw_response_json: row.get(9)?,
            derived_json: row.get(10)?,
            model_provider: row.get(11)?,
            processing_time_ms: row.get(12)?,
            sampled: row.get(13)?,
            created_at: row.get(14)?,
        })
    }

    fn into_prediction(self) -> EngineResult<Prediction> {
        let storage = |what: &str, value: &str| EngineError::Storage(format!("bad {} '{}' in predictions", what, value));
        Ok(Prediction {
            channel: self
                .channel
                .parse::<Channel>()
                .map_err(|_| storage("channel", &self.channel))?,
            label: self
                .label
                .parse::<SentimentLabel>()
                .map_err(|_| storage("label", &self.label))?,
            model_provider: self
                .model_provider
                .parse::<ProviderKind>()
                .map_err(|_| storage("provider", &self.model_provider))?,
            raw_response: serde_json::from_str(&self.raw_response_json)?,
            derived_metrics: serde_json::from_str(&self.derived_json)?,
            created_at: parse_ts(&self.created_at)?,
            id: self.id,
            config_id: self.config_id,
            config_version_used: self.config_version,
            contact_id: self.contact_id,
            text: self.text,
            score: self.score,
            confidence: self.confidence,
            processing_time_ms: self.processing_time_ms.max(0) as u64,
            sampled: self.sampled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DerivedMetrics;

    fn prediction(id: &str, contact: Option<&str>, label: SentimentLabel, score: f64) -> Prediction {
        Prediction {
            id: id.into(),
            config_id: "cfg".into(),
            config_version_used: 1,
            contact_id: contact.map(str::to_string),
            channel: Channel::Email,
            text: "hello".into(),
            label,
            score,
            confidence: 0.9,
            raw_response: serde_json::json!({"provider": "keyword"}),
            derived_metrics: DerivedMetrics {
                low_confidence: label == SentimentLabel::Neutral,
                ..Default::default()
            },
            model_provider: ProviderKind::Keyword,
            processing_time_ms: 3,
            sampled: label == SentimentLabel::Negative,
            created_at: Utc::now(),
        }
    }

    fn log() -> PredictionLog {
        PredictionLog::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn test_insert_and_get() {
        let log = log();
        let p = prediction("p1", Some("c1"), SentimentLabel::Positive, 0.5);
        log.insert(&p).unwrap();
        assert_eq!(log.get("p1").unwrap(), p);
        assert!(matches!(log.get("nope"), Err(EngineError::NotFound { .. })));
    }

    #[test]
    fn test_contact_history_newest_first() {
        let log = log();
        for i in 0..3 {
            let mut p = prediction(&format!("p{}", i), Some("c1"), SentimentLabel::Neutral, 0.0);
            p.created_at = Utc::now() + chrono::Duration::seconds(i);
            log.insert(&p).unwrap();
        }
        log.insert(&prediction("other", Some("c2"), SentimentLabel::Neutral, 0.0))
            .unwrap();

        let ids: Vec<String> = log
            .contact_history("c1", 2)
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["p2", "p1"]);
    }

    #[test]
    fn test_metrics_aggregation() {
        let log = log();
        log.insert(&prediction("a", None, SentimentLabel::Positive, 0.8)).unwrap();
        log.insert(&prediction("b", None, SentimentLabel::Positive, 0.4)).unwrap();
        log.insert(&prediction("c", None, SentimentLabel::Negative, -0.6)).unwrap();
        log.insert(&prediction("d", None, SentimentLabel::Neutral, 0.0)).unwrap();

        let m = log.metrics(&MetricsFilter::default()).unwrap();
        assert_eq!(m.total, 4);
        assert_eq!(m.by_label["positive"].count, 2);
        assert!((m.by_label["positive"].average_score - 0.6).abs() < 1e-9);
        assert!((m.average_score.unwrap() - 0.15).abs() < 1e-9);
        assert_eq!(m.by_channel["email"], 4);
        assert_eq!(m.low_confidence, 1);
        assert_eq!(m.sampled, 1);

        let none = log
            .metrics(&MetricsFilter {
                config_id: Some("other".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(none.total, 0);
        assert!(none.average_score.is_none());
    }
}
