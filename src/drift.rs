//! Drift monitor: live label distribution vs. the baseline of the active version
//!
//! Per monitored config we keep a bounded ring buffer of recent labels and a
//! baseline histogram. Divergence is KL(window || baseline) over the four
//! labels with additive smoothing; a chi-squared goodness-of-fit p-value is
//! reported alongside.
//!
//! State belongs to one effective payload: a new version, or a parent change
//! that alters the overlaid payload, starts a fresh baseline.
//!
//! A breach either rolls the config back (once) or raises an alert (once per
//! breach episode).

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventSink};
use crate::provenance::content_hash;
use crate::resolver::EffectiveConfig;
use crate::store::VersionStore;
use crate::types::{DriftSettings, Prediction, SentimentLabel};

pub const AUTO_ROLLBACK_REASON: &str = "auto-rollback: drift";
pub const DRIFT_MONITOR_USER: &str = "system:drift-monitor";

/// Pseudo-count added to every label bucket
const SMOOTHING: f64 = 0.5;

const LABELS: usize = SentimentLabel::ALL.len();

type Histogram = [f64; LABELS];

/// Label -> relative weight. Normalized on use.
pub type LabelDistribution = BTreeMap<SentimentLabel, f64>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriftAction {
    Alerted,
    RolledBack {
        from_version: u32,
        to_version: u32,
        new_version: u32,
    },
    /// Breach with rollback requested but no earlier version to return to
    AlertedNoTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriftResult {
    pub config_id: String,
    pub version: Option<u32>,
    pub monitored: bool,
    pub baseline_ready: bool,
    pub samples: usize,
    pub divergence: f64,
    pub p_value: Option<f64>,
    pub threshold: f64,
    pub breached: bool,
    pub window: BTreeMap<SentimentLabel, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<DriftAction>,
}

struct ConfigDrift {
    version: u32,
    payload_hash: String,
    /// Hash of the overlaid payload, parents included
    effective_hash: String,
    settings: DriftSettings,
    baseline: Option<Histogram>,
    pending_baseline: Histogram,
    pending_count: usize,
    window: VecDeque<SentimentLabel>,
    counts: Histogram,
    alerted: bool,
    rolling_back: bool,
}

impl ConfigDrift {
    fn new(effective: &EffectiveConfig) -> Self {
        Self {
            version: effective.version(),
            payload_hash: effective.config.payload_hash.clone(),
            effective_hash: effective_hash(effective),
            settings: effective.payload.drift(),
            baseline: None,
            pending_baseline: [0.0; LABELS],
            pending_count: 0,
            window: VecDeque::new(),
            counts: [0.0; LABELS],
            alerted: false,
            rolling_back: false,
        }
    }

    fn record(&mut self, label: SentimentLabel, window_size: usize, baseline_size: usize) {
        if self.baseline.is_none() {
            self.pending_baseline[label.index()] += 1.0;
            self.pending_count += 1;
            if self.pending_count >= baseline_size {
                self.baseline = Some(self.pending_baseline);
            }
            return;
        }

        self.window.push_back(label);
        self.counts[label.index()] += 1.0;
        while self.window.len() > window_size {
            if let Some(old) = self.window.pop_front() {
                self.counts[old.index()] -= 1.0;
            }
        }
    }

    fn alert_event(&self, config_id: &str, divergence: f64) -> EngineEvent {
        EngineEvent::DriftAlert {
            config_id: config_id.to_string(),
            version: self.version,
            divergence,
            threshold: self.settings.threshold,
            alert_target: self.settings.alert_target.clone(),
        }
    }

    fn window_counts(&self) -> BTreeMap<SentimentLabel, u64> {
        SentimentLabel::ALL
            .iter()
            .map(|l| (*l, self.counts[l.index()] as u64))
            .collect()
    }
}

fn effective_hash(effective: &EffectiveConfig) -> String {
    let bytes = serde_json::to_vec(&effective.payload).unwrap_or_default();
    content_hash(&bytes)
}

fn smoothed(h: &Histogram) -> Histogram {
    let total: f64 = h.iter().sum::<f64>() + SMOOTHING * LABELS as f64;
    let mut p = [0.0; LABELS];
    for (i, v) in h.iter().enumerate() {
        p[i] = (v + SMOOTHING) / total;
    }
    p
}

/// KL(P || Q) in nats, both smoothed
pub fn kl_divergence(window: &Histogram, baseline: &Histogram) -> f64 {
    let p = smoothed(window);
    let q = smoothed(baseline);
    p.iter()
        .zip(q.iter())
        .map(|(pi, qi)| pi * (pi / qi).ln())
        .sum::<f64>()
        .max(0.0)
}

/// Goodness-of-fit p-value of the window counts against the baseline shape
pub fn chi_squared_p_value(window: &Histogram, baseline: &Histogram) -> Option<f64> {
    let n: f64 = window.iter().sum();
    if n <= 0.0 {
        return None;
    }
    let q = smoothed(baseline);
    let statistic: f64 = window
        .iter()
        .zip(q.iter())
        .map(|(o, qi)| {
            let e = n * qi;
            (o - e).powi(2) / e
        })
        .sum();
    let dist = ChiSquared::new((LABELS - 1) as f64).ok()?;
    Some(1.0 - dist.cdf(statistic))
}

pub struct DriftMonitor {
    states: DashMap<String, ConfigDrift>,
    store: Arc<VersionStore>,
    events: Arc<dyn EventSink>,
    window_size: usize,
    min_samples: usize,
    baseline_size: usize,
}

impl DriftMonitor {
    pub fn new(
        store: Arc<VersionStore>,
        events: Arc<dyn EventSink>,
        window_size: usize,
        min_samples: usize,
        baseline_size: usize,
    ) -> Self {
        Self {
            states: DashMap::new(),
            store,
            events,
            window_size: window_size.max(1),
            min_samples,
            baseline_size: baseline_size.max(1),
        }
    }

    /// Feed one prediction made with `effective`
    pub fn observe(&self, effective: &EffectiveConfig, prediction: &Prediction) {
        let config_id = effective.config_id();
        if !effective.payload.drift().enabled {
            self.states.remove(config_id);
            return;
        }

        let mut state = self
            .states
            .entry(config_id.to_string())
            .or_insert_with(|| ConfigDrift::new(effective));

        if effective.version() < state.version || state.rolling_back {
            // Prediction from a version that has already been replaced
            return;
        }
        if effective.version() > state.version {
            tracing::debug!(
                config_id,
                from = state.version,
                to = effective.version(),
                "new version activated, drift state reset"
            );
            *state = ConfigDrift::new(effective);
        } else {
            let hash = effective_hash(effective);
            if hash != state.effective_hash {
                tracing::debug!(
                    config_id,
                    version = state.version,
                    "inherited payload changed, drift state reset"
                );
                *state = ConfigDrift::new(effective);
            }
        }
        state.settings = effective.payload.drift();
        state.record(prediction.label, self.window_size, self.baseline_size);
    }

    /// Replace the baseline of the current version with an explicit distribution
    pub fn set_baseline(&self, effective: &EffectiveConfig, distribution: &LabelDistribution) -> EngineResult<()> {
        let total: f64 = distribution.values().sum();
        if distribution.values().any(|w| !w.is_finite() || *w < 0.0) || total <= 0.0 {
            return Err(EngineError::Validation(
                "baseline weights must be non-negative with a positive sum".to_string(),
            ));
        }

        let mut histogram = [0.0; LABELS];
        for (label, weight) in distribution {
            histogram[label.index()] = weight / total * self.baseline_size as f64;
        }

        let mut state = self
            .states
            .entry(effective.config_id().to_string())
            .or_insert_with(|| ConfigDrift::new(effective));
        if state.version != effective.version() || state.effective_hash != effective_hash(effective) {
            *state = ConfigDrift::new(effective);
        }
        state.baseline = Some(histogram);
        tracing::info!(config_id = effective.config_id(), version = state.version, "drift baseline set");
        Ok(())
    }

    /// Compute divergence and act on a breach
    pub fn check_drift(&self, config_id: &str) -> EngineResult<DriftResult> {
        let Some(mut state) = self.states.get_mut(config_id) else {
            return Ok(DriftResult {
                config_id: config_id.to_string(),
                version: None,
                monitored: false,
                baseline_ready: false,
                samples: 0,
                divergence: 0.0,
                p_value: None,
                threshold: 0.0,
                breached: false,
                window: BTreeMap::new(),
                action: None,
            });
        };

        let samples = state.window.len();
        let (divergence, p_value) = match &state.baseline {
            Some(baseline) if samples > 0 => (
                kl_divergence(&state.counts, baseline),
                chi_squared_p_value(&state.counts, baseline),
            ),
            _ => (0.0, None),
        };
        let threshold = state.settings.threshold;
        let breached = state.baseline.is_some()
            && samples >= self.min_samples
            && divergence > threshold;

        let mut result = DriftResult {
            config_id: config_id.to_string(),
            version: Some(state.version),
            monitored: true,
            baseline_ready: state.baseline.is_some(),
            samples,
            divergence,
            p_value,
            threshold,
            breached,
            window: state.window_counts(),
            action: None,
        };

        if !breached {
            state.alerted = false;
            return Ok(result);
        }
        if state.rolling_back || state.alerted {
            return Ok(result);
        }

        tracing::warn!(
            config_id,
            version = state.version,
            divergence,
            threshold,
            samples,
            "drift threshold breached"
        );

        if !state.settings.rollback_on_drift {
            state.alerted = true;
            let event = state.alert_event(config_id, divergence);
            drop(state);
            self.events.emit(&event);
            result.action = Some(DriftAction::Alerted);
            return Ok(result);
        }

        // Claim the rollback, then release the map entry before touching storage
        state.rolling_back = true;
        let from_version = state.version;
        let payload_hash = state.payload_hash.clone();
        drop(state);

        match self.rollback(config_id, from_version, &payload_hash, divergence) {
            Ok(Some(action)) => {
                result.action = Some(action);
                Ok(result)
            }
            Ok(None) => {
                let event = self.states.get_mut(config_id).map(|mut state| {
                    state.rolling_back = false;
                    state.alerted = true;
                    state.alert_event(config_id, divergence)
                });
                if let Some(event) = event {
                    self.events.emit(&event);
                }
                result.action = Some(DriftAction::AlertedNoTarget);
                Ok(result)
            }
            Err(e) => {
                if let Some(mut state) = self.states.get_mut(config_id) {
                    state.rolling_back = false;
                }
                Err(e)
            }
        }
    }

    fn rollback(
        &self,
        config_id: &str,
        from_version: u32,
        payload_hash: &str,
        divergence: f64,
    ) -> EngineResult<Option<DriftAction>> {
        let Some(target) = self.rollback_target(config_id, from_version, payload_hash)? else {
            tracing::warn!(config_id, from_version, "no earlier version to roll back to");
            return Ok(None);
        };

        let restored = self.store.rollback_with(
            config_id,
            target,
            DRIFT_MONITOR_USER,
            Some(AUTO_ROLLBACK_REASON),
        )?;

        // Fresh state for the restored version; its baseline is captured anew
        self.states.remove(config_id);

        self.events.emit(&EngineEvent::AutoRollback {
            config_id: config_id.to_string(),
            from_version,
            to_version: target,
            divergence,
        });

        Ok(Some(DriftAction::RolledBack {
            from_version,
            to_version: target,
            new_version: restored.version,
        }))
    }

    /// Most recent earlier version that was enabled, not deleted, and differs
    /// from the monitored payload
    fn rollback_target(&self, config_id: &str, before: u32, payload_hash: &str) -> EngineResult<Option<u32>> {
        let versions = self.store.list_versions(config_id)?;
        Ok(versions
            .iter()
            .rev()
            .filter(|c| c.version < before)
            .find(|c| c.is_active() && c.payload_hash != payload_hash)
            .map(|c| c.version))
    }

    pub fn is_monitored(&self, config_id: &str) -> bool {
        self.states.contains_key(config_id)
    }
}
