//! Typed view of the metrics a statsd host hands over on every flush.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::formatting::percentile_key;

const DEFAULT_FLUSH_INTERVAL_MS: u64 = 10_000;
const DEFAULT_PCT_THRESHOLD: f64 = 90.0;

/// Aggregated metrics for one flush cycle.
///
/// Every map defaults to empty when the host omits it, so a partial snapshot is
/// treated as "nothing of that kind this cycle" rather than an error.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsSnapshot {
    /// Counter values already divided by the flush interval.
    pub counter_rates: IndexMap<String, f64>,
    pub gauges: IndexMap<String, f64>,
    /// Distinct members seen per set; only the cardinality is forwarded.
    pub sets: IndexMap<String, IndexSet<String>>,
    pub timer_data: IndexMap<String, TimerSummary>,
    #[serde(rename = "flushInterval")]
    pub flush_interval_ms: u64,
    /// The first configured threshold when the host lists several.
    #[serde(rename = "pctThreshold", deserialize_with = "deserialize_pct_threshold")]
    pub pct_threshold: f64,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self {
            counter_rates: IndexMap::new(),
            gauges: IndexMap::new(),
            sets: IndexMap::new(),
            timer_data: IndexMap::new(),
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            pct_threshold: DEFAULT_PCT_THRESHOLD,
        }
    }
}

impl MetricsSnapshot {
    pub fn new(flush_interval_ms: u64, pct_threshold: f64) -> Self {
        Self {
            flush_interval_ms,
            pct_threshold,
            ..Default::default()
        }
    }

    /// Total number of metric entries across all kinds.
    pub fn len(&self) -> usize {
        self.counter_rates.len() + self.gauges.len() + self.sets.len() + self.timer_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn deserialize_pct_threshold<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_threshold(deserializer)?.unwrap_or(DEFAULT_PCT_THRESHOLD))
}

// statsd takes either a single percentile or a list of them; only the first one
// is reported.
pub(crate) fn deserialize_threshold<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Threshold {
        Single(f64),
        List(Vec<f64>),
    }

    let threshold = Option::<Threshold>::deserialize(deserializer)?;
    Ok(threshold.and_then(|threshold| match threshold {
        Threshold::Single(value) => Some(value),
        Threshold::List(values) => values.first().copied(),
    }))
}

/// Per-timer summary computed by the host.
///
/// statsd emits one `upper_<pct>` key per configured percentile next to the
/// fixed fields; those land in `percentiles` untouched.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimerSummary {
    pub count: f64,
    pub upper: f64,
    pub lower: f64,
    pub mean: f64,
    #[serde(flatten)]
    pub percentiles: IndexMap<String, Value>,
}

impl TimerSummary {
    pub fn new(count: f64, lower: f64, upper: f64, mean: f64) -> Self {
        Self {
            count,
            upper,
            lower,
            mean,
            percentiles: IndexMap::new(),
        }
    }

    /// Sets the upper bound at the given percentile threshold.
    #[must_use]
    pub fn with_upper_percentile(mut self, threshold: f64, value: f64) -> Self {
        self.percentiles
            .insert(percentile_key(threshold), Value::from(value));
        self
    }

    /// The upper bound at `threshold`, if the host computed one.
    pub fn upper_percentile(&self, threshold: f64) -> Option<f64> {
        self.percentiles
            .get(&percentile_key(threshold))
            .and_then(Value::as_f64)
    }
}
