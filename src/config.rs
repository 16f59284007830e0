//! Host configuration as the statsd daemon hands it to its backends.
//!
//! Only the `logicmonitor` block belongs to this crate; `flushInterval` and
//! `percentThreshold` are read so a host can seed [`MetricsSnapshot`]s with
//! the same settings it aggregates with.
//!
//! [`MetricsSnapshot`]: crate::MetricsSnapshot

use serde::{Deserialize, Deserializer};

use crate::snapshot::{deserialize_threshold, MetricsSnapshot};

/// Whole host configuration; unknown keys are ignored.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    pub logicmonitor: Option<LogicMonitorConfig>,
    /// Milliseconds.
    pub flush_interval: Option<u64>,
    /// The first threshold when several are configured.
    #[serde(default, deserialize_with = "deserialize_threshold")]
    pub percent_threshold: Option<f64>,
}

impl HostConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// An empty snapshot carrying this host's flush interval and percentile threshold.
    pub fn new_snapshot(&self) -> MetricsSnapshot {
        let defaults = MetricsSnapshot::default();
        MetricsSnapshot::new(
            self.flush_interval.unwrap_or(defaults.flush_interval_ms),
            self.percent_threshold.unwrap_or(defaults.pct_threshold),
        )
    }
}

/// The `logicmonitor` block.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicMonitorConfig {
    pub company: Option<String>,
    pub statsd_access_id: Option<String>,
    pub statsd_token: Option<String>,
    pub namespace: Option<String>,
    pub protocol: Option<String>,
    pub port: Option<u16>,
    /// Seconds.
    pub timeout: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_reject_unauthorized")]
    pub reject_unauthorized: Option<bool>,
    pub log_payloads: Option<bool>,
    pub endpoint_host: Option<String>,
}

impl std::fmt::Debug for LogicMonitorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicMonitorConfig")
            .field("company", &self.company)
            .field("statsd_access_id", &self.statsd_access_id.as_ref().map(|_| "***"))
            .field("statsd_token", &self.statsd_token.as_ref().map(|_| "***"))
            .field("namespace", &self.namespace)
            .field("protocol", &self.protocol)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .field("reject_unauthorized", &self.reject_unauthorized)
            .field("log_payloads", &self.log_payloads)
            .field("endpoint_host", &self.endpoint_host)
            .finish()
    }
}

// Hosts write this as either a JSON boolean or a string. Only "false" (any case)
// turns verification off; every other value keeps it on.
fn deserialize_reject_unauthorized<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
        Number(f64),
    }

    let flag = Option::<Flag>::deserialize(deserializer)?;
    Ok(flag.map(|flag| match flag {
        Flag::Bool(value) => value,
        Flag::Text(text) => !text.eq_ignore_ascii_case("false"),
        Flag::Number(_) => true,
    }))
}
