use indexmap::IndexMap;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Serialize;
use serde_json::Value;

use crate::snapshot::MetricsSnapshot;

/// Payload format version understood by the collector.
pub const PAYLOAD_VERSION: u32 = 1;

/// Path of the report endpoint on `<company>.logicmonitor.com`.
pub const REPORT_PATH: &str = "/statsd/api/reportData";

// Same set `encodeURIComponent` leaves alone: A-Z a-z 0-9 - _ . ! ~ * ' ( )
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Body of one `reportData` request.
#[derive(Debug, Serialize)]
pub struct Payload<'a> {
    pub namespace: &'a str,
    pub version: u32,
    pub data: PayloadData<'a>,
}

#[derive(Debug, Serialize)]
pub struct PayloadData<'a> {
    /// Seconds.
    #[serde(rename = "flushInterval")]
    pub flush_interval: Value,
    /// Milliseconds since the epoch.
    pub timestamp: u64,
    pub counters_rates: IndexMap<&'a str, Value>,
    pub gauges: IndexMap<&'a str, Value>,
    pub sets_sizes: IndexMap<&'a str, usize>,
    pub timer_data: IndexMap<&'a str, IndexMap<String, Value>>,
    #[serde(rename = "pctThreshold")]
    pub pct_threshold: Value,
}

/// Reshapes a flush snapshot into the collector's payload.
///
/// `timestamp` is in seconds, as delivered by the host.
pub fn compose_payload<'a>(
    namespace: &'a str,
    timestamp: u64,
    snapshot: &'a MetricsSnapshot,
) -> Payload<'a> {
    let pct = snapshot.pct_threshold;
    let upper_pct = percentile_key(pct);

    let timer_data = snapshot
        .timer_data
        .iter()
        .map(|(name, timer)| {
            let mut entry = IndexMap::with_capacity(5);
            entry.insert("count".to_string(), number(timer.count));
            entry.insert("upper".to_string(), number(timer.upper));
            entry.insert("lower".to_string(), number(timer.lower));
            entry.insert("mean".to_string(), number(timer.mean));
            if let Some(value) = timer.upper_percentile(pct) {
                entry.insert(upper_pct.clone(), number(value));
            }
            (name.as_str(), entry)
        })
        .collect();

    Payload {
        namespace,
        version: PAYLOAD_VERSION,
        data: PayloadData {
            flush_interval: number(snapshot.flush_interval_ms as f64 / 1000.0),
            timestamp: timestamp.saturating_mul(1000),
            counters_rates: numbers(&snapshot.counter_rates),
            gauges: numbers(&snapshot.gauges),
            sets_sizes: snapshot
                .sets
                .iter()
                .map(|(name, members)| (name.as_str(), members.len()))
                .collect(),
            timer_data,
            pct_threshold: number(pct),
        },
    }
}

/// Builds the full request URL, credentials included as query parameters.
pub fn report_url(
    scheme: &str,
    host: &str,
    port: u16,
    namespace: &str,
    company: &str,
    token: &str,
    access_id: &str,
) -> String {
    format!(
        "{scheme}://{host}:{port}{REPORT_PATH}?namespace={}&company={company}&statsdToken={}&statsdAccessId={}",
        utf8_percent_encode(namespace, QUERY_VALUE),
        utf8_percent_encode(token, QUERY_VALUE),
        utf8_percent_encode(access_id, QUERY_VALUE),
    )
}

/// Default endpoint host for an account.
pub fn company_host(company: &str) -> String {
    format!("{company}.logicmonitor.com")
}

/// Strips everything outside `[A-Za-z0-9._-]`.
pub fn sanitize_namespace(name: &str) -> String {
    name.chars().filter(|c| !invalid_namespace_character(*c)).collect()
}

/// The `upper_<pct>` key statsd uses for a percentile threshold.
pub fn percentile_key(threshold: f64) -> String {
    format!("upper_{}", threshold.to_string().replace('.', "_"))
}

// Integral values go out as JSON integers, the way the host would write them.
fn number(value: f64) -> Value {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

fn numbers(values: &IndexMap<String, f64>) -> IndexMap<&str, Value> {
    values
        .iter()
        .map(|(name, value)| (name.as_str(), number(*value)))
        .collect()
}

#[inline]
fn invalid_namespace_character(c: char) -> bool {
    // Essentially, needs to match the regex pattern of [A-Za-z0-9._-].
    !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}
