//! A statsd flush backend that forwards aggregated metrics to LogicMonitor.
//!
//! ## Basics
//!
//! `statsd-backend-logicmonitor` sits behind a statsd-style aggregation daemon. Every time the
//! daemon flushes, the backend reshapes the flushed counters, gauges, sets and timers into the
//! LogicMonitor `reportData` JSON payload and POSTs it to `<company>.logicmonitor.com`.
//!
//! ## Behavior
//!
//! This backend makes some explicit trade-offs to accomplish its task:
//!
//! - Each flush produces exactly one request, sent on a Tokio task; the flush itself never waits
//!   on the network
//! - There is no retry, no batching across flushes and no ordering between overlapping requests
//! - Every request is bounded by a timeout, after which it is aborted
//! - Failures (transport errors, timeouts, non-200 responses) are logged through [`tracing`] and
//!   dropped; nothing is reported back to the host
//! - Sets are forwarded as their cardinality only
//!
//! The backend also records a few metrics about itself through the [`metrics`] facade
//! (`logicmonitor.flushes`, `logicmonitor.deliveries` by outcome, `logicmonitor.request.duration`);
//! they go nowhere unless the host installs a recorder.
//!
//! ## Usage
//!
//! Hosts that already parse their configuration as JSON can hand it straight to [`init`]:
//!
//! ```ignore
//! let config = HostConfig::from_json(&raw)?;
//! let mut events = FlushEmitter::new();
//!
//! if !statsd_backend_logicmonitor::init(startup_time, &config, &mut events) {
//!     // missing credentials, already logged; carry on without this backend
//! }
//!
//! // on every flush cycle, with the host's flush interval and percentile threshold
//! let mut snapshot = config.new_snapshot();
//! snapshot.gauges.insert("cpu".to_string(), 0.5);
//! events.emit(timestamp, &snapshot);
//! ```
//!
//! Everything is also reachable through the builder, which additionally hands back the
//! backend so a caller can await individual deliveries:
//!
//! ```ignore
//! let backend = LogicMonitorBuilder::new()
//!     .set_company("acme")
//!     .set_access_id("id1")
//!     .set_access_token("tok1")
//!     .set_timeout(Duration::from_secs(5))
//!     .build()?;
//!
//! backend.flush(timestamp, &snapshot)?.await?;
//! ```
mod common;
pub use self::common::{BuildError, ForwardError, Scheme};

mod builder;
pub use self::builder::LogicMonitorBuilder;

pub mod config;
pub use self::config::{HostConfig, LogicMonitorConfig};

mod events;
pub use self::events::{FlushEmitter, FlushListener, FlushSubscriber};

pub mod formatting;

mod forwarder;
pub use self::forwarder::{Delivery, LogicMonitorBackend};

mod snapshot;
pub use self::snapshot::{MetricsSnapshot, TimerSummary};

use tracing::{debug, error};

/// Initializes the backend from the host configuration and subscribes it to `events`.
///
/// Returns `false`, after logging why, when the `logicmonitor` block or any of its credentials
/// is missing; nothing is subscribed in that case.
pub fn init<E>(startup_time: u64, config: &HostConfig, events: &mut E) -> bool
where
    E: FlushSubscriber + ?Sized,
{
    let installed = config
        .logicmonitor
        .as_ref()
        .ok_or(BuildError::MissingConfigBlock)
        .and_then(LogicMonitorBuilder::from_config)
        .and_then(|builder| builder.install(events));

    match installed {
        Ok(backend) => {
            debug!(startup_time, namespace = backend.namespace(), "logicmonitor backend registered");
            true
        }
        Err(e) => {
            error!("{}", e);
            false
        }
    }
}
