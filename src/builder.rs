use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::runtime;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::common::{BuildError, Scheme};
use crate::config::LogicMonitorConfig;
use crate::events::FlushSubscriber;
use crate::formatting::{company_host, report_url, sanitize_namespace};
use crate::forwarder::{Inner, LogicMonitorBackend, Settings};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const THREAD_NAME: &str = "logicmonitor-backend";

/// Builder for creating and installing a LogicMonitor backend.
#[derive(Clone)]
pub struct LogicMonitorBuilder {
    company: Option<String>,
    access_id: Option<String>,
    access_token: Option<String>,
    namespace: Option<String>,
    scheme: Scheme,
    port: Option<u16>,
    timeout: Duration,
    verify_tls: bool,
    log_payloads: bool,
    endpoint_host: Option<String>,
}

impl LogicMonitorBuilder {
    /// Creates a new [`LogicMonitorBuilder`] with every setting at its default.
    pub fn new() -> Self {
        Self {
            company: None,
            access_id: None,
            access_token: None,
            namespace: None,
            scheme: Scheme::Https,
            port: None,
            timeout: DEFAULT_TIMEOUT,
            verify_tls: true,
            log_payloads: true,
            endpoint_host: None,
        }
    }

    /// Creates a builder from the host's `logicmonitor` configuration block.
    ///
    /// ## Errors
    ///
    /// If `protocol` is set to anything but `http` or `https`, an error variant will be returned.
    /// Missing credentials are only reported by [`build`][Self::build].
    pub fn from_config(config: &LogicMonitorConfig) -> Result<Self, BuildError> {
        let mut builder = Self::new();
        builder.company = config.company.clone();
        builder.access_id = config.statsd_access_id.clone();
        builder.access_token = config.statsd_token.clone();
        builder.namespace = config.namespace.clone();
        builder.port = config.port;
        builder.endpoint_host = config.endpoint_host.clone();
        if let Some(protocol) = &config.protocol {
            builder.scheme = protocol.parse()?;
        }
        if let Some(secs) = config.timeout.filter(|secs| *secs > 0) {
            builder.timeout = Duration::from_secs(secs);
        }
        if let Some(reject) = config.reject_unauthorized {
            builder.verify_tls = reject;
        }
        if let Some(log_payloads) = config.log_payloads {
            builder.log_payloads = log_payloads;
        }
        Ok(builder)
    }

    /// Sets the LogicMonitor account name. Required.
    #[must_use]
    pub fn set_company<S: Into<String>>(mut self, company: S) -> Self {
        self.company = Some(company.into());
        self
    }

    /// Sets the statsd access id. Required.
    #[must_use]
    pub fn set_access_id<S: Into<String>>(mut self, access_id: S) -> Self {
        self.access_id = Some(access_id.into());
        self
    }

    /// Sets the statsd access token. Required.
    #[must_use]
    pub fn set_access_token<S: Into<String>>(mut self, access_token: S) -> Self {
        self.access_token = Some(access_token.into());
        self
    }

    /// Sets the namespace metrics are reported under.
    ///
    /// Defaults to the local hostname. Either way, every character outside
    /// `[A-Za-z0-9._-]` is dropped.
    #[must_use]
    pub fn set_namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Defaults to [`Scheme::Https`].
    #[must_use]
    pub fn set_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Defaults to 443 for https and 80 for http.
    #[must_use]
    pub fn set_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets how long a single delivery may take, response body included.
    ///
    /// Defaults to 15 seconds.
    #[must_use]
    pub fn set_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Controls TLS certificate verification. Defaults to `true`.
    #[must_use]
    pub fn verify_tls_certificates(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    /// Controls whether request and response bodies are logged at info level.
    ///
    /// Bodies carry metric names and values. Defaults to `true`.
    #[must_use]
    pub fn log_payloads(mut self, enabled: bool) -> Self {
        self.log_payloads = enabled;
        self
    }

    /// Overrides the `<company>.logicmonitor.com` endpoint host.
    #[must_use]
    pub fn set_endpoint_host<S: Into<String>>(mut self, host: S) -> Self {
        self.endpoint_host = Some(host.into());
        self
    }

    /// Builds the backend and subscribes it to `events`.
    ///
    /// ## Errors
    ///
    /// Same as [`build`][Self::build]; nothing is subscribed on error.
    pub fn install<E>(self, events: &mut E) -> Result<LogicMonitorBackend, BuildError>
    where
        E: FlushSubscriber + ?Sized,
    {
        let backend = self.build()?;
        events.subscribe(Arc::new(backend.clone()));
        Ok(backend)
    }

    /// Builds the backend.
    ///
    /// When called from within a Tokio runtime, deliveries are spawned onto that runtime.
    /// Otherwise, a new single-threaded Tokio runtime is created on a background thread,
    /// which lives as long as the backend.
    ///
    /// ## Errors
    ///
    /// If the company, access id or access token is missing, if the HTTP client cannot be
    /// built, or if the fallback runtime cannot be started, an error variant will be returned.
    pub fn build(self) -> Result<LogicMonitorBackend, BuildError> {
        let settings = self.build_settings()?;

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!self.verify_tls)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build()?;

        let (handle, shutdown) = match runtime::Handle::try_current() {
            Ok(handle) => (handle, None),
            Err(_) => {
                let runtime = runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| BuildError::FailedToCreateRuntime(e.to_string()))?;
                let handle = runtime.handle().clone();
                let (tx, rx) = oneshot::channel::<()>();

                thread::Builder::new()
                    .name(THREAD_NAME.to_string())
                    .spawn(move || {
                        // Resolves once the backend, and with it the sender, is dropped.
                        let _ = runtime.block_on(rx);
                    })
                    .map_err(|e| BuildError::FailedToCreateRuntime(e.to_string()))?;

                (handle, Some(tx))
            }
        };

        info!(
            company = %settings.company,
            namespace = %settings.namespace,
            protocol = %settings.scheme,
            port = settings.port,
            "init logicmonitor statsd backend"
        );

        let url = report_url(
            settings.scheme.as_str(),
            &settings.host,
            settings.port,
            &settings.namespace,
            &settings.company,
            &settings.access_token,
            &settings.access_id,
        );

        Ok(LogicMonitorBackend::from(Inner {
            settings,
            url,
            client,
            runtime: handle,
            _shutdown: shutdown,
        }))
    }

    pub(crate) fn build_settings(&self) -> Result<Settings, BuildError> {
        let company = required(&self.company, "company")?;
        let access_id = required(&self.access_id, "statsdAccessId")?;
        let access_token = required(&self.access_token, "statsdToken")?;

        let namespace = match &self.namespace {
            Some(namespace) => sanitize_namespace(namespace),
            None => sanitize_namespace(&default_namespace()),
        };
        let host = self
            .endpoint_host
            .clone()
            .unwrap_or_else(|| company_host(&company));

        Ok(Settings {
            company,
            access_id,
            access_token,
            namespace,
            scheme: self.scheme,
            port: self.port.unwrap_or_else(|| self.scheme.default_port()),
            host,
            timeout: self.timeout,
            log_payloads: self.log_payloads,
        })
    }
}

impl Default for LogicMonitorBuilder {
    fn default() -> Self {
        LogicMonitorBuilder::new()
    }
}

fn required(value: &Option<String>, name: &'static str) -> Result<String, BuildError> {
    match value.as_deref() {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(BuildError::MissingField(name)),
    }
}

fn default_namespace() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!("failed to read hostname, using `localhost` as namespace: {}", e);
            "localhost".to_string()
        }
    }
}
