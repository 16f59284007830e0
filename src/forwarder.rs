use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use metrics::{counter, histogram};
use quanta::Instant;
use reqwest::header::{CONNECTION, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::common::{ForwardError, Scheme};
use crate::events::FlushListener;
use crate::formatting::compose_payload;
use crate::snapshot::MetricsSnapshot;

const JSON_CONTENT_TYPE: &str = r#"text/json;charset="utf-8""#;
const VERSION_HEADER: &str = "X-LogicMonitor-Backend-Version";
const VERSION: &str = "LogicMonitor Backend/1.0";

/// Resolved, immutable configuration.
pub(crate) struct Settings {
    pub company: String,
    pub access_id: String,
    pub access_token: String,
    pub namespace: String,
    pub scheme: Scheme,
    pub port: u16,
    pub host: String,
    pub timeout: Duration,
    pub log_payloads: bool,
}

pub(crate) struct Inner {
    pub settings: Settings,
    pub url: String,
    pub client: reqwest::Client,
    pub runtime: Handle,
    // Keeps the fallback runtime thread alive; dropping it lets the thread exit.
    pub _shutdown: Option<oneshot::Sender<()>>,
}

impl Inner {
    async fn deliver(&self, body: String) -> Result<(), ForwardError> {
        let start = Instant::now();
        let timeout = self.settings.timeout;

        // Dropping the request future on expiry aborts it, so there is exactly one
        // terminal outcome per request.
        let result = match tokio::time::timeout(timeout, self.send(body)).await {
            Ok(result) => result,
            Err(_) => Err(ForwardError::Timeout(timeout)),
        };

        let elapsed = Instant::now().duration_since(start);
        histogram!("logicmonitor.request.duration").record(elapsed.as_secs_f64());
        match &result {
            Ok(()) => {
                counter!("logicmonitor.deliveries", "outcome" => "success").increment(1);
            }
            Err(e) => {
                counter!("logicmonitor.deliveries", "outcome" => e.as_label()).increment(1);
                match e {
                    ForwardError::Timeout(_) => warn!("aborted logicmonitor request: {}", e),
                    ForwardError::Remote(status) => {
                        warn!(status = status.as_u16(), "logicmonitor rejected report: {}", e)
                    }
                    _ => warn!("failed to deliver logicmonitor report: {}", e),
                }
            }
        }

        result
    }

    async fn send(&self, body: String) -> Result<(), ForwardError> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header(CONNECTION, "keep-alive")
            .header(VERSION_HEADER, VERSION)
            .body(body)
            .send()
            .await
            // The URL carries the credentials.
            .map_err(|e| ForwardError::Transport(e.without_url()))?;

        let status = response.status();
        match response.text().await {
            Ok(text) if self.settings.log_payloads && !text.is_empty() => {
                info!(status = status.as_u16(), "receive response {}", text);
            }
            Ok(_) => {}
            Err(e) => debug!("failed to read response body: {}", e.without_url()),
        }

        if status != StatusCode::OK {
            return Err(ForwardError::Remote(status));
        }
        Ok(())
    }
}

/// Forwards flush snapshots to LogicMonitor.
///
/// Cheap to clone; clones share the same client and configuration.
#[derive(Clone)]
pub struct LogicMonitorBackend {
    inner: Arc<Inner>,
}

impl From<Inner> for LogicMonitorBackend {
    fn from(inner: Inner) -> Self {
        LogicMonitorBackend {
            inner: Arc::new(inner),
        }
    }
}

impl LogicMonitorBackend {
    pub fn company(&self) -> &str {
        &self.inner.settings.company
    }

    /// The sanitized namespace payloads are reported under.
    pub fn namespace(&self) -> &str {
        &self.inner.settings.namespace
    }

    pub fn scheme(&self) -> Scheme {
        self.inner.settings.scheme
    }

    pub fn port(&self) -> u16 {
        self.inner.settings.port
    }

    pub fn timeout(&self) -> Duration {
        self.inner.settings.timeout
    }

    /// Composes the payload for one flush and spawns its delivery.
    ///
    /// Returns as soon as the request task is spawned. The returned [`Delivery`] may be
    /// awaited for the outcome or dropped; dropping it does not cancel the request.
    ///
    /// ## Errors
    ///
    /// If the payload cannot be serialized, an error variant will be returned and nothing is sent.
    pub fn flush(
        &self,
        timestamp: u64,
        metrics: &MetricsSnapshot,
    ) -> Result<Delivery, ForwardError> {
        counter!("logicmonitor.flushes").increment(1);

        let settings = &self.inner.settings;
        let body = serde_json::to_string(&compose_payload(&settings.namespace, timestamp, metrics))?;
        if settings.log_payloads {
            info!("flush called {} metrics \n{}", timestamp, body);
        } else {
            debug!(timestamp, bytes = body.len(), "flush called");
        }

        let inner = Arc::clone(&self.inner);
        let task = self.inner.runtime.spawn(async move { inner.deliver(body).await });
        Ok(Delivery { task })
    }
}

impl FlushListener for LogicMonitorBackend {
    fn on_flush(&self, timestamp: u64, metrics: &MetricsSnapshot) {
        if let Err(e) = self.flush(timestamp, metrics) {
            counter!("logicmonitor.deliveries", "outcome" => e.as_label()).increment(1);
            error!("failed to forward flush {} to logicmonitor: {}", timestamp, e);
        }
    }
}

/// An in-flight delivery.
///
/// Resolves once the request reached a terminal state; the outcome has already been
/// logged by then.
#[must_use = "a delivery runs whether or not it is awaited"]
pub struct Delivery {
    task: JoinHandle<Result<(), ForwardError>>,
}

impl Future for Delivery {
    type Output = Result<(), ForwardError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) => Err(ForwardError::Task(e)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::LogicMonitorBuilder;
    use crate::events::{FlushEmitter, FlushSubscriber};
    use serde_json::{json, Value};
    use std::fmt;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tracing::field::{Field, Visit};
    use tracing::subscriber::DefaultGuard;
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
    use tracing_subscriber::Layer;

    type Logged = Arc<Mutex<Vec<(Level, String)>>>;

    /// Keeps this crate's log events, level and rendered message.
    struct CaptureLayer(Logged);

    struct MessageVisitor(String);

    impl Visit for MessageVisitor {
        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{value:?}");
            }
        }
    }

    impl<S: Subscriber> Layer<S> for CaptureLayer {
        fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
            if !event.metadata().target().starts_with(env!("CARGO_CRATE_NAME")) {
                return;
            }
            let mut visitor = MessageVisitor(String::new());
            event.record(&mut visitor);
            self.0.lock().unwrap().push((*event.metadata().level(), visitor.0));
        }
    }

    // Tests run on a current-thread runtime, so spawned deliveries log on this thread.
    fn capture_logs() -> (Logged, DefaultGuard) {
        let logged = Logged::default();
        let subscriber = tracing_subscriber::registry().with(CaptureLayer(logged.clone()));
        (logged, tracing::subscriber::set_default(subscriber))
    }

    fn warnings(logged: &Logged) -> Vec<String> {
        logged
            .lock()
            .unwrap()
            .iter()
            .filter(|(level, _)| *level == Level::WARN)
            .map(|(_, message)| message.clone())
            .collect()
    }

    struct Captured {
        head: String,
        body: String,
    }

    impl Captured {
        fn request_line(&self) -> &str {
            self.head.lines().next().unwrap_or_default()
        }

        fn header(&self, name: &str) -> Option<&str> {
            self.head.lines().skip(1).find_map(|line| {
                let (key, value) = line.split_once(':')?;
                key.eq_ignore_ascii_case(name).then(|| value.trim())
            })
        }

        fn json(&self) -> Value {
            serde_json::from_str(&self.body).unwrap()
        }
    }

    async fn read_request(stream: &mut TcpStream) -> Captured {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_end = loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before headers");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
        let length = head
            .lines()
            .find_map(|line| {
                let (key, value) = line.split_once(':')?;
                key.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().unwrap())
            })
            .unwrap_or(0);
        while buf.len() < head_end + length {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before body");
            buf.extend_from_slice(&chunk[..n]);
        }

        let body = String::from_utf8_lossy(&buf[head_end..head_end + length]).into_owned();
        Captured { head, body }
    }

    /// Serves every connection with `status` after `delay`, reporting each request.
    async fn serve(status: u16, delay: Duration) -> (u16, mpsc::UnboundedReceiver<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let captured = read_request(&mut stream).await;
                    let _ = tx.send(captured);
                    tokio::time::sleep(delay).await;
                    let body = "{\"success\":true}";
                    let response = format!(
                        "HTTP/1.1 {status} Status\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });

        (port, rx)
    }

    fn backend(port: u16) -> LogicMonitorBuilder {
        LogicMonitorBuilder::new()
            .set_company("acme")
            .set_access_id("id1")
            .set_access_token("tok1")
            .set_namespace("web01")
            .set_scheme(Scheme::Http)
            .set_endpoint_host("127.0.0.1")
            .set_port(port)
    }

    fn cpu_snapshot() -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::new(10_000, 90.0);
        snapshot.gauges.insert("cpu".to_string(), 0.5);
        snapshot
    }

    #[tokio::test]
    async fn test_delivers_payload() {
        let (port, mut requests) = serve(200, Duration::ZERO).await;
        let backend = backend(port).build().unwrap();

        backend.flush(1000, &cpu_snapshot()).unwrap().await.unwrap();

        let request = requests.recv().await.unwrap();
        assert_eq!(
            request.request_line(),
            "POST /statsd/api/reportData?namespace=web01&company=acme&statsdToken=tok1&statsdAccessId=id1 HTTP/1.1"
        );
        assert_eq!(request.header("content-type"), Some(r#"text/json;charset="utf-8""#));
        assert_eq!(request.header("connection"), Some("keep-alive"));
        assert_eq!(
            request.header("x-logicmonitor-backend-version"),
            Some("LogicMonitor Backend/1.0")
        );
        assert_eq!(
            request.header("content-length"),
            Some(request.body.len().to_string().as_str())
        );

        let body = request.json();
        assert_eq!(body["namespace"], json!("web01"));
        assert_eq!(body["version"], json!(1));
        assert_eq!(body["data"]["gauges"], json!({"cpu": 0.5}));
        assert_eq!(body["data"]["timestamp"], json!(1_000_000));
        assert_eq!(body["data"]["flushInterval"], json!(10));
    }

    #[tokio::test]
    async fn test_non_200_is_remote_error() {
        let (port, mut requests) = serve(500, Duration::ZERO).await;
        let backend = backend(port).build().unwrap();

        let err = backend.flush(1, &cpu_snapshot()).unwrap().await.unwrap_err();
        assert!(matches!(err, ForwardError::Remote(StatusCode::INTERNAL_SERVER_ERROR)));
        assert!(err.to_string().contains("500"));
        assert!(requests.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_other_2xx_is_remote_error() {
        let (port, _requests) = serve(202, Duration::ZERO).await;
        let backend = backend(port).build().unwrap();

        let err = backend.flush(1, &cpu_snapshot()).unwrap().await.unwrap_err();
        assert!(matches!(err, ForwardError::Remote(StatusCode::ACCEPTED)));
    }

    #[tokio::test]
    async fn test_timeout_aborts_request() {
        let (port, mut requests) = serve(200, Duration::from_secs(30)).await;
        let backend = backend(port)
            .set_timeout(Duration::from_millis(200))
            .build()
            .unwrap();

        let err = backend.flush(1, &cpu_snapshot()).unwrap().await.unwrap_err();
        assert!(matches!(err, ForwardError::Timeout(t) if t == Duration::from_millis(200)));
        assert!(requests.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (logged, _guard) = capture_logs();
        let backend = backend(port)
            .set_access_token("SECRETTOKEN")
            .set_access_id("SECRETID")
            .build()
            .unwrap();
        let err = backend.flush(1, &cpu_snapshot()).unwrap().await.unwrap_err();
        assert!(matches!(err, ForwardError::Transport(_)));

        let message = err.to_string();
        assert!(!message.contains("SECRETTOKEN"), "{message}");
        assert!(!message.contains("SECRETID"), "{message}");

        let warnings = warnings(&logged);
        assert_eq!(warnings.len(), 1, "{warnings:?}");
        for (_, line) in logged.lock().unwrap().iter() {
            assert!(!line.contains("SECRETTOKEN"), "{line}");
            assert!(!line.contains("SECRETID"), "{line}");
        }
    }

    #[tokio::test]
    async fn test_non_200_logs_one_warning_with_status() {
        let (port, _requests) = serve(500, Duration::ZERO).await;
        let (logged, _guard) = capture_logs();
        let backend = backend(port).build().unwrap();

        let _ = backend.flush(1, &cpu_snapshot()).unwrap().await;

        let warnings = warnings(&logged);
        assert_eq!(warnings.len(), 1, "{warnings:?}");
        assert!(warnings[0].contains("500"), "{}", warnings[0]);
    }

    #[tokio::test]
    async fn test_timeout_logs_once_per_request() {
        let (port, _requests) = serve(200, Duration::from_secs(30)).await;
        let (logged, _guard) = capture_logs();
        let backend = backend(port)
            .set_timeout(Duration::from_millis(200))
            .build()
            .unwrap();

        let first = backend.flush(1, &cpu_snapshot()).unwrap();
        let second = backend.flush(2, &cpu_snapshot()).unwrap();
        let (first, second) = tokio::join!(first, second);
        assert!(matches!(first, Err(ForwardError::Timeout(_))));
        assert!(matches!(second, Err(ForwardError::Timeout(_))));

        let warnings = warnings(&logged);
        assert_eq!(warnings.len(), 2, "{warnings:?}");
        assert!(warnings.iter().all(|line| line.contains("timed out")), "{warnings:?}");
    }

    #[tokio::test]
    async fn test_success_logs_no_warning() {
        let (port, _requests) = serve(200, Duration::ZERO).await;
        let (logged, _guard) = capture_logs();
        let backend = backend(port).log_payloads(false).build().unwrap();

        backend.flush(1, &cpu_snapshot()).unwrap().await.unwrap();

        assert!(warnings(&logged).is_empty());
        assert!(logged.lock().unwrap().iter().all(|(_, line)| !line.contains("tok1")));
    }

    #[tokio::test]
    async fn test_overlapping_flushes_are_independent() {
        let (port, mut requests) = serve(200, Duration::from_millis(100)).await;
        let backend = backend(port).build().unwrap();

        let first = backend.flush(1, &cpu_snapshot()).unwrap();
        let second = backend.flush(2, &cpu_snapshot()).unwrap();
        let (first, second) = tokio::join!(first, second);
        assert!(first.is_ok());
        assert!(second.is_ok());

        let mut timestamps = vec![
            requests.recv().await.unwrap().json()["data"]["timestamp"].as_u64().unwrap(),
            requests.recv().await.unwrap().json()["data"]["timestamp"].as_u64().unwrap(),
        ];
        timestamps.sort_unstable();
        assert_eq!(timestamps, vec![1000, 2000]);
    }

    #[tokio::test]
    async fn test_listener_never_surfaces_failures() {
        let (port, mut requests) = serve(500, Duration::ZERO).await;
        let backend = backend(port).build().unwrap();

        let mut emitter = FlushEmitter::new();
        emitter.subscribe(Arc::new(backend));
        emitter.emit(1000, &cpu_snapshot());

        let request = requests.recv().await.unwrap();
        assert_eq!(request.json()["data"]["timestamp"], json!(1_000_000));
    }

    #[tokio::test]
    async fn test_accessors() {
        let backend = backend(8080).set_timeout(Duration::from_secs(3)).build().unwrap();
        assert_eq!(backend.company(), "acme");
        assert_eq!(backend.namespace(), "web01");
        assert_eq!(backend.scheme(), Scheme::Http);
        assert_eq!(backend.port(), 8080);
        assert_eq!(backend.timeout(), Duration::from_secs(3));
    }
}
