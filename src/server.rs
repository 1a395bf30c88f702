//! HTTP surface: a thin router over the sampling core.
//!
//! The router is deliberately simple: handlers are registered on a path-slug
//! and tried in registration order until one claims the request (returns
//! `Some`). That lets several handlers share a slug, with earlier ones able
//! to decline. Requests are served by hyper over TCP or a Unix socket,
//! selected via `PROFILE_RECORDER_SERVER_URL` /
//! `PROFILE_RECORDER_SERVER_URL_PATTERN` (with `{PID}` and `{UUID}`
//! substitution).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::interval::parse_interval;
use crate::render::OutputFormat;
use crate::session::{SessionConfig, run_session};
use crate::symbolize::BackendChoice;

/// A request, pre-digested for handlers.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    /// Path split on `/`, empty segments removed; `/` is an empty slug.
    pub segments: Vec<String>,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: &str, path: &str, query: &str, body: Vec<u8>) -> Self {
        let segments = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let query = query
            .split('&')
            .filter_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                Some((k.to_string(), v.to_string()))
            })
            .collect();
        Self {
            method: method.to_string(),
            path: path.to_string(),
            segments,
            query,
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into().into_bytes(),
        }
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Self::text(200, body)
    }

    pub fn bytes(content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type,
            body,
        }
    }
}

/// A handler either claims the request (`Some(response)`) or declines
/// (`None`), passing it to the next handler registered on the slug.
pub trait RouteHandler: Send + Sync {
    fn handle(&self, request: &HttpRequest) -> Option<HttpResponse>;
}

impl<F> RouteHandler for F
where
    F: Fn(&HttpRequest) -> Option<HttpResponse> + Send + Sync,
{
    fn handle(&self, request: &HttpRequest) -> Option<HttpResponse> {
        self(request)
    }
}

/// Routes requests to handlers in registration order.
#[derive(Default)]
pub struct Router {
    routes: Vec<(Vec<String>, Arc<dyn RouteHandler>)>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` on a path slug (`["debug", "pprof", "profile"]`
    /// matches `/debug/pprof/profile`; the empty slug matches `/`).
    pub fn register(&mut self, slug: &[&str], handler: Arc<dyn RouteHandler>) {
        self.routes
            .push((slug.iter().map(|s| s.to_string()).collect(), handler));
    }

    pub fn dispatch(&self, request: &HttpRequest) -> HttpResponse {
        for (slug, handler) in &self.routes {
            if slug == &request.segments
                && let Some(response) = handler.handle(request)
            {
                return response;
            }
        }
        HttpResponse::text(
            404,
            format!(
                "no handler for {} {}\n\n\
                 try:\n  curl -X POST http://<addr>/sample \
                 -d '{{\"numberOfSamples\": 100, \"timeInterval\": \"10ms\"}}'\n  \
                 curl 'http://<addr>/debug/pprof/profile?seconds=30&rate=100'\n",
                request.method, request.path,
            ),
        )
    }
}

#[derive(serde::Deserialize)]
struct SampleRequest {
    #[serde(rename = "numberOfSamples")]
    number_of_samples: u32,
    #[serde(rename = "timeInterval")]
    time_interval: String,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    symbolizer: Option<String>,
}

fn handle_sample(request: &HttpRequest) -> Option<HttpResponse> {
    if request.method != "POST" {
        return None;
    }
    let parsed: SampleRequest = match serde_json::from_slice(&request.body) {
        Ok(parsed) => parsed,
        Err(e) => return Some(HttpResponse::text(400, format!("bad request body: {e}\n"))),
    };
    let interval = match parse_interval(&parsed.time_interval, "ms") {
        Ok(interval) => interval,
        Err(e) => return Some(HttpResponse::text(400, format!("{e}\n"))),
    };
    let format = match parsed.format.as_deref() {
        None => OutputFormat::default(),
        Some(name) => match OutputFormat::from_name(name) {
            Some(format) => format,
            None => return Some(HttpResponse::text(400, format!("unknown format {name:?}\n"))),
        },
    };
    let backend = match parsed.symbolizer.as_deref() {
        None => BackendChoice::Native,
        Some(name) => match BackendChoice::from_name(name) {
            Some(backend) => backend,
            None => {
                return Some(HttpResponse::text(400, format!("unknown symbolizer {name:?}\n")));
            }
        },
    };
    let config = SessionConfig {
        sample_count: parsed.number_of_samples,
        interval,
        format,
        backend,
        ..SessionConfig::default()
    };
    Some(run_profile(&config))
}

fn handle_pprof_profile(request: &HttpRequest) -> Option<HttpResponse> {
    if request.method != "GET" {
        return None;
    }
    let seconds = query_clamped(request, "seconds", 30);
    let rate = query_clamped(request, "rate", 100);
    let config = SessionConfig {
        sample_count: seconds * rate,
        interval: Duration::from_nanos(1_000_000_000 / rate as u64),
        format: OutputFormat::Pprof,
        backend: BackendChoice::Native,
        ..SessionConfig::default()
    };
    Some(run_profile(&config))
}

fn query_clamped(request: &HttpRequest, key: &str, default: u32) -> u32 {
    request
        .query
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
        .clamp(1, 1000)
}

fn run_profile(config: &SessionConfig) -> HttpResponse {
    let mut out = Vec::new();
    match run_session(config, &mut out, &CancellationToken::new()) {
        Ok(report) => {
            tracing::info!(
                samples = report.samples_recorded,
                falling_behind = report.falling_behind,
                "served profile request"
            );
            HttpResponse::bytes(config.format.content_type(), out)
        }
        Err(e) => HttpResponse::text(500, format!("profiling failed: {e}\n")),
    }
}

/// The profiler's route table.
pub fn profiler_router() -> Router {
    let mut router = Router::new();
    let sample: Arc<dyn RouteHandler> = Arc::new(handle_sample);
    router.register(&[], sample.clone());
    router.register(&["sample"], sample.clone());
    router.register(&["samples"], sample);
    router.register(&["debug", "pprof", "profile"], Arc::new(handle_pprof_profile));
    router.register(
        &["health"],
        Arc::new(|request: &HttpRequest| {
            (request.method == "GET").then(|| HttpResponse::ok("OK"))
        }),
    );
    router
}

/// Where to listen, decoded from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(String),
    Unix(PathBuf),
}

const URL_ENV: &str = "PROFILE_RECORDER_SERVER_URL";
const URL_PATTERN_ENV: &str = "PROFILE_RECORDER_SERVER_URL_PATTERN";
const DEFAULT_URL: &str = "http://127.0.0.1:6061";

/// Resolve the listening URL: `PROFILE_RECORDER_SERVER_URL` wins, then the
/// `_PATTERN` variant with `{PID}`/`{UUID}` substituted, then the default.
pub fn resolve_listen_addr() -> Result<ListenAddr> {
    if let Ok(url) = std::env::var(URL_ENV) {
        return parse_server_url(&url);
    }
    if let Ok(pattern) = std::env::var(URL_PATTERN_ENV) {
        let url = pattern
            .replace("{PID}", &std::process::id().to_string())
            .replace("{UUID}", &uuid::Uuid::new_v4().to_string());
        return parse_server_url(&url);
    }
    parse_server_url(DEFAULT_URL)
}

/// Accepts `http://host:port`, `unix:///path`, `http+unix:///path`.
pub fn parse_server_url(url: &str) -> Result<ListenAddr> {
    if let Some(rest) = url.strip_prefix("http+unix://") {
        return unix_addr(url, rest);
    }
    if let Some(rest) = url.strip_prefix("unix://") {
        return unix_addr(url, rest);
    }
    if let Some(rest) = url.strip_prefix("http://") {
        let addr = rest.trim_end_matches('/');
        if addr.is_empty() {
            return Err(Error::InvalidServerUrl(url.to_string()));
        }
        return Ok(ListenAddr::Tcp(addr.to_string()));
    }
    Err(Error::InvalidServerUrl(url.to_string()))
}

fn unix_addr(url: &str, path: &str) -> Result<ListenAddr> {
    if path.is_empty() {
        return Err(Error::InvalidServerUrl(url.to_string()));
    }
    Ok(ListenAddr::Unix(PathBuf::from(path)))
}

/// Serve `router` until `cancel` fires.
pub async fn serve(router: Arc<Router>, addr: ListenAddr, cancel: CancellationToken) -> Result<()> {
    match addr {
        ListenAddr::Tcp(addr) => {
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .map_err(Error::Sink)?;
            tracing::info!(%addr, "profiler listening");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _peer)) => spawn_connection(stream, router.clone()),
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    },
                }
            }
        }
        ListenAddr::Unix(path) => {
            // A stale socket file from a previous run would make bind fail.
            let _ = std::fs::remove_file(&path);
            let listener = tokio::net::UnixListener::bind(&path).map_err(Error::Sink)?;
            tracing::info!(path = %path.display(), "profiler listening on unix socket");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _peer)) => spawn_connection(stream, router.clone()),
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    },
                }
            }
        }
    }
    Ok(())
}

fn spawn_connection<S>(stream: S, router: Arc<Router>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let service = service_fn(move |req| handle_hyper_request(router.clone(), req));
        let builder = ConnBuilder::new(TokioExecutor::new());
        let conn = builder.serve_connection(TokioIo::new(stream), service);
        if let Err(e) = conn.await {
            tracing::trace!(error = %e, "connection error");
        }
    });
}

async fn handle_hyper_request(
    router: Arc<Router>,
    request: hyper::Request<hyper::body::Incoming>,
) -> std::result::Result<hyper::Response<Full<Bytes>>, std::convert::Infallible> {
    let (parts, body) = request.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes().to_vec(),
        Err(_) => Vec::new(),
    };
    let parsed = HttpRequest::new(
        parts.method.as_str(),
        parts.uri.path(),
        parts.uri.query().unwrap_or(""),
        body,
    );

    // The sampling core is synchronous; keep it off the reactor.
    let response = tokio::task::spawn_blocking(move || router.dispatch(&parsed))
        .await
        .unwrap_or_else(|_| HttpResponse::text(500, "handler panicked\n".to_string()));

    let mut builder = hyper::Response::builder().status(response.status);
    builder = builder.header("content-type", response.content_type);
    Ok(builder
        .body(Full::new(Bytes::from(response.body)))
        .expect("static response parts are valid"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(path: &str) -> HttpRequest {
        HttpRequest::new("GET", path, "", Vec::new())
    }

    fn post(path: &str, body: &str) -> HttpRequest {
        HttpRequest::new("POST", path, "", body.as_bytes().to_vec())
    }

    #[test]
    fn registered_slug_is_served() {
        let mut router = Router::new();
        router.register(
            &["hello"],
            Arc::new(|_req: &HttpRequest| Some(HttpResponse::ok("world"))),
        );
        let response = router.dispatch(&get("/hello"));
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"world");
    }

    #[test]
    fn handlers_are_tried_in_registration_order() {
        let mut router = Router::new();
        // First handler declines; the second claims the request.
        router.register(
            &["clash", "on", "this", "slug"],
            Arc::new(|_req: &HttpRequest| -> Option<HttpResponse> { None }),
        );
        router.register(
            &["clash", "on", "this", "slug"],
            Arc::new(|_req: &HttpRequest| Some(HttpResponse::ok("hi"))),
        );
        let response = router.dispatch(&get("/clash/on/this/slug"));
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hi");
    }

    #[test]
    fn unmatched_path_is_404_with_curl_example() {
        let response = profiler_router().dispatch(&get("/definitely/not/here"));
        assert_eq!(response.status, 404);
        let body = String::from_utf8(response.body).unwrap();
        assert!(body.contains("curl"));
    }

    #[test]
    fn health_answers_ok() {
        let response = profiler_router().dispatch(&get("/health"));
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"OK");
    }

    #[test]
    fn health_ignores_post() {
        let response = profiler_router().dispatch(&post("/health", ""));
        assert_eq!(response.status, 404);
    }

    #[test]
    fn sample_rejects_bad_body() {
        let response = profiler_router().dispatch(&post("/sample", "{not json"));
        assert_eq!(response.status, 400);
    }

    #[test]
    fn sample_rejects_bad_interval() {
        let body = r#"{"numberOfSamples": 1, "timeInterval": "10 parsecs"}"#;
        let response = profiler_router().dispatch(&post("/sample", body));
        assert_eq!(response.status, 400);
    }

    #[test]
    fn sample_rejects_unknown_symbolizer() {
        let body = r#"{"numberOfSamples": 1, "timeInterval": "1ms", "symbolizer": "oracle"}"#;
        let response = profiler_router().dispatch(&post("/sample", body));
        assert_eq!(response.status, 400);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn sample_round_trips_with_fake_symbolizer() {
        let body =
            r#"{"numberOfSamples": 2, "timeInterval": "1ms", "format": "collapsed", "symbolizer": "fake"}"#;
        let response = profiler_router().dispatch(&post("/sample", body));
        assert_eq!(response.status, 200);
        assert!(!response.body.is_empty());
    }

    #[test]
    fn query_params_are_clamped() {
        let req = HttpRequest::new("GET", "/debug/pprof/profile", "seconds=5000&rate=0", Vec::new());
        assert_eq!(query_clamped(&req, "seconds", 30), 1000);
        assert_eq!(query_clamped(&req, "rate", 100), 1);
        assert_eq!(query_clamped(&req, "missing", 30), 30);
    }

    #[test]
    fn url_parsing() {
        assert_eq!(
            parse_server_url("http://127.0.0.1:6061").unwrap(),
            ListenAddr::Tcp("127.0.0.1:6061".to_string())
        );
        assert_eq!(
            parse_server_url("unix:///tmp/prof.sock").unwrap(),
            ListenAddr::Unix(PathBuf::from("/tmp/prof.sock"))
        );
        assert_eq!(
            parse_server_url("http+unix:///tmp/prof.sock").unwrap(),
            ListenAddr::Unix(PathBuf::from("/tmp/prof.sock"))
        );
        assert!(parse_server_url("ftp://nope").is_err());
        assert!(parse_server_url("http://").is_err());
        assert!(parse_server_url("unix://").is_err());
    }

    #[test]
    fn root_slug_matches_bare_slash() {
        let req = post("/", r#"{"numberOfSamples": 1, "timeInterval": "bogus"}"#);
        // The body reaches the sample handler (400 from interval parsing,
        // not 404 from routing).
        let response = profiler_router().dispatch(&req);
        assert_eq!(response.status, 400);
    }
}
