//! Reverse-proxy relay to the single backend
//!
//! Rewrites the request onto the target URL the way a single-host reverse
//! proxy does (target path prefix joined with the request path, queries
//! concatenated) and sends it through a pooled client.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::http::uri::PathAndQuery;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that only describe a single connection and are not forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Error type for relay operations
#[derive(Debug)]
pub enum RelayError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building a request
    RequestBuild(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Client(e) => write!(f, "Client error: {}", e),
            RelayError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<hyper_util::client::legacy::Error> for RelayError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        RelayError::Client(err)
    }
}

pub struct Relay {
    client: Client<HttpConnector, BoxBody<Bytes, hyper::Error>>,
    target: Uri,
}

impl Relay {
    pub fn new(target: Uri, max_idle_per_host: usize, idle_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(max_idle_per_host)
            .pool_idle_timeout(idle_timeout)
            .build(connector);

        debug!(
            %target,
            max_idle = max_idle_per_host,
            idle_timeout_secs = idle_timeout.as_secs(),
            "Relay client initialized"
        );

        Self { client, target }
    }

    pub fn target(&self) -> &Uri {
        &self.target
    }

    /// Map an incoming request URI onto the target
    pub fn rewrite_uri(&self, incoming: &Uri) -> Result<Uri, RelayError> {
        let path = join_paths(self.target.path(), incoming.path());
        let query = merge_queries(self.target.query(), incoming.query());

        let path_and_query = match query {
            Some(q) => format!("{}?{}", path, q),
            None => path,
        };
        let path_and_query: PathAndQuery = path_and_query
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| RelayError::RequestBuild(e.to_string()))?;

        let mut parts = self.target.clone().into_parts();
        parts.path_and_query = Some(path_and_query);
        Uri::from_parts(parts).map_err(|e| RelayError::RequestBuild(e.to_string()))
    }

    /// Send a request to the backend
    pub async fn forward(
        &self,
        req: Request<BoxBody<Bytes, hyper::Error>>,
        client_addr: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, RelayError> {
        let uri = self.rewrite_uri(req.uri())?;

        let (mut parts, body) = req.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        // Overwrite rather than append: the gate is the first hop
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            parts.headers.insert(HeaderName::from_static(X_FORWARDED_FOR), value);
        }
        let host = parts
            .headers
            .get(hyper::header::HOST)
            .cloned()
            .or_else(|| parts.uri.authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()));
        if let Some(host) = host {
            parts.headers.insert(HeaderName::from_static(X_FORWARDED_HOST), host);
        }
        parts
            .headers
            .insert(HeaderName::from_static(X_FORWARDED_PROTO), HeaderValue::from_static("http"));

        debug!(method = %parts.method, %uri, "Relaying request");

        parts.uri = uri;
        let backend_req = Request::from_parts(parts, body);

        let response = self.client.request(backend_req).await?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Remove the fixed hop-by-hop set plus any header listed in `Connection`
fn strip_hop_by_hop(headers: &mut hyper::HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in &listed {
        headers.remove(name.as_str());
    }

    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Join two URL paths with exactly one slash between them
pub fn join_paths(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}

/// Combine the target's query with the request's, target first
pub fn merge_queries(target: Option<&str>, request: Option<&str>) -> Option<String> {
    match (target.filter(|q| !q.is_empty()), request.filter(|q| !q.is_empty())) {
        (Some(t), Some(r)) => Some(format!("{}&{}", t, r)),
        (Some(q), None) | (None, Some(q)) => Some(q.to_string()),
        (None, None) => None,
    }
}
