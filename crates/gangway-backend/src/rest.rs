//! REST client for a scheduler control plane.
//!
//! ```text
//! POST {base}/api/v1/clusters/{cluster}/units/{name}/revisions  → Deployed
//! PUT  {base}/api/v1/clusters/{cluster}/units/{name}/active     → 2xx
//! GET  {base}/api/v1/clusters/{cluster}/units/{name}/status     → UnitStatus
//! ```
//!
//! 404 maps to `NotFound`, 409 to `Conflict`, any other non-2xx to
//! `Rejected`. Connection trouble and timeouts are `Transport`; a body
//! that does not decode is `Malformed`.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use gangway_core::config::check_http_endpoint;
use gangway_core::{
    Backend, BackendError, ConfigError, ConfigResult, ContainerFilter, Deployed, Unit, UnitKind,
    UnitStatus, UpdateStrategy,
};

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    kind: UnitKind,
    version: &'a str,
    strategy: UpdateStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    containers: Option<&'a [String]>,
}

#[derive(Debug, Serialize)]
struct ActivateRequest<'a> {
    revision: &'a str,
}

/// Talks to a scheduler control plane over plain HTTP/1 with JSON bodies.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    /// `host:port` to connect to.
    address: String,
    /// Value of the `Host` header.
    authority: String,
    /// Path prefix from the configured endpoint, without a trailing slash.
    base_path: String,
    timeout: Duration,
    user_agent: String,
}

impl HttpBackend {
    /// Build a client for the control plane at `endpoint` (an `http://` URL).
    pub fn new(endpoint: &str, timeout: Duration) -> ConfigResult<Self> {
        let uri = check_http_endpoint(endpoint).map_err(|reason| ConfigError::InvalidEndpoint {
            unit: "backend".to_string(),
            field: "endpoint",
            value: endpoint.to_string(),
            reason,
        })?;
        let authority = uri
            .authority()
            .ok_or_else(|| ConfigError::InvalidEndpoint {
                unit: "backend".to_string(),
                field: "endpoint",
                value: endpoint.to_string(),
                reason: "missing host".to_string(),
            })?
            .clone();

        Ok(Self {
            address: format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80)),
            authority: authority.to_string(),
            base_path: uri.path().trim_end_matches('/').to_string(),
            timeout,
            user_agent: format!("gangway/{}", env!("CARGO_PKG_VERSION")),
        })
    }

    fn unit_path(&self, unit: &Unit, resource: &str) -> String {
        format!(
            "{}/api/v1/clusters/{}/units/{}/{resource}",
            self.base_path,
            encode_segment(&unit.cluster),
            encode_segment(&unit.name),
        )
    }

    /// Send one request and return the body of a 2xx response.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Bytes, BackendError> {
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(path)
            .header(HOST, self.authority.as_str())
            .header(USER_AGENT, self.user_agent.as_str())
            .header(ACCEPT, "application/json");
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| BackendError::Transport(format!("could not build request for {path}: {e}")))?;

        let exchange = async {
            let stream = tokio::net::TcpStream::connect(&self.address)
                .await
                .map_err(|e| BackendError::Transport(format!("connect to {}: {e}", self.address)))?;

            let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
                .await
                .map_err(|e| BackendError::Transport(format!("handshake with {}: {e}", self.address)))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let response = sender
                .send_request(request)
                .await
                .map_err(|e| BackendError::Transport(format!("{method} {path}: {e}")))?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| BackendError::Transport(format!("reading {method} {path} response: {e}")))?
                .to_bytes();
            Ok::<_, BackendError>((status, body))
        };

        let (status, body) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                BackendError::Transport(format!(
                    "{method} {path} timed out after {}ms",
                    self.timeout.as_millis()
                ))
            })??;

        debug!(%method, %path, status = status.as_u16(), "backend responded");
        if status.is_success() {
            return Ok(body);
        }

        let message = String::from_utf8_lossy(&body).trim().to_string();
        Err(match status {
            StatusCode::NOT_FOUND => BackendError::NotFound(if message.is_empty() {
                path.to_string()
            } else {
                message
            }),
            StatusCode::CONFLICT => BackendError::Conflict(message),
            _ => BackendError::Rejected {
                status: status.as_u16(),
                message,
            },
        })
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, BackendError> {
    serde_json::to_vec(value).map_err(|e| BackendError::Malformed(format!("encoding request: {e}")))
}

fn from_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, BackendError> {
    serde_json::from_slice(body).map_err(|e| BackendError::Malformed(e.to_string()))
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

#[async_trait]
impl Backend for HttpBackend {
    async fn update_unit(&self, unit: &Unit) -> Result<Deployed, BackendError> {
        let request = UpdateRequest {
            kind: unit.kind,
            version: &unit.target_version,
            strategy: unit.update_strategy,
            containers: match &unit.containers {
                ContainerFilter::All => None,
                ContainerFilter::Only(names) => Some(names.as_slice()),
            },
        };
        let body = self
            .call(Method::POST, &self.unit_path(unit, "revisions"), Some(to_json(&request)?))
            .await?;
        from_json(&body)
    }

    async fn revert_unit(&self, unit: &Unit) -> Result<(), BackendError> {
        let Some(revision) = unit.revision.as_deref() else {
            return Err(BackendError::Rejected {
                status: 0,
                message: format!("{} has no revision to activate", unit.name),
            });
        };
        let request = ActivateRequest { revision };
        self.call(Method::PUT, &self.unit_path(unit, "active"), Some(to_json(&request)?))
            .await?;
        Ok(())
    }

    async fn describe_unit_status(&self, unit: &Unit) -> Result<UnitStatus, BackendError> {
        let body = self.call(Method::GET, &self.unit_path(unit, "status"), None).await?;
        from_json(&body)
    }
}
