//! HTTP/1 probe client.
//!
//! One connection per request: connect, handshake, send, read the whole
//! body, all bounded by a single per-request timeout.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{AUTHORIZATION, HOST, SERVER, USER_AGENT};
use http::{Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use tracing::debug;

use gangway_core::{ProbeError, Prober};

/// Bound on a single probe request when none is configured.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Probes unit endpoints over plain HTTP.
#[derive(Debug, Clone)]
pub struct HttpProber {
    timeout: Duration,
    smoke_token: Option<String>,
    user_agent: String,
}

struct Fetched {
    status: StatusCode,
    server: Option<String>,
    body: String,
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            smoke_token: None,
            user_agent: format!("gangway/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Send `Authorization: Bearer <token>` with every smoke test request.
    pub fn with_smoke_token(mut self, token: impl Into<String>) -> Self {
        self.smoke_token = Some(token.into());
        self
    }

    async fn get(&self, endpoint: &str, bearer: Option<&str>) -> Result<Fetched, ProbeError> {
        let invalid = || ProbeError::InvalidEndpoint(endpoint.to_string());

        let uri: Uri = endpoint.parse().map_err(|_| invalid())?;
        if uri.scheme_str() != Some("http") {
            return Err(invalid());
        }
        let authority = uri.authority().ok_or_else(invalid)?.clone();
        let address = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(HOST, authority.as_str())
            .header(USER_AGENT, self.user_agent.as_str());
        if let Some(token) = bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = builder.body(Empty::<Bytes>::new()).map_err(|_| invalid())?;

        let exchange = async {
            let stream = tokio::net::TcpStream::connect(&address).await.map_err(|e| {
                debug!(error = %e, %endpoint, "probe connection failed");
                ProbeError::Transport(endpoint.to_string())
            })?;

            let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
                .await
                .map_err(|e| {
                    debug!(error = %e, %endpoint, "probe handshake failed");
                    ProbeError::Transport(endpoint.to_string())
                })?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let response = sender.send_request(request).await.map_err(|e| {
                debug!(error = %e, %endpoint, "probe request failed");
                ProbeError::Transport(endpoint.to_string())
            })?;

            let status = response.status();
            let server = response
                .headers()
                .get(SERVER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|_| ProbeError::Body(endpoint.to_string()))?
                .to_bytes();

            Ok::<_, ProbeError>(Fetched {
                status,
                server,
                body: String::from_utf8_lossy(&body).into_owned(),
            })
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ProbeError::Timeout(endpoint.to_string()))?
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn fetch_deployed_version(&self, endpoint: &str) -> Result<String, ProbeError> {
        let fetched = self.get(endpoint, None).await?;
        if !fetched.status.is_success() {
            return Err(ProbeError::Status {
                endpoint: endpoint.to_string(),
                status: fetched.status.as_u16(),
                body: fetched.body,
            });
        }
        Ok(version_token(fetched.server.as_deref(), &fetched.body))
    }

    async fn smoke_test(&self, endpoint: &str) -> Result<(), ProbeError> {
        let fetched = self.get(endpoint, self.smoke_token.as_deref()).await?;
        if !fetched.status.is_success() {
            return Err(ProbeError::Status {
                endpoint: endpoint.to_string(),
                status: fetched.status.as_u16(),
                body: fetched.body,
            });
        }
        Ok(())
    }
}

/// Pick the version token out of a probe response.
///
/// A `Server` header of the form `<name>-<version>` wins; the text after
/// its last `-` is the token. Otherwise the trimmed body is.
pub fn version_token(server: Option<&str>, body: &str) -> String {
    if let Some((_, token)) = server.and_then(|s| s.rsplit_once('-')) {
        return token.trim().to_string();
    }
    body.trim().to_string()
}
