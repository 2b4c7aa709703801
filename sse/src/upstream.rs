//! Upstream connector: opens the provider's long-lived SSE response.
//!
//! The connector does one thing per call: issue the GET, check the status and
//! hand back the body as a byte stream tied to the caller's cancellation
//! token. Retrying is the controller's job.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::*;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Header the transit provider reads its API key from.
pub const DEFAULT_API_KEY_HEADER: &str = "x-api-key";

/// Body of an open upstream session.
pub type ByteStream = BoxStream<'static, Result<Bytes, Error>>;

/// How the provider expects to be authenticated.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    None,
    /// Key sent in a request header.
    ApiKey { header: String, key: String },
    /// Key sent as a query parameter.
    Query { param: String, key: String },
}

impl Credentials {
    pub fn api_key(key: impl Into<String>) -> Self {
        Credentials::ApiKey {
            header: DEFAULT_API_KEY_HEADER.to_owned(),
            key: key.into(),
        }
    }
}

// Keys never reach the logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::None => write!(f, "None"),
            Credentials::ApiKey { header, .. } => write!(f, "ApiKey {{ header: {header:?} }}"),
            Credentials::Query { param, .. } => write!(f, "Query {{ param: {param:?} }}"),
        }
    }
}

/// The streaming endpoint and the credentials needed to read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub url: String,
    pub credentials: Credentials,
}

impl UpstreamTarget {
    pub fn new(url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            url: url.into(),
            credentials,
        }
    }
}

/// A source of upstream SSE sessions.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Opens one session. The returned stream must end promptly once `cancel`
    /// fires, and an in-flight open must return [`Error::Cancelled`].
    async fn open(
        &self,
        target: &UpstreamTarget,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, Error>;
}

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct HttpUpstreamConfig {
    /// Time allowed to establish the TCP/TLS connection.
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpUpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("transit-stream/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// reqwest-backed [`Upstream`].
///
/// No overall request timeout is set: a healthy session stays open for hours.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(config: &HttpUpstreamConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| Error::Connect(Box::new(e)))?;

        Ok(Self { client })
    }

    fn build_request(&self, target: &UpstreamTarget) -> Result<reqwest::Request, Error> {
        let mut builder = self
            .client
            .get(target.url.as_str())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");

        builder = match &target.credentials {
            Credentials::None => builder,
            Credentials::ApiKey { header, key } => builder.header(header.as_str(), key.as_str()),
            Credentials::Query { param, key } => builder.query(&[(param, key)]),
        };

        builder.build().map_err(|e| Error::Connect(Box::new(e)))
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn open(
        &self,
        target: &UpstreamTarget,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, Error> {
        let request = self.build_request(target)?;
        debug!("Opening upstream stream {}", target.url);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.client.execute(request) => {
                result.map_err(|e| Error::Connect(Box::new(e)))?
            }
        };

        let status = response.status();
        if status != StatusCode::OK {
            // Dropping the response closes the connection.
            return Err(Error::UpstreamStatus {
                code: status.as_u16(),
            });
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::Stream(Box::new(e))))
            .take_until(cancel.clone().cancelled_owned());

        Ok(body.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn read_body(mut stream: ByteStream) -> String {
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        String::from_utf8(body).unwrap()
    }

    fn upstream() -> HttpUpstream {
        HttpUpstream::new(&HttpUpstreamConfig::default()).unwrap()
    }

    #[test]
    fn credentials_debug_hides_key() {
        let rendered = format!("{:?}", Credentials::api_key("super-secret"));
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("x-api-key"));
    }

    #[tokio::test]
    async fn open_sends_accept_and_api_key_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/vehicles")
            .match_header("accept", "text/event-stream")
            .match_header("x-api-key", "secret")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body("event: reset\ndata: []\n\n")
            .create_async()
            .await;

        let target = UpstreamTarget::new(
            format!("{}/vehicles", server.url()),
            Credentials::api_key("secret"),
        );
        let stream = upstream()
            .open(&target, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(read_body(stream).await, "event: reset\ndata: []\n\n");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn open_sends_query_credentials() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/vehicles")
            .match_query(Matcher::UrlEncoded("api_key".into(), "secret".into()))
            .with_status(200)
            .with_body("")
            .create_async()
            .await;

        let target = UpstreamTarget::new(
            format!("{}/vehicles", server.url()),
            Credentials::Query {
                param: "api_key".to_owned(),
                key: "secret".to_owned(),
            },
        );
        let result = upstream().open(&target, &CancellationToken::new()).await;

        assert!(result.is_ok());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_200_status_is_reported_with_code() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/vehicles")
            .with_status(503)
            .create_async()
            .await;

        let target = UpstreamTarget::new(format!("{}/vehicles", server.url()), Credentials::None);
        let result = upstream().open(&target, &CancellationToken::new()).await;

        assert!(matches!(result, Err(Error::UpstreamStatus { code: 503 })));
    }

    #[tokio::test]
    async fn unreachable_host_is_a_connect_error() {
        let target = UpstreamTarget::new("http://127.0.0.1:1/vehicles", Credentials::None);
        let result = upstream().open(&target, &CancellationToken::new()).await;

        assert!(matches!(result, Err(Error::Connect(_))));
    }

    #[tokio::test]
    async fn malformed_url_is_a_connect_error() {
        let target = UpstreamTarget::new("not a url", Credentials::None);
        let result = upstream().open(&target, &CancellationToken::new()).await;

        assert!(matches!(result, Err(Error::Connect(_))));
    }

    #[tokio::test]
    async fn cancelled_token_aborts_open() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let target = UpstreamTarget::new("http://127.0.0.1:1/vehicles", Credentials::None);
        let result = upstream().open(&target, &cancel).await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn cancel_aborts_open_waiting_for_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accepts the connection and never answers.
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
            drop(socket);
        });

        let cancel = CancellationToken::new();
        let target = UpstreamTarget::new(format!("http://{addr}/vehicles"), Credentials::None);
        let opening = {
            let cancel = cancel.clone();
            tokio::spawn(async move { upstream().open(&target, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), opening)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        server.abort();
    }

    #[tokio::test]
    async fn cancel_ends_stalled_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Sends the response head, then goes quiet with the connection open.
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await.unwrap();
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n",
                )
                .await
                .unwrap();
            std::future::pending::<()>().await;
            drop(socket);
        });

        let cancel = CancellationToken::new();
        let target = UpstreamTarget::new(format!("http://{addr}/vehicles"), Credentials::None);
        let mut stream = upstream().open(&target, &cancel).await.unwrap();

        let reading = tokio::spawn(async move { stream.next().await.is_none() });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let ended = tokio::time::timeout(Duration::from_secs(1), reading)
            .await
            .unwrap()
            .unwrap();
        assert!(ended);
        server.abort();
    }
}
