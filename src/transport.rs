//! The HTTP seam between the dispatcher and the backend.
//!
//! [`Transport`] performs exactly one `POST /chat` and hands back the status, content type and
//! a raw body stream.  It makes no policy decisions: timeouts, abort, and response-mode
//! detection belong to the dispatcher.

use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use futures::stream::StreamExt;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Response};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// A response body, delivered as it arrives on the wire.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Body of a chat request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// The user's question, verbatim.
    pub question: String,
}

impl ChatRequest {
    /// Creates a request for `question`.
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
        }
    }
}

/// Status line, relevant headers, and body of a chat response.
pub struct ChatResponse {
    /// HTTP status code.
    pub status: u16,
    /// Value of the `Content-Type` header, if present.
    pub content_type: Option<String>,
    /// Value of the `Retry-After` header in seconds, if present and numeric.
    pub retry_after: Option<u64>,
    /// The response body.
    pub body: ByteStream,
}

impl ChatResponse {
    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Returns true if the content type announces a single JSON document.
    ///
    /// Only `application/json` qualifies; line-delimited types such as `application/x-ndjson`
    /// announce a stream.
    pub fn is_buffered_json(&self) -> bool {
        self.content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .map(|essence| essence.trim().eq_ignore_ascii_case("application/json"))
            .unwrap_or(false)
    }

    /// Reads the rest of the body into a string.
    pub async fn text(self) -> Result<String> {
        let mut body = self.body;
        let mut buf = Vec::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        String::from_utf8(buf)
            .map_err(|e| Error::serialization("response body is not UTF-8", Some(Box::new(e))))
    }
}

impl std::fmt::Debug for ChatResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("retry_after", &self.retry_after)
            .finish_non_exhaustive()
    }
}

/// Performs the chat request.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` to `url` and returns once the response headers have arrived.
    async fn post_chat(&self, url: &Url, request: &ChatRequest) -> Result<ChatResponse>;
}

/// [`Transport`] over reqwest.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: ReqwestClient,
}

impl HttpTransport {
    /// Creates a transport with a fresh HTTP client.
    ///
    /// The client carries no timeout of its own; the dispatcher enforces deadlines.
    pub fn new() -> Result<Self> {
        let client = ReqwestClient::builder().build().map_err(|e| {
            Error::http_client(
                format!("Failed to build HTTP client: {e}"),
                Some(Box::new(e)),
            )
        })?;
        Ok(Self { client })
    }

    /// Creates a transport around an existing client.
    pub fn with_client(client: ReqwestClient) -> Self {
        Self { client }
    }

    fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/x-ndjson, application/json"),
        );
        headers
    }

    fn into_chat_response(response: Response) -> ChatResponse {
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|val| val.to_str().ok())
            .map(String::from);
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|val| val.to_str().ok())
            .and_then(|val| val.trim().parse::<u64>().ok());
        let body = response.bytes_stream().map(|result| {
            result.map_err(|e| {
                Error::streaming(format!("Error in HTTP stream: {e}"), Some(Box::new(e)))
            })
        });
        ChatResponse {
            status,
            content_type,
            retry_after,
            body: Box::pin(body),
        }
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn post_chat(&self, url: &Url, request: &ChatRequest) -> Result<ChatResponse> {
        let response = self
            .client
            .post(url.clone())
            .headers(Self::default_headers())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::timeout(format!("Request timed out: {e}"), None)
                } else if e.is_connect() {
                    Error::connection(format!("Connection error: {e}"), Some(Box::new(e)))
                } else {
                    Error::http_client(format!("Request failed: {e}"), Some(Box::new(e)))
                }
            })?;
        Ok(Self::into_chat_response(response))
    }
}
