//! HTTP transport boundary.
//!
//! Workers only see [`Transport`]: a blocking `get`/`post` pair with streaming
//! bodies in both directions. Session setup, auth and connection pooling live
//! behind it. [`HttpTransport`] is the `reqwest` implementation; tests plug in
//! scripted fakes.

use crate::error::TransportError;
use reqwest::blocking::{Body, Client};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use std::io::{self, Read};

/// Cap on how much of an error body is kept for messages.
const ERROR_BODY_LIMIT: u64 = 4096;

/// Streaming request body for an upload.
pub struct UploadBody {
    pub reader: Box<dyn Read + Send>,
    pub len: u64,
    pub content_type: String,
}

/// Status plus a body that is read lazily.
pub struct Response {
    pub status: u16,
    pub content_length: Option<u64>,
    body: Box<dyn Read + Send>,
}

impl Response {
    pub fn new(status: u16, content_length: Option<u64>, body: Box<dyn Read + Send>) -> Self {
        Self {
            status,
            content_length,
            body,
        }
    }

    /// Convenience for fixed in-memory bodies.
    pub fn from_bytes(status: u16, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        let len = bytes.len() as u64;
        Self::new(status, Some(len), Box::new(io::Cursor::new(bytes)))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn into_reader(self) -> Box<dyn Read + Send> {
        self.body
    }

    /// Body as text, truncated for use in error messages.
    pub fn text(self) -> String {
        let mut buf = Vec::new();
        let _ = self.body.take(ERROR_BODY_LIMIT).read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).trim().to_string()
    }
}

pub trait Transport: Send + Sync {
    fn get(&self, url: &str) -> Result<Response, TransportError>;

    fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: UploadBody,
    ) -> Result<Response, TransportError>;
}

/// `reqwest` blocking client with no overall request timeout, so large
/// transfers are never cut off.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// `default_headers` are sent with every request (auth tokens etc).
    pub fn new(default_headers: &[(String, String)]) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        for (name, value) in default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Other(format!("invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Other(format!("invalid value for {name}: {e}")))?;
            headers.insert(name, value);
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(None::<std::time::Duration>)
            .build()
            .map_err(classify)?;
        Ok(Self { client })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

fn into_response(resp: reqwest::blocking::Response) -> Response {
    let status = resp.status().as_u16();
    let content_length = resp.content_length();
    Response::new(status, content_length, Box::new(resp))
}

impl Transport for HttpTransport {
    fn get(&self, url: &str) -> Result<Response, TransportError> {
        self.client.get(url).send().map(into_response).map_err(classify)
    }

    fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: UploadBody,
    ) -> Result<Response, TransportError> {
        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, body.content_type.as_str());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
            .body(Body::sized(body.reader, body.len))
            .send()
            .map(into_response)
            .map_err(classify)
    }
}
