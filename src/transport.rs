//! HTTP transport for multipart uploads
//!
//! [`Transport`] is the seam the worker drives; [`ReqwestTransport`] is the
//! production implementation. A transport reports bytes as it streams the
//! file through a [`ProgressSink`] and returns whatever response the server
//! sent. Deciding what a non-2xx status means is left to the worker.

use crate::config::HttpConfig;
use crate::error::{Error, Result, TransferError};
use crate::source::UploadSource;
use crate::types::TaskId;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{RETRY_AFTER, USER_AGENT};
use reqwest::multipart::{Form, Part};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::io::ReaderStream;
use url::Url;

/// Parse and check an upload target
///
/// Only absolute `http` and `https` URLs are accepted.
pub fn validate_target_url(target: &str) -> std::result::Result<Url, TransferError> {
    let url = Url::parse(target).map_err(|e| TransferError::InvalidUrl(format!("{target}: {e}")))?;
    match url.scheme() {
        "http" | "https" if url.has_host() => Ok(url),
        "http" | "https" => Err(TransferError::InvalidUrl(format!("{target}: missing host"))),
        scheme => Err(TransferError::InvalidUrl(format!(
            "{target}: unsupported scheme '{scheme}'"
        ))),
    }
}

/// Everything a transport needs for one attempt
#[derive(Debug)]
pub struct UploadRequest {
    /// Upload being attempted
    pub id: TaskId,
    /// Validated endpoint
    pub url: Url,
    /// Extra request headers, in order
    pub headers: Vec<(String, String)>,
    /// Extra multipart text fields, in order
    pub form_fields: Vec<(String, String)>,
    /// Multipart field name of the file part
    pub field_name: String,
    /// Content type of the file part
    pub mime_type: String,
    /// User-Agent header value
    pub user_agent: String,
    /// The content to send
    pub source: UploadSource,
}

/// What the server answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code
    pub status: u16,
    /// Canonical reason phrase ("" if unknown)
    pub reason: String,
    /// Response body text
    pub body: String,
    /// Raw `Retry-After` header, if present
    pub retry_after: Option<String>,
}

impl TransportResponse {
    /// 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Receives the running byte count of an attempt
///
/// Cheap to clone. Reports are coalesced: the worker only ever sees the latest
/// count, which is all the throttling and rate sampling need.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Arc<watch::Sender<u64>>,
}

impl ProgressSink {
    /// Create a sink and the receiver the worker polls
    pub fn channel() -> (Self, watch::Receiver<u64>) {
        let (tx, rx) = watch::channel(0);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Report the total bytes sent so far in this attempt
    pub fn report(&self, bytes_sent: u64) {
        self.tx.send_replace(bytes_sent);
    }
}

/// Executes one multipart upload
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST `request` and return the server's answer
    ///
    /// Connection, timeout and body-streaming failures surface as
    /// [`TransferError::Data`]; they are retried with backoff.
    async fn upload(
        &self,
        request: UploadRequest,
        progress: ProgressSink,
    ) -> std::result::Result<TransportResponse, TransferError>;
}

/// [`Transport`] backed by a shared `reqwest` client
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client with the configured timeouts
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().connect_timeout(config.connect_timeout);
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(Error::Network)?;
        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> TransferError {
    if e.is_builder() {
        TransferError::Other(e.to_string())
    } else if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode() {
        TransferError::Data(e.to_string())
    } else {
        TransferError::Other(e.to_string())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn upload(
        &self,
        request: UploadRequest,
        progress: ProgressSink,
    ) -> std::result::Result<TransportResponse, TransferError> {
        let UploadRequest {
            id,
            url,
            headers,
            form_fields,
            field_name,
            mime_type,
            user_agent,
            source,
        } = request;

        let mut sent: u64 = 0;
        let stream = ReaderStream::new(source.reader).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                sent += bytes.len() as u64;
                progress.report(sent);
            }
            chunk
        });
        let body = reqwest::Body::wrap_stream(stream);

        let part = match source.length {
            Some(length) => Part::stream_with_length(body, length),
            None => Part::stream(body),
        }
        .file_name(source.file_name)
        .mime_str(&mime_type)
        .map_err(|e| TransferError::Other(format!("invalid content type '{mime_type}': {e}")))?;

        let mut form = Form::new();
        for (name, value) in form_fields {
            form = form.text(name, value);
        }
        let form = form.part(field_name, part);

        let mut builder = self
            .client
            .post(url)
            .header(USER_AGENT, user_agent)
            .multipart(form);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }

        tracing::debug!(upload_id = id.0, "Sending upload request");
        let response = builder.send().await.map_err(classify_reqwest_error)?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(classify_reqwest_error)?;

        tracing::debug!(upload_id = id.0, status = status.as_u16(), "Upload request finished");
        Ok(TransportResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            body,
            retry_after,
        })
    }
}
