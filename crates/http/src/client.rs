//! `UploadServer` over HTTP.
//!
//! JSON bodies for init, dedup and merge, multipart form for chunk bytes, a
//! GET for session status. Every reply is an [`ApiEnvelope`].

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Response, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sliceup_engine::{ServerError, ServerFuture, UploadServer};
use sliceup_protocol::{
    ApiEnvelope, CheckExistsRequest, CheckExistsResponse, InitUploadRequest, InitUploadResponse,
    MergeRequest, MergeResponse, UploadChunkRequest, UploadChunkResponse, UploadStatusResponse,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::HttpConfig;

/// Errors building the client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid base URL {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("invalid header: {0}")]
    InvalidHeader(String),
}

/// Upload server reached over HTTP.
pub struct HttpUploadServer {
    http: reqwest::Client,
    config: HttpConfig,
}

impl HttpUploadServer {
    pub fn new(config: HttpConfig) -> Result<Self, Error> {
        Url::parse(&config.base_url).map_err(|e| Error::InvalidBaseUrl {
            url: config.base_url.clone(),
            reason: e.to_string(),
        })?;

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::InvalidHeader(name.clone()))?;
            let value =
                HeaderValue::from_str(value).map_err(|_| Error::InvalidHeader(name.clone()))?;
            headers.insert(header, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// POSTs a JSON body and unwraps the envelope of the reply.
    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ServerError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.config.url(path);
        debug!(url = %url, "POST");
        let resp = self
            .http
            .post(&url)
            .timeout(self.config.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        decode(resp).await
    }

    async fn send_chunk(
        &self,
        request: UploadChunkRequest,
        data: Vec<u8>,
    ) -> Result<UploadChunkResponse, ServerError> {
        let url = self.config.url(&self.config.endpoints.upload_chunk);
        debug!(url = %url, sequence = request.sequence, bytes = data.len(), "POST chunk");

        let part = Part::bytes(data)
            .file_name(format!("{}.{}", request.file_name, request.sequence))
            .mime_str("application/octet-stream")
            .map_err(|e| ServerError::Protocol(e.to_string()))?;
        let mut form = Form::new()
            .text("sliceId", request.slice_id)
            .text("sequence", request.sequence.to_string())
            .text("chunkCount", request.chunk_count.to_string())
            .text("fingerprint", request.fingerprint)
            .text("fileName", request.file_name);
        if !request.chunk_md5.is_empty() {
            form = form.text("chunkMd5", request.chunk_md5);
        }
        let form = form.part("file", part);

        let resp = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(transport)?;
        decode(resp).await
    }

    async fn get_status(&self, slice_id: &str) -> Result<UploadStatusResponse, ServerError> {
        let mut url = Url::parse(&self.config.url(&self.config.endpoints.status))
            .map_err(|e| ServerError::Protocol(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ServerError::Protocol("status URL cannot take a path".into()))?
            .pop_if_empty()
            .push(slice_id);
        debug!(url = %url, "GET");

        let resp = self
            .http
            .get(url)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(transport)?;
        decode(resp).await
    }
}

impl UploadServer for HttpUploadServer {
    fn init_upload(&self, request: InitUploadRequest) -> ServerFuture<'_, InitUploadResponse> {
        Box::pin(async move { self.post_json(&self.config.endpoints.init, &request).await })
    }

    fn upload_chunk(
        &self,
        request: UploadChunkRequest,
        data: Vec<u8>,
        cancel: CancellationToken,
    ) -> ServerFuture<'_, UploadChunkResponse> {
        Box::pin(async move {
            // Dropping the request future aborts the connection.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ServerError::Cancelled),
                result = self.send_chunk(request, data) => result,
            }
        })
    }

    fn check_exists(&self, request: CheckExistsRequest) -> ServerFuture<'_, CheckExistsResponse> {
        Box::pin(async move {
            self.post_json(&self.config.endpoints.check_exists, &request)
                .await
        })
    }

    fn merge_chunks(&self, request: MergeRequest) -> ServerFuture<'_, MergeResponse> {
        Box::pin(async move { self.post_json(&self.config.endpoints.merge, &request).await })
    }

    fn upload_status(&self, slice_id: String) -> ServerFuture<'_, UploadStatusResponse> {
        Box::pin(async move { self.get_status(&slice_id).await })
    }
}

fn transport(e: reqwest::Error) -> ServerError {
    if e.is_timeout() {
        ServerError::Timeout
    } else if e.is_decode() {
        ServerError::Protocol(e.to_string())
    } else {
        ServerError::Transport(e.to_string())
    }
}

/// Maps an HTTP reply onto the contract: non-2xx becomes `Status`, a 2xx
/// envelope with a non-OK code becomes `Status` with that code.
async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ServerError> {
    let status = resp.status();
    let body = resp.bytes().await.map_err(transport)?;

    if !status.is_success() {
        let message = serde_json::from_slice::<ApiEnvelope<serde_json::Value>>(&body)
            .ok()
            .map(|env| env.msg)
            .filter(|msg| !msg.is_empty())
            .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());
        return Err(ServerError::Status {
            status: status.as_u16(),
            message,
        });
    }

    let envelope: ApiEnvelope<T> = serde_json::from_slice(&body)
        .map_err(|e| ServerError::Protocol(format!("invalid response body: {e}")))?;
    Ok(envelope.into_result()?)
}
