//! HTTP side of the speed test.
//!
//! The engine only needs three exchanges from a server: a near-empty GET for
//! latency, a large streamed GET for download and a discarded POST for upload.
//! [`Transport`] captures exactly that so measurement code can run against a
//! real backend or an in-process fake.

use super::error::{SpeedTestError, TransportError};
use crate::settings::Settings;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use std::future::Future;
use std::time::Duration;

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

const LATENCY_ENDPOINT: &str = "empty.php";
const DOWNLOAD_ENDPOINT: &str = "garbage.php";
const UPLOAD_ENDPOINT: &str = "empty.php";

const POOL_MAX_IDLE_PER_HOST: usize = 10;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub trait Transport: Send + Sync + 'static {
    /// Near-empty round trip. Resolves once the full response has been received.
    fn probe(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Starts a large download and hands back its body as a chunk stream.
    fn download(&self) -> impl Future<Output = Result<ByteStream, TransportError>> + Send;

    /// Posts `payload` to the discard endpoint. `Ok` means the server accepted it.
    fn upload(&self, payload: Bytes) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// [`Transport`] over a shared, connection-pooling `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base: Url,
    chunk_count: u32,
}

impl HttpTransport {
    pub fn new(settings: &Settings) -> Result<Self, SpeedTestError> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .read_timeout(settings.request_timeout)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build()
            .map_err(SpeedTestError::Client)?;

        Ok(Self {
            client,
            base: settings.server_url()?,
            chunk_count: settings.download_chunk_count,
        })
    }

    /// Endpoint URL with a random `r` parameter so no cache answers for the server.
    fn endpoint(&self, path: &str, query: &[(&str, String)]) -> Result<Url, TransportError> {
        let mut url = self
            .base
            .join(path)
            .map_err(|e| TransportError::Connection(format!("bad endpoint {path}: {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
            pairs.append_pair("r", &rand::random::<f64>().to_string());
        }
        Ok(url)
    }

    pub fn latency_url(&self) -> Result<Url, TransportError> {
        self.endpoint(LATENCY_ENDPOINT, &[])
    }

    pub fn download_url(&self) -> Result<Url, TransportError> {
        self.endpoint(DOWNLOAD_ENDPOINT, &[("ckSize", self.chunk_count.to_string())])
    }

    pub fn upload_url(&self) -> Result<Url, TransportError> {
        self.endpoint(UPLOAD_ENDPOINT, &[])
    }
}

impl Transport for HttpTransport {
    async fn probe(&self) -> Result<(), TransportError> {
        let response = self.client.get(self.latency_url()?).send().await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status()));
        }
        response.bytes().await?;
        Ok(())
    }

    async fn download(&self) -> Result<ByteStream, TransportError> {
        let response = self.client.get(self.download_url()?).send().await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status()));
        }
        Ok(response.bytes_stream().map_err(TransportError::from).boxed())
    }

    async fn upload(&self, payload: Bytes) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.upload_url()?)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status()));
        }
        Ok(())
    }
}
