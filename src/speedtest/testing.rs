//! In-process transports for timing tests. Meant to run on a paused tokio clock.

use super::error::TransportError;
use super::transport::{ByteStream, Transport};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

fn refused() -> TransportError {
    TransportError::Connection("connection refused".to_string())
}

/// Every exchange fails immediately.
pub(crate) struct FailingTransport;

impl Transport for FailingTransport {
    async fn probe(&self) -> Result<(), TransportError> {
        Err(refused())
    }

    async fn download(&self) -> Result<ByteStream, TransportError> {
        Err(refused())
    }

    async fn upload(&self, _payload: Bytes) -> Result<(), TransportError> {
        Err(refused())
    }
}

/// Every exchange hangs forever.
pub(crate) struct StalledTransport;

impl Transport for StalledTransport {
    async fn probe(&self) -> Result<(), TransportError> {
        std::future::pending().await
    }

    async fn download(&self) -> Result<ByteStream, TransportError> {
        Ok(futures::stream::pending::<Result<Bytes, TransportError>>().boxed())
    }

    async fn upload(&self, _payload: Bytes) -> Result<(), TransportError> {
        std::future::pending().await
    }
}

/// Probes answer after scripted delays; `None` entries fail. Once the script
/// runs out every probe takes `fallback`.
pub(crate) struct ScriptedProbes {
    script: Mutex<VecDeque<Option<Duration>>>,
    fallback: Duration,
}

impl ScriptedProbes {
    pub(crate) fn new(
        script: impl IntoIterator<Item = Option<Duration>>,
        fallback: Duration,
    ) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
        }
    }

    pub(crate) fn fixed(delay: Duration) -> Self {
        Self::new([], delay)
    }
}

impl Transport for ScriptedProbes {
    async fn probe(&self) -> Result<(), TransportError> {
        let next = self.script.lock().unwrap().pop_front();
        match next.unwrap_or(Some(self.fallback)) {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => Err(refused()),
        }
    }

    async fn download(&self) -> Result<ByteStream, TransportError> {
        Err(refused())
    }

    async fn upload(&self, _payload: Bytes) -> Result<(), TransportError> {
        Err(refused())
    }
}

/// Constant-rate link.
///
/// Downloads stream `chunk_bytes` right away and then once per `every`, either
/// forever or for `chunks_per_request` chunks. Uploads complete `every` after
/// dispatch. Probes take `every`.
pub(crate) struct ConstantRate {
    chunk_bytes: usize,
    every: Duration,
    chunks_per_request: Option<usize>,
    uploads_completed: AtomicU64,
    download_requests: AtomicU64,
}

impl ConstantRate {
    pub(crate) fn new(chunk_bytes: usize, every: Duration) -> Self {
        Self {
            chunk_bytes,
            every,
            chunks_per_request: None,
            uploads_completed: AtomicU64::new(0),
            download_requests: AtomicU64::new(0),
        }
    }

    pub(crate) fn with_chunks_per_request(mut self, chunks: usize) -> Self {
        self.chunks_per_request = Some(chunks);
        self
    }

    pub(crate) fn uploads_completed(&self) -> u64 {
        self.uploads_completed.load(Ordering::SeqCst)
    }

    pub(crate) fn download_requests(&self) -> u64 {
        self.download_requests.load(Ordering::SeqCst)
    }
}

impl Transport for ConstantRate {
    async fn probe(&self) -> Result<(), TransportError> {
        tokio::time::sleep(self.every).await;
        Ok(())
    }

    async fn download(&self) -> Result<ByteStream, TransportError> {
        self.download_requests.fetch_add(1, Ordering::SeqCst);
        let chunk = Bytes::from(vec![0u8; self.chunk_bytes]);
        let every = self.every;
        let stream = futures::stream::unfold(0usize, move |sent| {
            let chunk = chunk.clone();
            async move {
                if sent > 0 {
                    tokio::time::sleep(every).await;
                }
                Some((Ok::<_, TransportError>(chunk), sent + 1))
            }
        });
        Ok(match self.chunks_per_request {
            Some(limit) => stream.take(limit).boxed(),
            None => stream.boxed(),
        })
    }

    async fn upload(&self, _payload: Bytes) -> Result<(), TransportError> {
        tokio::time::sleep(self.every).await;
        self.uploads_completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
