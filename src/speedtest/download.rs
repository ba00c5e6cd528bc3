use super::throughput::Worker;
use super::transport::Transport;
use futures::StreamExt;
use tokio::time::Instant;
use tracing::debug;

/// Download worker: keeps one streamed GET open at a time until the phase ends,
/// reconnecting whenever a body finishes or fails. Returns the bytes it received.
pub(crate) async fn run_worker<T: Transport>(worker: Worker<T>) -> u64 {
    let mut received: u64 = 0;

    while worker.should_continue() {
        let response = tokio::select! {
            _ = worker.cancel.cancelled() => break,
            response = worker.transport.download() => response,
        };

        let mut body = match response {
            Ok(body) => body,
            Err(e) => {
                debug!("Download worker {}: request failed: {}", worker.id, e);
                worker.back_off().await;
                continue;
            }
        };

        let mut request_bytes: u64 = 0;
        loop {
            let chunk = tokio::select! {
                _ = worker.cancel.cancelled() => return received + request_bytes,
                chunk = body.next() => chunk,
            };

            match chunk {
                Some(Ok(chunk)) => {
                    let now = Instant::now();
                    if worker.counter.is_expired(now) {
                        return received + request_bytes;
                    }
                    let len = chunk.len() as u64;
                    let counted = worker.counter.admit(now);
                    worker.counter.record(len, counted);
                    request_bytes += len;
                }
                Some(Err(e)) => {
                    debug!("Download worker {}: body failed: {}", worker.id, e);
                    break;
                }
                None => break,
            }
        }

        received += request_bytes;
        if request_bytes == 0 {
            worker.back_off().await;
        }
    }

    received
}
