use super::throughput::Worker;
use super::transport::Transport;
use bytes::Bytes;
use rand::{RngCore, SeedableRng};
use tokio::time::Instant;
use tracing::debug;

/// Incompressible payload shared by every upload request of a phase.
pub(crate) fn random_payload(len: usize) -> Bytes {
    let mut rng = rand::rngs::StdRng::from_entropy();
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    Bytes::from(data)
}

/// Upload worker: posts `payload` back to back until the phase ends.
///
/// A request counts towards the average only if it was dispatched after the
/// grace deadline, and only once the server has accepted it. Returns the bytes
/// the server accepted from this worker.
pub(crate) async fn run_worker<T: Transport>(worker: Worker<T>, payload: Bytes) -> u64 {
    let len = payload.len() as u64;
    let mut sent: u64 = 0;

    while worker.should_continue() {
        let counted = worker.counter.admit(Instant::now());

        let result = tokio::select! {
            _ = worker.cancel.cancelled() => break,
            result = worker.transport.upload(payload.clone()) => result,
        };

        match result {
            Ok(()) => {
                if worker.counter.is_expired(Instant::now()) {
                    break;
                }
                worker.counter.record(len, counted);
                sent += len;
            }
            Err(e) => {
                debug!("Upload worker {}: request failed: {}", worker.id, e);
                worker.back_off().await;
            }
        }
    }

    sent
}
