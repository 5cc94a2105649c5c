//! PTY drain loop
//!
//! One blocking reader per live PTY. Each chunk lands in the ring before it
//! is broadcast, and the broadcast never waits for receivers: a slow client
//! lags and resynchronizes from the ring instead of throttling the read.

use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ring::SharedRing;

const READ_BUF_SIZE: usize = 8192;

/// Bytes drained from the PTY, tagged with their absolute ring offset
#[derive(Debug, Clone)]
pub struct Chunk {
    pub offset: u64,
    pub data: Arc<[u8]>,
}

impl Chunk {
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

#[derive(Debug, Clone)]
pub enum DrainEvent {
    Data(Chunk),
    /// The PTY descriptor closed; the pane or the attach client is gone
    Closed { reason: String },
}

pub struct DrainHandle {
    running: Arc<AtomicBool>,
    reads: Arc<AtomicU64>,
    join: JoinHandle<()>,
}

impl DrainHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of successful reads so far
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub async fn wait(self) {
        let _ = self.join.await;
    }
}

/// Start draining `reader` into `ring`, announcing chunks on `tx`
pub fn spawn_drain(
    mut reader: Box<dyn Read + Send>,
    ring: SharedRing,
    tx: broadcast::Sender<DrainEvent>,
    label: String,
) -> DrainHandle {
    let running = Arc::new(AtomicBool::new(true));
    let reads = Arc::new(AtomicU64::new(0));
    let running_flag = Arc::clone(&running);
    let read_count = Arc::clone(&reads);

    let join = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUF_SIZE];
        let reason = loop {
            match reader.read(&mut buf) {
                Ok(0) => break "eof".to_string(),
                Ok(n) => {
                    let offset = {
                        let mut ring = ring.lock().unwrap_or_else(|e| e.into_inner());
                        ring.push(&buf[..n])
                    };
                    read_count.fetch_add(1, Ordering::Relaxed);
                    // no receivers is fine; the ring still advanced
                    let _ = tx.send(DrainEvent::Data(Chunk {
                        offset,
                        data: Arc::from(&buf[..n]),
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(target_pane = %label, error = %e, "PTY read failed");
                    break e.to_string();
                }
            }
        };
        running_flag.store(false, Ordering::SeqCst);
        info!(target_pane = %label, %reason, "Drain loop finished");
        let _ = tx.send(DrainEvent::Closed { reason });
        debug!(target_pane = %label, "Drain closed event sent");
    });

    DrainHandle {
        running,
        reads,
        join,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::ring::ByteRing;
    use std::io::Cursor;

    /// Reader that yields fixed-size pieces, one per `read`
    struct Pieces {
        pieces: Vec<Vec<u8>>,
    }

    impl Read for Pieces {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pieces.is_empty() {
                return Ok(0);
            }
            let piece = self.pieces.remove(0);
            buf[..piece.len()].copy_from_slice(&piece);
            Ok(piece.len())
        }
    }

    #[tokio::test]
    async fn test_ring_advances_with_zero_consumers() {
        let ring = ByteRing::shared(1024);
        let (tx, rx) = broadcast::channel(4);
        drop(rx);

        let reader = Box::new(Cursor::new(b"hello world".to_vec()));
        let handle = spawn_drain(reader, ring.clone(), tx, "%1".into());
        handle.wait().await;

        let ring = ring.lock().unwrap();
        assert_eq!(ring.head(), 11);
        assert_eq!(ring.read_from(0).1, b"hello world".to_vec());
    }

    #[tokio::test]
    async fn test_read_cadence_ignores_lagging_consumer() {
        let pieces: Vec<Vec<u8>> = (0..50).map(|i| format!("line {i}\n").into_bytes()).collect();
        let total: usize = pieces.iter().map(|p| p.len()).sum();

        let ring = ByteRing::shared(64 * 1024);
        // capacity far below the number of chunks, and nobody reads
        let (tx, mut slow_rx) = broadcast::channel(2);
        let handle = spawn_drain(Box::new(Pieces { pieces }), ring.clone(), tx, "%1".into());

        // wait for the loop to finish without consuming anything
        while handle.is_running() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(handle.reads(), 50);
        assert_eq!(ring.lock().unwrap().head(), total as u64);

        assert!(matches!(
            slow_rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        handle.wait().await;
    }

    #[tokio::test]
    async fn test_chunks_carry_ring_offsets() {
        let ring = ByteRing::shared(1024);
        let (tx, mut rx) = broadcast::channel(16);
        let pieces = vec![b"abc".to_vec(), b"defg".to_vec()];
        let handle = spawn_drain(Box::new(Pieces { pieces }), ring, tx, "%1".into());

        let mut offsets = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                DrainEvent::Data(chunk) => offsets.push((chunk.offset, chunk.end())),
                DrainEvent::Closed { reason } => {
                    assert_eq!(reason, "eof");
                    break;
                }
            }
        }
        assert_eq!(offsets, vec![(0, 3), (3, 7)]);
        handle.wait().await;
    }
}
