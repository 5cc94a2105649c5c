//! Per-connection mode routing
//!
//! `full` connections get raw bytes in order; `tail` connections get digests.
//! The router keeps a cursor (absolute offset of the next byte owed to the
//! full stream) so that catch-up blocks, live chunks and lag resyncs never
//! emit the same byte twice.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::drain::Chunk;
use super::ring::ByteRing;
use super::tail::TailDigest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    #[default]
    Full,
    Tail,
}

impl std::str::FromStr for RelayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(RelayMode::Full),
            "tail" => Ok(RelayMode::Tail),
            other => Err(format!("unknown relay mode: {other}")),
        }
    }
}

/// What the connection should send next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Raw { offset: u64, data: Vec<u8> },
    CatchUp { offset: u64, data: Vec<u8> },
    Tail(TailDigest),
}

#[derive(Debug)]
pub struct ModeRouter {
    mode: RelayMode,
    cursor: u64,
    catchup_limit: usize,
    last_tail_seq: u64,
}

impl ModeRouter {
    pub fn new(mode: RelayMode, catchup_limit: usize) -> Self {
        Self {
            mode,
            cursor: 0,
            catchup_limit,
            last_tail_seq: 0,
        }
    }

    pub fn mode(&self) -> RelayMode {
        self.mode
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Initial history for a fresh connection. Call after subscribing to the
    /// drain so no chunk falls between the two.
    pub fn on_attach(&mut self, ring: &ByteRing) -> Option<Outbound> {
        match self.mode {
            RelayMode::Full => Some(self.catch_up(ring, ring.head().saturating_sub(self.catchup_limit as u64))),
            RelayMode::Tail => {
                self.cursor = ring.head();
                None
            }
        }
    }

    /// Live chunk from the drain loop
    pub fn on_chunk(&mut self, chunk: &Chunk, ring: &ByteRing) -> Option<Outbound> {
        if self.mode != RelayMode::Full || chunk.end() <= self.cursor {
            return None;
        }
        if chunk.offset > self.cursor {
            // missed something between cursor and this chunk; the ring has it
            return self.resync(ring);
        }
        let skip = (self.cursor - chunk.offset) as usize;
        let offset = self.cursor;
        self.cursor = chunk.end();
        Some(Outbound::Raw {
            offset,
            data: chunk.data[skip..].to_vec(),
        })
    }

    /// Refill from the ring after the broadcast receiver lagged
    pub fn resync(&mut self, ring: &ByteRing) -> Option<Outbound> {
        if self.mode != RelayMode::Full {
            return None;
        }
        let (offset, data) = ring.read_from(self.cursor);
        if offset > self.cursor {
            warn!(
                cursor = self.cursor,
                ring_start = offset,
                lost = offset - self.cursor,
                "Ring overwrote unsent bytes"
            );
        }
        self.cursor = ring.head();
        if data.is_empty() {
            return None;
        }
        Some(Outbound::Raw { offset, data })
    }

    /// Switch modes. `tail -> full` yields one catch-up block that starts no
    /// earlier than what the full stream already carried.
    pub fn set_mode(&mut self, mode: RelayMode, ring: &ByteRing) -> Option<Outbound> {
        if mode == self.mode {
            return None;
        }
        self.mode = mode;
        match mode {
            RelayMode::Full => {
                let floor = ring.head().saturating_sub(self.catchup_limit as u64);
                Some(self.catch_up(ring, floor.max(self.cursor)))
            }
            RelayMode::Tail => {
                self.last_tail_seq = 0;
                None
            }
        }
    }

    pub fn on_digest(&mut self, digest: &TailDigest) -> Option<Outbound> {
        if self.mode != RelayMode::Tail || digest.seq == self.last_tail_seq {
            return None;
        }
        self.last_tail_seq = digest.seq;
        Some(Outbound::Tail(digest.clone()))
    }

    fn catch_up(&mut self, ring: &ByteRing, from: u64) -> Outbound {
        let (offset, data) = ring.read_from(from);
        self.cursor = ring.head();
        Outbound::CatchUp { offset, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn chunk(ring: &mut ByteRing, data: &[u8]) -> Chunk {
        let offset = ring.push(data);
        Chunk {
            offset,
            data: Arc::from(data),
        }
    }

    fn span(out: &Outbound) -> Option<(u64, u64)> {
        match out {
            Outbound::Raw { offset, data } | Outbound::CatchUp { offset, data } => {
                Some((*offset, *offset + data.len() as u64))
            }
            Outbound::Tail(_) => None,
        }
    }

    #[test]
    fn test_catch_up_then_live_is_contiguous() {
        let mut ring = ByteRing::new(1024);
        let mut router = ModeRouter::new(RelayMode::Tail, 8);
        assert!(router.on_attach(&ring).is_none());

        let c1 = chunk(&mut ring, b"0123456789");
        assert!(router.on_chunk(&c1, &ring).is_none());

        let catch_up = router.set_mode(RelayMode::Full, &ring).unwrap();
        assert_eq!(
            catch_up,
            Outbound::CatchUp {
                offset: 2,
                data: b"23456789".to_vec()
            }
        );

        let c2 = chunk(&mut ring, b"ab");
        assert_eq!(
            router.on_chunk(&c2, &ring),
            Some(Outbound::Raw {
                offset: 10,
                data: b"ab".to_vec()
            })
        );
    }

    #[test]
    fn test_chunk_already_in_catch_up_is_skipped() {
        let mut ring = ByteRing::new(1024);
        let mut router = ModeRouter::new(RelayMode::Full, 1024);
        // the chunk is in the ring before the client catches up, but its
        // broadcast is still queued for this connection
        let queued = chunk(&mut ring, b"hello");
        let first = router.on_attach(&ring).unwrap();
        assert_eq!(span(&first), Some((0, 5)));
        assert!(router.on_chunk(&queued, &ring).is_none());
    }

    #[test]
    fn test_lag_resync_and_overwrite() {
        let mut ring = ByteRing::new(6);
        let mut router = ModeRouter::new(RelayMode::Full, 1024);
        router.on_attach(&ring);

        chunk(&mut ring, b"abcd");
        let out = router.resync(&ring).unwrap();
        assert_eq!(span(&out), Some((0, 4)));

        // ring holds 6 bytes, so "abcd" is overwritten but was already sent
        chunk(&mut ring, b"efgh");
        chunk(&mut ring, b"ij");
        let out = router.resync(&ring).unwrap();
        assert_eq!(span(&out), Some((4, 10)));
        assert_eq!(router.cursor(), 10);
    }

    #[test]
    fn test_tail_digest_dedup() {
        let mut router = ModeRouter::new(RelayMode::Tail, 16);
        let d = TailDigest { text: "x".into(), seq: 3 };
        assert!(router.on_digest(&d).is_some());
        assert!(router.on_digest(&d).is_none());

        let ring = ByteRing::new(16);
        router.set_mode(RelayMode::Full, &ring);
        assert!(router.on_digest(&d).is_none());
        router.set_mode(RelayMode::Tail, &ring);
        assert!(router.on_digest(&d).is_some());
    }

    /// No byte is emitted twice on the full stream whatever the toggle pattern
    #[test]
    fn test_mode_toggles_never_repeat_bytes() {
        let mut ring = ByteRing::new(256);
        let mut router = ModeRouter::new(RelayMode::Full, 48);
        let mut emitted: Vec<(u64, u64)> = Vec::new();
        fn record(out: Option<Outbound>, emitted: &mut Vec<(u64, u64)>) {
            if let Some(s) = out.as_ref().and_then(span) {
                if s.0 < s.1 {
                    emitted.push(s);
                }
            }
        }

        record(router.on_attach(&ring), &mut emitted);

        // xorshift so the pattern is varied but reproducible
        let mut state: u32 = 0x9e37_79b9;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        };

        for step in 0..2_000u32 {
            let r = next();
            match r % 7 {
                0 => {
                    let mode = if router.mode() == RelayMode::Full {
                        RelayMode::Tail
                    } else {
                        RelayMode::Full
                    };
                    let out = router.set_mode(mode, &ring);
                    record(out, &mut emitted);
                }
                1 => record(router.resync(&ring), &mut emitted),
                _ => {
                    let len = (r % 23 + 1) as usize;
                    let data: Vec<u8> = (0..len).map(|i| (step as usize + i) as u8).collect();
                    let c = chunk(&mut ring, &data);
                    // sometimes the broadcast is dropped (lag)
                    if r % 5 != 0 {
                        record(router.on_chunk(&c, &ring), &mut emitted);
                    }
                }
            }
        }

        for pair in emitted.windows(2) {
            assert!(
                pair[1].0 >= pair[0].1,
                "overlap: {:?} then {:?}",
                pair[0],
                pair[1]
            );
        }
        assert!(!emitted.is_empty());
    }
}
