//! Drain loop and dual-mode router

pub mod drain;
pub mod ring;
pub mod router;
pub mod tail;

pub use drain::{spawn_drain, Chunk, DrainEvent, DrainHandle};
pub use ring::{ByteRing, SharedRing};
pub use router::{ModeRouter, Outbound, RelayMode};
pub use tail::{plain_lines, spawn_tail_task, strip_ansi, TailDigest, TailDigester};
