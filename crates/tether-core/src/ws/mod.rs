//! WebSocket surface

mod server;

pub use server::{RelayServer, RelayServerOptions};
