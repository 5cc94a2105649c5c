//! PTY pairing with a multiplexer pane
//!
//! The relay does not own the agent process. It spawns a multiplexer attach
//! client inside a local PTY and drains whatever that client draws.

mod attach;

pub use attach::{AttachSettings, CloseReason, PaneAttachment};

use std::io::{Read, Write};

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, PtySize};
use tracing::info;

use crate::error::Result;

/// Control half of a spawned PTY
pub trait PtyControl: Send {
    fn resize(&self, cols: u16, rows: u16) -> Result<()>;
    fn kill(&mut self) -> Result<()>;
}

pub struct PtyParts {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub control: Box<dyn PtyControl>,
}

pub trait PtySpawner: Send + Sync {
    fn spawn(&self, program: &str, args: &[String], cols: u16, rows: u16) -> Result<PtyParts>;
}

/// portable-pty backed spawner
#[derive(Debug, Default)]
pub struct NativePtySpawner;

struct NativeControl {
    master: Box<dyn portable_pty::MasterPty + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
}

impl PtyControl for NativeControl {
    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })?;
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.child.kill()?;
        Ok(())
    }
}

impl PtySpawner for NativePtySpawner {
    fn spawn(&self, program: &str, args: &[String], cols: u16, rows: u16) -> Result<PtyParts> {
        let pair = native_pty_system().openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        // CommandBuilder starts with an empty environment
        for (key, value) in std::env::vars() {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");
        // attaching from inside a tmux client would nest
        cmd.env_remove("TMUX");

        let child = pair.slave.spawn_command(cmd)?;
        info!(program, ?args, pid = child.process_id().unwrap_or(0), "PTY client spawned");
        // the child holds its own slave handle; ours would keep the read side open
        drop(pair.slave);

        let writer = pair.master.take_writer()?;
        let reader = pair.master.try_clone_reader()?;
        Ok(PtyParts {
            reader,
            writer,
            control: Box::new(NativeControl {
                master: pair.master,
                child,
            }),
        })
    }
}
