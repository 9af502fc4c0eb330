//! Hand-off of the negotiated stream to a media pipeline.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::process::ExitStatus;

use async_process::{Child, Command};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use tracing::{info, warn};
use zbus::zvariant::OwnedFd;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::portal::StreamDescriptor;

/// Consumer of a negotiated stream.
pub trait StreamSink {
    /// Starts consuming `stream`, optionally through a dedicated PipeWire remote.
    fn start(&mut self, stream: &StreamDescriptor, remote: Option<OwnedFd>) -> Result<()>;
}

/// Runs an external command (by default `gst-launch-1.0`) on the stream.
pub struct CommandPipeline {
    config: PipelineConfig,
    child: Option<Child>,
    // Kept open for as long as the child may use it.
    remote: Option<OwnedFd>,
}

impl CommandPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            child: None,
            remote: None,
        }
    }

    /// Waits for the launched command to exit. Never returns if nothing runs.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        match self.child.as_mut() {
            Some(child) => child.status().await,
            None => futures::future::pending().await,
        }
    }
}

impl StreamSink for CommandPipeline {
    fn start(&mut self, stream: &StreamDescriptor, remote: Option<OwnedFd>) -> Result<()> {
        if !self.config.enabled {
            info!(node_id = stream.node_id, "Pipeline disabled, not consuming stream");
            return Ok(());
        }

        let fd = match &remote {
            Some(remote) => Some(inheritable(remote)?),
            None => None,
        };
        let args = render_args(&self.config.args, stream.node_id, fd);

        info!(program = %self.config.program, ?args, "Launching pipeline");
        let child = Command::new(&self.config.program)
            .args(&args)
            .kill_on_drop(true)
            .spawn()?;

        self.child = Some(child);
        self.remote = remote;
        Ok(())
    }
}

/// Clears `FD_CLOEXEC` so a spawned child keeps the descriptor.
fn inheritable(fd: &OwnedFd) -> io::Result<RawFd> {
    let raw = fd.as_raw_fd();
    fcntl(raw, FcntlArg::F_SETFD(FdFlag::empty())).map_err(io::Error::from)?;
    Ok(raw)
}

/// Substitutes `{node_id}` and `{fd}` in `args`.
///
/// Arguments mentioning `{fd}` are dropped when no remote was opened.
pub fn render_args(args: &[String], node_id: u32, fd: Option<RawFd>) -> Vec<String> {
    args.iter()
        .filter_map(|arg| {
            let arg = arg.replace("{node_id}", &node_id.to_string());
            match fd {
                Some(fd) => Some(arg.replace("{fd}", &fd.to_string())),
                None if arg.contains("{fd}") => {
                    warn!(%arg, "No PipeWire remote, dropping argument");
                    None
                }
                None => Some(arg),
            }
        })
        .collect()
}
