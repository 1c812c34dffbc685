//! Session record written when the proxy exits.
//!
//! One JSON object per line, appended to a shared log. Writing the record is
//! best-effort: a failure is logged and never changes the exit status.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::session::ProxySession;

/// Event name of the record written at session end.
pub const RENDER_STOP: &str = "render_stop";

/// Summary of one finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub event: String,
    /// Program name of the rendering backend.
    pub renderer: String,
    /// Pid of the proxy process.
    pub pid: u32,
    /// Session start, seconds since the epoch.
    pub date_secs: u64,
    pub num_frames: u64,
    pub frame_bytes: u64,
    pub num_commands: u64,
    /// Seconds spent executing client commands.
    pub cmd_time: f64,
    /// Seconds from start to end of the session.
    pub session_time: f64,
    /// Process exit status.
    pub status: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub client_info: Vec<(String, String)>,
}

impl SessionRecord {
    /// Build the record from the session counters.
    pub fn from_session(session: &ProxySession, renderer: &str, status: i32) -> Self {
        let stats = &session.stats;
        let date_secs = stats
            .started_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Self {
            event: RENDER_STOP.to_string(),
            renderer: renderer.to_string(),
            pid: std::process::id(),
            date_secs,
            num_frames: stats.frames_sent,
            frame_bytes: stats.bytes_sent,
            num_commands: stats.commands,
            cmd_time: stats.command_time.as_secs_f64(),
            session_time: stats.started.elapsed().as_secs_f64(),
            status,
            client_info: session.client_info.clone(),
        }
    }

    /// Append the record as one line to `path`, creating its directory.
    pub fn append_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&line)?;
        Ok(())
    }

    /// [`append_to`](Self::append_to), logging instead of failing.
    pub fn write_best_effort(&self, path: &Path) {
        match self.append_to(path) {
            Ok(()) => tracing::debug!("session record appended to {}", path.display()),
            Err(e) => tracing::warn!("can't write session record to {}: {}", path.display(), e),
        }
    }
}
