//! Per-process proxy state.
//!
//! One [`ProxySession`] exists per client session. It is passed by reference
//! to every component that reads or updates it: the translator raises flags
//! and accumulates view changes, and the event loop consumes them when it
//! flushes and renders.

use std::time::{Duration, Instant, SystemTime};

use bitflags::bitflags;

use crate::protocol::ImageTag;

bitflags! {
    /// Work pending for the next flush or render.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PendingFlags: u32 {
        /// Render as soon as the queue is empty, without waiting for idle.
        const FORCE_UPDATE = 1 << 0;
        /// Rendering is allowed at all.
        const CAN_UPDATE = 1 << 1;
        /// The next image gets a new cache id.
        const INVALIDATE_CACHE = 1 << 3;
        const ATOM_SCALE_PENDING = 1 << 4;
        const STICK_RADIUS_PENDING = 1 << 5;
        const ROTATE_PENDING = 1 << 6;
        const PAN_PENDING = 1 << 7;
        const ZOOM_PENDING = 1 << 8;
        /// A render is wanted.
        const UPDATE_PENDING = 1 << 9;
        const VIEWPORT_PENDING = 1 << 10;
    }
}

/// Coalesced view changes. Each field is meaningful only while its
/// pending flag is set.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PendingView {
    pub rotate: [f32; 3],
    pub pan: [f32; 2],
    pub zoom: f32,
    pub sphere_scale: f32,
    pub stick_radius: f32,
    pub viewport: (u32, u32),
}

/// Sticky error state of the backend channel.
///
/// Once latched, every backend exchange fails immediately without I/O until
/// an exchange succeeds again.
#[derive(Debug, Clone, Default)]
pub struct FaultLatch {
    last: Option<String>,
}

impl FaultLatch {
    pub fn is_set(&self) -> bool {
        self.last.is_some()
    }

    /// Text of the failure that set the latch.
    pub fn message(&self) -> Option<&str> {
        self.last.as_deref()
    }

    pub fn set(&mut self, message: impl Into<String>) {
        self.last = Some(message.into());
    }

    pub fn clear(&mut self) {
        self.last = None;
    }
}

/// Counters reported in the session record.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub started_at: SystemTime,
    pub started: Instant,
    pub frames_sent: u64,
    /// Image payload bytes, headers excluded.
    pub bytes_sent: u64,
    pub commands: u64,
    pub command_time: Duration,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            started_at: SystemTime::now(),
            started: Instant::now(),
            frames_sent: 0,
            bytes_sent: 0,
            commands: 0,
            command_time: Duration::ZERO,
        }
    }
}

impl SessionStats {
    pub fn record_command(&mut self, elapsed: Duration) {
        self.commands += 1;
        self.command_time += elapsed;
    }

    pub fn record_frame(&mut self, bytes: usize) {
        self.frames_sent += 1;
        self.bytes_sent += bytes as u64;
    }
}

/// All mutable proxy state for one client session.
#[derive(Debug, Clone)]
pub struct ProxySession {
    pub flags: PendingFlags,
    pub view: PendingView,
    pub frame: i64,
    pub rock_offset: f32,
    pub cache_id: i64,
    pub fault: FaultLatch,
    pub stats: SessionStats,
    /// Key/value pairs reported by the client.
    pub client_info: Vec<(String, String)>,
}

impl Default for ProxySession {
    fn default() -> Self {
        Self {
            flags: PendingFlags::CAN_UPDATE,
            view: PendingView {
                sphere_scale: 0.25,
                stick_radius: 0.25,
                ..PendingView::default()
            },
            frame: 1,
            rock_offset: 0.0,
            cache_id: 0,
            fault: FaultLatch::default(),
            stats: SessionStats::default(),
            client_info: Vec::new(),
        }
    }
}

impl ProxySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the loop should render once the queue is empty.
    pub fn wants_render(&self, idle: bool) -> bool {
        self.flags
            .contains(PendingFlags::UPDATE_PENDING | PendingFlags::CAN_UPDATE)
            && (idle || self.flags.contains(PendingFlags::FORCE_UPDATE))
    }

    /// Whether the view changed since the last image. Clears the flag.
    ///
    /// The cache id itself only changes when a structure state is loaded.
    pub fn take_cache_invalidation(&mut self) -> bool {
        let stale = self.flags.contains(PendingFlags::INVALIDATE_CACHE);
        self.flags.remove(PendingFlags::INVALIDATE_CACHE);
        stale
    }

    /// Tag for an image of the current view.
    pub fn image_tag(&self) -> ImageTag {
        ImageTag {
            cache_id: self.cache_id.to_string(),
            frame: self.frame,
            rock_offset: self.rock_offset,
        }
    }

    /// Clear the flags satisfied by a completed render.
    pub fn rendered(&mut self) {
        self.flags
            .remove(PendingFlags::UPDATE_PENDING | PendingFlags::FORCE_UPDATE);
    }
}
