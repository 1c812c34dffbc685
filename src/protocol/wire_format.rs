//! Image framing on both sides of the proxy.
//!
//! Backend to proxy, one announcement line followed by raw bytes:
//! ```text
//! <format> image follows: <N>\n
//! <N raw bytes>
//! ```
//! For PNG the backend also prints a trailing line starting with
//! [`PNG_SENTINEL`] once the file is written.
//!
//! Proxy to client, one header line followed by the same bytes:
//! ```text
//! nv>image <nBytes> <cacheId> <frame> <rockOffset>\n
//! <nBytes raw bytes>
//! ```

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProxyError, Result};

/// Text that follows the format token in an image announcement.
pub const ANNOUNCEMENT_MARKER: &str = " image follows: ";

/// Prefix of the line the backend prints after a PNG payload.
pub const PNG_SENTINEL: &str = " ScenePNG";

/// Prefix of every image header sent to the client.
pub const CLIENT_IMAGE_PREFIX: &str = "nv>image";

/// Prefix of command error replies sent to the client.
pub const CLIENT_ERROR_PREFIX: &str = "nv>error";

/// Upper bound accepted for an announced payload (256 MB).
pub const MAX_IMAGE_SIZE: usize = 256 * 1024 * 1024;

/// Image encodings the backend can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageFormat {
    #[default]
    Bmp,
    Png,
    Ppm,
}

impl ImageFormat {
    /// Token used both in render directives and announcements.
    pub fn token(self) -> &'static str {
        match self {
            ImageFormat::Bmp => "bmp",
            ImageFormat::Png => "png",
            ImageFormat::Ppm => "ppm",
        }
    }

    /// Directive that asks the backend to write the current view to stdout.
    pub fn render_directive(self) -> String {
        format!("{} -\n", self.token())
    }

    /// Announcement prefix to wait for, e.g. `"bmp image follows: "`.
    pub fn announcement_prefix(self) -> String {
        format!("{}{}", self.token(), ANNOUNCEMENT_MARKER)
    }

    /// Trailing line expected after the payload, if any.
    pub fn sentinel(self) -> Option<&'static str> {
        match self {
            ImageFormat::Png => Some(PNG_SENTINEL),
            ImageFormat::Bmp | ImageFormat::Ppm => None,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for ImageFormat {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bmp" => Ok(ImageFormat::Bmp),
            "png" => Ok(ImageFormat::Png),
            "ppm" => Ok(ImageFormat::Ppm),
            other => Err(ProxyError::Config(format!("unknown image format \"{}\"", other))),
        }
    }
}

/// Parse the payload size out of an announcement line.
///
/// The line must start with the announcement prefix for `format`.
pub fn parse_announcement(line: &str, format: ImageFormat) -> Result<usize> {
    let prefix = format.announcement_prefix();
    let rest = line.strip_prefix(&prefix).ok_or_else(|| {
        ProxyError::Protocol(format!("expected \"{}<size>\", got {:?}", prefix, line.trim_end()))
    })?;

    let size: usize = rest.trim().parse().map_err(|_| {
        ProxyError::Protocol(format!("bad image size in announcement {:?}", line.trim_end()))
    })?;

    if size > MAX_IMAGE_SIZE {
        return Err(ProxyError::Protocol(format!(
            "image size {} exceeds maximum {}",
            size, MAX_IMAGE_SIZE
        )));
    }
    Ok(size)
}

/// Identification carried in every client image header.
///
/// The cache id is normally the last loaded structure state; `print` requests echo a
/// client-chosen token in its place.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTag {
    pub cache_id: String,
    pub frame: i64,
    pub rock_offset: f32,
}

impl ImageTag {
    /// Encode the header line for a payload of `len` bytes.
    pub fn header(&self, len: usize) -> String {
        format!(
            "{} {} {} {} {}\n",
            CLIENT_IMAGE_PREFIX, len, self.cache_id, self.frame, self.rock_offset
        )
    }

    /// Header and payload as one contiguous buffer.
    pub fn frame_payload(&self, payload: &[u8]) -> Bytes {
        let header = self.header(payload.len());
        let mut buf = BytesMut::with_capacity(header.len() + payload.len());
        buf.put_slice(header.as_bytes());
        buf.put_slice(payload);
        buf.freeze()
    }
}

/// Encode a command error reply for the client.
pub fn error_line(message: &str) -> Bytes {
    let single = message.replace('\n', " ");
    Bytes::from(format!("{} {}\n", CLIENT_ERROR_PREFIX, single))
}
