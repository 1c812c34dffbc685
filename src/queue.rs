//! Outbound queue toward the client.
//!
//! Every message for the client (images, error replies, the banner) is an
//! opaque byte unit pushed here in production order and written out with
//! non-blocking writes. A unit may take several drain calls to go out; the
//! bytes of one unit never interleave with another.
//!
//! ```text
//! push ─► [newest] ... [oldest] ─► try_write ─► client
//! ```

use std::collections::VecDeque;
use std::io;

use bytes::Bytes;

use crate::error::Result;
use crate::transport::ClientSink;

/// One unit awaiting delivery.
#[derive(Debug)]
pub struct Image {
    data: Bytes,
    bytes_written: usize,
}

impl Image {
    fn new(data: Bytes) -> Self {
        Self {
            data,
            bytes_written: 0,
        }
    }

    /// Bytes not yet delivered.
    #[inline]
    pub fn bytes_left(&self) -> usize {
        self.data.len() - self.bytes_written
    }

    #[inline]
    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    fn remaining(&self) -> &[u8] {
        &self.data[self.bytes_written..]
    }
}

/// Result of a drain attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    /// Everything queued has been delivered.
    Drained,
    /// The client stopped accepting bytes; progress was recorded.
    Blocked,
}

/// FIFO of units awaiting delivery.
#[derive(Debug, Default)]
pub struct ImageQueue {
    images: VecDeque<Image>,
}

impl ImageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a unit after everything already queued.
    pub fn push(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.images.push_back(Image::new(data));
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// Total bytes still to be delivered.
    pub fn pending_bytes(&self) -> usize {
        self.images.iter().map(Image::bytes_left).sum()
    }

    /// The unit currently being delivered, if any.
    pub fn front(&self) -> Option<&Image> {
        self.images.front()
    }

    /// Write as much as the sink accepts without waiting.
    ///
    /// Starts with the oldest unit. A short write or `WouldBlock` records
    /// progress and returns `Blocked`; a write error is returned at once.
    pub fn drain_to<S: ClientSink + ?Sized>(&mut self, sink: &mut S) -> Result<DrainStatus> {
        while let Some(image) = self.images.front_mut() {
            while image.bytes_left() > 0 {
                match sink.try_write(image.remaining()) {
                    Ok(0) => return Ok(DrainStatus::Blocked),
                    Ok(n) => {
                        image.bytes_written += n;
                        if image.bytes_left() > 0 {
                            return Ok(DrainStatus::Blocked);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(DrainStatus::Blocked);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            self.images.pop_front();
        }
        Ok(DrainStatus::Drained)
    }
}
