//! Protocol module - line buffering, command records, and image framing.
//!
//! This module implements the text side of both channels:
//! - Fixed-capacity line buffer tolerant of partial reads
//! - Client command records, including brace groups that span lines
//! - Image announcements from the backend and image headers for the client

mod command;
mod line_buffer;
mod wire_format;

pub use command::{CommandAssembler, CommandRecord, MAX_RECORD_SIZE, split_words};
pub use line_buffer::{
    FillStatus, LineBuffer, LineStatus, ReadMode, DEFAULT_BACKEND_CAPACITY, DEFAULT_CLIENT_CAPACITY,
};
pub use wire_format::{
    error_line, parse_announcement, ImageFormat, ImageTag, ANNOUNCEMENT_MARKER, CLIENT_ERROR_PREFIX,
    CLIENT_IMAGE_PREFIX, MAX_IMAGE_SIZE, PNG_SENTINEL,
};
