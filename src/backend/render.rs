//! Render exchange: ask the backend for an image and queue it for the client.

use bytes::Bytes;

use super::directive::{Directive, DirectiveChannel};
use crate::error::Result;
use crate::protocol::{ImageFormat, ImageTag, parse_announcement};
use crate::queue::ImageQueue;
use crate::session::ProxySession;

/// What to render and how to label it.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub format: ImageFormat,
    pub directive: Directive,
    /// Fixed tag for the client header. `None` tags the image with the
    /// session's current cache id, frame and rock offset.
    pub tag: Option<ImageTag>,
}

impl RenderRequest {
    /// Render of the current view.
    pub fn current(format: ImageFormat) -> Self {
        Self {
            format,
            directive: Directive::new(format.render_directive()),
            tag: None,
        }
    }

    /// Render with a custom directive and a fixed tag.
    pub fn tagged(format: ImageFormat, directive: Directive, tag: ImageTag) -> Self {
        Self {
            format,
            directive,
            tag: Some(tag),
        }
    }
}

/// A rendered image and the tag it travels under.
#[derive(Debug, Clone)]
pub struct RenderedImage {
    pub tag: ImageTag,
    pub payload: Bytes,
}

impl RenderedImage {
    /// Header and payload as one client queue unit.
    pub fn framed(&self) -> Bytes {
        self.tag.frame_payload(&self.payload)
    }
}

/// Run one render exchange.
///
/// Waits for the announcement, reads exactly the announced number of bytes,
/// then matches the format's trailing sentinel if it has one.
pub async fn render(
    session: &mut ProxySession,
    channel: &mut DirectiveChannel,
    request: &RenderRequest,
) -> Result<RenderedImage> {
    let tag = match &request.tag {
        Some(tag) => tag.clone(),
        None => {
            if session.take_cache_invalidation() {
                tracing::trace!("view changed since the last image");
            }
            session.image_tag()
        }
    };

    let prefix = request.format.announcement_prefix();
    let announcement = channel.send(session, &request.directive, &prefix).await?;
    let size = match parse_announcement(&announcement, request.format) {
        Ok(size) => size,
        Err(e) => {
            session.fault.set(e.to_string());
            return Err(e);
        }
    };

    let payload = channel.read_exactly(session, size).await?;
    if let Some(sentinel) = request.format.sentinel() {
        channel.expect(session, sentinel).await?;
    }

    tracing::debug!(
        "rendered {} image: {} bytes, cache id {}, frame {}",
        request.format,
        size,
        tag.cache_id,
        tag.frame
    );
    Ok(RenderedImage { tag, payload })
}

/// Render and push the framed result onto the client queue.
pub async fn render_into(
    session: &mut ProxySession,
    channel: &mut DirectiveChannel,
    queue: &mut ImageQueue,
    request: &RenderRequest,
) -> Result<()> {
    let image = render(session, channel, request).await?;
    session.stats.record_frame(image.payload.len());
    queue.push(image.framed());
    Ok(())
}
