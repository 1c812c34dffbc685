//! Coalescing of view changes.
//!
//! Interactive clients send many small view events between two renders.
//! They are folded into [`PendingView`](crate::session::PendingView) here and
//! turned into at most one directive per category when the loop flushes:
//! rotation and pan deltas are summed, the other settings keep the last
//! value written.
//!
//! Flush order is fixed: viewport, rotation, pan, zoom, atom scale, stick
//! radius.

use crate::backend::{Directive, DirectiveChannel};
use crate::error::Result;
use crate::session::{PendingFlags, ProxySession};

impl ProxySession {
    pub fn accumulate_rotate(&mut self, dx: f32, dy: f32, dz: f32) {
        let rotate = &mut self.view.rotate;
        rotate[0] += dx;
        rotate[1] += dy;
        rotate[2] += dz;
        self.flags.insert(PendingFlags::ROTATE_PENDING);
    }

    pub fn accumulate_pan(&mut self, dx: f32, dy: f32) {
        self.view.pan[0] += dx;
        self.view.pan[1] += dy;
        self.flags.insert(PendingFlags::PAN_PENDING);
    }

    pub fn set_zoom(&mut self, factor: f32) {
        self.view.zoom = factor;
        self.flags.insert(PendingFlags::ZOOM_PENDING);
    }

    pub fn set_sphere_scale(&mut self, scale: f32) {
        self.view.sphere_scale = scale;
        self.flags.insert(PendingFlags::ATOM_SCALE_PENDING);
    }

    pub fn set_stick_radius(&mut self, radius: f32) {
        self.view.stick_radius = radius;
        self.flags.insert(PendingFlags::STICK_RADIUS_PENDING);
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) {
        self.view.viewport = (width, height);
        self.flags.insert(PendingFlags::VIEWPORT_PENDING);
    }
}

/// Drain every pending category into its directive, in flush order.
///
/// Clears the category flags and resets the summed deltas.
pub fn pending_directives(session: &mut ProxySession) -> Vec<Directive> {
    let mut directives = Vec::new();
    let view = &mut session.view;
    let flags = &mut session.flags;

    if flags.contains(PendingFlags::VIEWPORT_PENDING) {
        let (w, h) = view.viewport;
        directives.push(Directive::compound([format!("viewport {},{}", w, h), "refresh".into()]));
    }
    if flags.contains(PendingFlags::ROTATE_PENDING) {
        let [x, y, z] = view.rotate;
        directives.push(Directive::compound([
            format!("turn x,{:.6}", x),
            format!("turn y,{:.6}", y),
            format!("turn z,{:.6}", z),
        ]));
        view.rotate = [0.0; 3];
    }
    if flags.contains(PendingFlags::PAN_PENDING) {
        let [x, y] = view.pan;
        directives.push(Directive::compound([
            format!("move x,{:.6}", x),
            format!("move y,{:.6}", y),
        ]));
        view.pan = [0.0; 2];
    }
    if flags.contains(PendingFlags::ZOOM_PENDING) {
        directives.push(Directive::new(format!("move z,{:.6}", view.zoom)));
        view.zoom = 0.0;
    }
    if flags.contains(PendingFlags::ATOM_SCALE_PENDING) {
        directives.push(Directive::new(format!("set sphere_scale,{:.6},all", view.sphere_scale)));
    }
    if flags.contains(PendingFlags::STICK_RADIUS_PENDING) {
        directives.push(Directive::new(format!("set stick_radius,{:.6},all", view.stick_radius)));
    }

    flags.remove(
        PendingFlags::VIEWPORT_PENDING
            | PendingFlags::ROTATE_PENDING
            | PendingFlags::PAN_PENDING
            | PendingFlags::ZOOM_PENDING
            | PendingFlags::ATOM_SCALE_PENDING
            | PendingFlags::STICK_RADIUS_PENDING,
    );
    directives
}

/// Send all pending view changes to the backend.
///
/// Returns the number of directives sent. Stops at the first failure; the
/// categories drained before it are not retried.
pub async fn flush(session: &mut ProxySession, channel: &mut DirectiveChannel) -> Result<usize> {
    let directives = pending_directives(session);
    for directive in &directives {
        channel.send_directive(session, directive).await?;
    }
    Ok(directives.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(directives: &[Directive]) -> Vec<String> {
        directives.iter().map(|d| d.to_string()).collect()
    }

    #[test]
    fn test_rotations_sum_into_one_directive() {
        let mut session = ProxySession::new();
        for _ in 0..3 {
            session.accumulate_rotate(1.0, 0.0, 0.0);
        }

        let directives = pending_directives(&mut session);
        assert_eq!(
            texts(&directives),
            vec!["turn x,3.000000;turn y,0.000000;turn z,0.000000"]
        );
        assert_eq!(session.view.rotate, [0.0; 3]);
        assert!(!session.flags.contains(PendingFlags::ROTATE_PENDING));
    }

    #[test]
    fn test_flush_order_is_fixed() {
        let mut session = ProxySession::new();
        session.set_stick_radius(0.3);
        session.set_zoom(-2.0);
        session.accumulate_pan(0.5, -0.25);
        session.set_sphere_scale(0.4);
        session.accumulate_rotate(0.0, 90.0, 0.0);
        session.set_viewport(800, 600);

        let directives = pending_directives(&mut session);
        assert_eq!(
            texts(&directives),
            vec![
                "viewport 800,600;refresh",
                "turn x,0.000000;turn y,90.000000;turn z,0.000000",
                "move x,0.500000;move y,-0.250000",
                "move z,-2.000000",
                "set sphere_scale,0.400000,all",
                "set stick_radius,0.300000,all",
            ]
        );
    }

    #[test]
    fn test_nothing_pending_is_noop() {
        let mut session = ProxySession::new();
        assert!(pending_directives(&mut session).is_empty());
        assert_eq!(session.flags, PendingFlags::CAN_UPDATE);
    }

    #[test]
    fn test_last_zoom_wins() {
        let mut session = ProxySession::new();
        session.set_zoom(1.0);
        session.set_zoom(4.0);
        assert_eq!(texts(&pending_directives(&mut session)), vec!["move z,4.000000"]);
        assert!(pending_directives(&mut session).is_empty());
    }
}
