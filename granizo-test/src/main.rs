// A small X client that drives granizo the way a window manager would
//
// Opens a window, draws a pixmap into it, and bounces that pixmap
// around over a solid background. Damage is tracked with buffer ages
// so only the parts that changed get repainted.
//
// Usage: granizo-test [frames]
//
// Austin Shafer - 2024
extern crate granizo as gr;
use gr::{Backend, Color, CreateInfo, GranizoError, Rect, Region, VisualInfo, VulkanBackend};

extern crate utils;
use utils::{log, Result};

use x11rb::connection::Connection;
use x11rb::protocol::xproto::{
    ConnectionExt as _, CreateGCAux, CreateWindowAux, EventMask, Rectangle, WindowClass,
};
use x11rb::protocol::Event;
use x11rb::COPY_DEPTH_FROM_PARENT;

use tracing_subscriber::EnvFilter;

use std::collections::VecDeque;
use std::sync::Arc;

const WINDOW_SIZE: (u16, u16) = (800, 600);
const PIXMAP_SIZE: u16 = 128;
const STEP: i32 = 4;

fn initialise_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// The last few frames' damage, newest first
struct DamageHistory {
    dh_frames: VecDeque<Rect<i32>>,
}

impl DamageHistory {
    fn new() -> Self {
        Self {
            dh_frames: VecDeque::new(),
        }
    }

    fn push(&mut self, rects: &[Rect<i32>]) {
        for r in rects.iter() {
            self.dh_frames.push_front(*r);
        }
        // two rects a frame
        self.dh_frames.truncate(2 * gr::MAX_BUFFER_AGE as usize);
    }

    /// What needs to be repainted into a buffer of `age`
    ///
    /// The old and new positions overlap, so this is their bounding box
    /// rather than the rects themselves.
    fn region(&self, age: i32, full: Rect<i32>) -> Region {
        if age <= 0 || age > gr::MAX_BUFFER_AGE || self.dh_frames.len() < 2 * age as usize {
            return Region::from_rects(&[full]);
        }

        let mut ret = Region::new();
        for r in self.dh_frames.iter().take(2 * age as usize) {
            ret.add(*r);
        }
        match ret.extents().and_then(|e| e.intersection(&full)) {
            Some(bounds) => Region::from_rects(&[bounds]),
            None => Region::new(),
        }
    }
}

fn main() -> Result<()> {
    initialise_tracing();

    let frames: u32 = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 600,
    };

    // ----------- X setup
    let (conn, screen_num) = x11rb::connect(None)?;
    let conn = Arc::new(conn);
    let screen = &conn.setup().roots[screen_num];
    let root_depth = screen.root_depth;

    let win = conn.generate_id()?;
    conn.create_window(
        COPY_DEPTH_FROM_PARENT,
        win,
        screen.root,
        0,
        0,
        WINDOW_SIZE.0,
        WINDOW_SIZE.1,
        0,
        WindowClass::INPUT_OUTPUT,
        0,
        &CreateWindowAux::new()
            .background_pixel(screen.black_pixel)
            .event_mask(EventMask::STRUCTURE_NOTIFY),
    )?;
    conn.map_window(win)?;

    // ----------- the pixmap we bounce around
    let pixmap = conn.generate_id()?;
    conn.create_pixmap(root_depth, pixmap, win, PIXMAP_SIZE, PIXMAP_SIZE)?;
    let gc = conn.generate_id()?;
    conn.create_gc(gc, pixmap, &CreateGCAux::new().foreground(0x3080c0))?;
    conn.poly_fill_rectangle(
        pixmap,
        gc,
        &[Rectangle {
            x: 0,
            y: 0,
            width: PIXMAP_SIZE,
            height: PIXMAP_SIZE,
        }],
    )?;
    conn.free_gc(gc)?;
    // round trip so the server has drawn it before we import it
    conn.get_input_focus()?.reply()?;

    // ----------- granizo
    let info = CreateInfo::builder()
        .vsync(true)
        .screen(screen_num)
        .build();
    let mut backend = VulkanBackend::new(conn.clone(), win, &info)?;
    log::info!("Using the {} import strategy", backend.strategy());

    // the pixmap is freed when its image is released
    let img = backend.bind_pixmap(pixmap, VisualInfo { alpha_size: 0 }, true)?;
    let (iw, ih) = backend.image_size(img)?;

    let mut ws = backend.size();
    let mut pos = (0, 0);
    let mut delta = (STEP, STEP);
    let mut history = DamageHistory::new();
    let background = Color::new(0.1, 0.1, 0.1, 1.0);

    // ----------- the frame loop
    let mut drawn = 0;
    while drawn < frames {
        while let Some(event) = conn.poll_for_event()? {
            if let Event::ConfigureNotify(ev) = event {
                if (ev.width as u32, ev.height as u32) != ws {
                    backend.recreate_swapchain(info.vsync)?;
                    ws = backend.size();
                    history = DamageHistory::new();
                }
            }
        }

        // ----------- move the pixmap
        let old = Rect::new(pos.0, pos.1, iw as i32, ih as i32);
        if pos.0 + delta.0 < 0 || pos.0 + delta.0 + iw as i32 > ws.0 as i32 {
            delta.0 = -delta.0;
        }
        if pos.1 + delta.1 < 0 || pos.1 + delta.1 + ih as i32 > ws.1 as i32 {
            delta.1 = -delta.1;
        }
        pos = (pos.0 + delta.0, pos.1 + delta.1);
        let new = Rect::new(pos.0, pos.1, iw as i32, ih as i32);
        history.push(&[new, old]);

        // ----------- draw it
        let full = Rect::new(0, 0, ws.0 as i32, ws.1 as i32);
        let damage = history.region(backend.buffer_age(), full);

        backend.prepare(&damage)?;
        backend.fill(background, &damage)?;
        // the sampler repeats, so only paint where the pixmap is
        backend.compose(img, pos, &damage.intersect(&new))?;
        match backend.present(&damage) {
            Ok(()) => drawn += 1,
            Err(GranizoError::FRAME_DROPPED) => log::debug!("Frame dropped"),
            Err(GranizoError::OUT_OF_DATE) => {
                backend.recreate_swapchain(info.vsync)?;
                ws = backend.size();
                history = DamageHistory::new();
            }
            Err(e) => return Err(e.into()),
        }
    }

    backend.release_image(img)?;
    backend.deinit();
    conn.destroy_window(win)?;
    conn.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: Rect<i32> = Rect {
        r_pos: (0, 0),
        r_size: (800, 600),
    };

    #[test]
    fn unknown_age_repaints_everything() {
        let mut history = DamageHistory::new();
        assert_eq!(history.region(1, FULL).rects(), &[FULL]);

        history.push(&[Rect::new(4, 4, 128, 128), Rect::new(0, 0, 128, 128)]);
        assert_eq!(history.region(-1, FULL).rects(), &[FULL]);
        assert_eq!(history.region(2, FULL).rects(), &[FULL]);
    }

    #[test]
    fn damage_is_one_rect() {
        let mut history = DamageHistory::new();
        history.push(&[Rect::new(4, 4, 128, 128), Rect::new(0, 0, 128, 128)]);
        history.push(&[Rect::new(8, 8, 128, 128), Rect::new(4, 4, 128, 128)]);

        assert_eq!(
            history.region(1, FULL).rects(),
            &[Rect::from_corners(4, 4, 136, 136)]
        );
        assert_eq!(
            history.region(2, FULL).rects(),
            &[Rect::from_corners(0, 0, 136, 136)]
        );
    }

    #[test]
    fn pixmap_painted_only_where_it_is() {
        let mut history = DamageHistory::new();
        let new = Rect::new(8, 8, 128, 128);
        history.push(&[new, Rect::new(4, 4, 128, 128)]);

        let paint = history.region(1, FULL).intersect(&new);
        assert_eq!(paint.rects(), &[new]);
    }
}
