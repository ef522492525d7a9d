// The X server side of pixmap import
//
// Everything we need to ask the X server for lives here: which
// extensions it has, dmabufs for pixmaps, pixmap sizes, and the
// MIT-SHM segment management and readback.
//
// Austin Shafer - 2024
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::dri3::{self, ConnectionExt as _};
use x11rb::protocol::shm::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{self, ConnectionExt as _};
use x11rb::rust_connection::RustConnection;

use crate::platform::ServerCaps;
use crate::{GranizoError, Rect, Result};
use utils::log;

use std::os::unix::io::{FromRawFd, IntoRawFd, OwnedFd};
use std::sync::Arc;

/// buffers_from_pixmap showed up in DRI3 1.2
const DRI3_MAJOR: u32 = 1;
const DRI3_MINOR: u32 = 2;

/// The single dmabuf plane backing a pixmap
#[derive(Debug)]
pub struct PixmapBuffer {
    pub pb_width: u16,
    pub pb_height: u16,
    pub pb_offset: u32,
    pub pb_stride: u32,
    pub pb_modifier: u64,
    pub pb_fd: OwnedFd,
}

/// Our handle on the X server
///
/// This wraps the window manager's connection. It is shared with every
/// bound image, since releasing an image may have to detach a segment
/// or free the pixmap.
pub struct XServer {
    xs_conn: Arc<RustConnection>,
    /// The root visual of our screen. Used to check that a queue family
    /// can present to windows on this screen.
    xs_root_visual: xproto::Visualid,
}

impl XServer {
    pub fn new(conn: Arc<RustConnection>, screen: usize) -> Result<Self> {
        let root_visual = match conn.setup().roots.get(screen) {
            Some(s) => s.root_visual,
            None => {
                log::error!("X screen {} does not exist", screen);
                return Err(GranizoError::INIT_FAILED);
            }
        };

        Ok(Self {
            xs_conn: conn,
            xs_root_visual: root_visual,
        })
    }

    pub fn root_visual(&self) -> xproto::Visualid {
        self.xs_root_visual
    }

    fn has_extension(&self, name: &'static str) -> bool {
        match self.xs_conn.extension_information(name) {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                log::error!("Could not query X extension {}: {:?}", name, e);
                false
            }
        }
    }

    fn dri3_usable(&self) -> bool {
        if !self.has_extension(dri3::X11_EXTENSION_NAME) {
            return false;
        }

        let version = self
            .xs_conn
            .dri3_query_version(DRI3_MAJOR, DRI3_MINOR)
            .ok()
            .and_then(|cookie| cookie.reply().ok());

        match version {
            Some(v) if v.major_version > DRI3_MAJOR
                || (v.major_version == DRI3_MAJOR && v.minor_version >= DRI3_MINOR) =>
            {
                true
            }
            Some(v) => {
                log::info!(
                    "X server only has DRI3 {}.{}, need {}.{}",
                    v.major_version,
                    v.minor_version,
                    DRI3_MAJOR,
                    DRI3_MINOR
                );
                false
            }
            None => false,
        }
    }

    /// Which pixmap import extensions does the server support
    pub fn caps(&self) -> ServerCaps {
        ServerCaps {
            sc_dri3: self.dri3_usable(),
            sc_shm: self.has_extension(shm::X11_EXTENSION_NAME),
        }
    }

    /// Get the dmabuf backing a pixmap
    ///
    /// Only single plane buffers are handled, anything else is a bind
    /// failure.
    pub fn buffers_from_pixmap(&self, pixmap: xproto::Pixmap) -> Result<PixmapBuffer> {
        let reply = self
            .xs_conn
            .dri3_buffers_from_pixmap(pixmap)
            .map_err(|e| {
                log::error!("Failed to get buffers from pixmap: {:?}", e);
                GranizoError::X_REQUEST_FAILED
            })?
            .reply()
            .map_err(|e| {
                log::error!("Failed to get buffers from pixmap: {:?}", e);
                GranizoError::X_REQUEST_FAILED
            })?;

        if reply.buffers.len() != 1 || reply.offsets.is_empty() || reply.strides.is_empty() {
            log::error!(
                "Pixmap {:#08x} has {} planes, only single plane pixmaps can be imported",
                pixmap,
                reply.buffers.len()
            );
            return Err(GranizoError::BIND_FAILED);
        }

        let mut buffers = reply.buffers;
        let fd = match buffers.pop() {
            Some(fd) => unsafe { OwnedFd::from_raw_fd(fd.into_raw_fd()) },
            None => return Err(GranizoError::INVALID_FD),
        };

        Ok(PixmapBuffer {
            pb_width: reply.width,
            pb_height: reply.height,
            pb_offset: reply.offsets[0],
            pb_stride: reply.strides[0],
            pb_modifier: reply.modifier,
            pb_fd: fd,
        })
    }

    /// Get the (width, height) of a drawable
    pub fn geometry(&self, drawable: xproto::Drawable) -> Result<(u16, u16)> {
        let reply = self
            .xs_conn
            .get_geometry(drawable)
            .map_err(|e| {
                log::error!("Failed to get geometry: {:?}", e);
                GranizoError::X_REQUEST_FAILED
            })?
            .reply()
            .map_err(|e| {
                log::error!("Failed to get geometry: {:?}", e);
                GranizoError::X_REQUEST_FAILED
            })?;

        Ok((reply.width, reply.height))
    }

    /// Register a System V segment with the server
    ///
    /// Returns the server side segment id, which must later be passed
    /// to `shm_detach`.
    pub fn shm_attach(&self, shmid: i32) -> Result<shm::Seg> {
        let seg = self.xs_conn.generate_id().map_err(|e| {
            log::error!("Failed to allocate shared memory segment id: {:?}", e);
            GranizoError::SHARED_MEMORY_FAILED
        })?;

        self.xs_conn
            .shm_attach(seg, shmid as u32, false)
            .map_err(|e| {
                log::error!("Failed to attach shared memory segment: {:?}", e);
                GranizoError::SHARED_MEMORY_FAILED
            })?
            .check()
            .map_err(|e| {
                log::error!("Failed to attach shared memory segment: {:?}", e);
                GranizoError::SHARED_MEMORY_FAILED
            })?;

        Ok(seg)
    }

    pub fn shm_detach(&self, seg: shm::Seg) {
        if let Err(e) = self.xs_conn.shm_detach(seg) {
            log::error!("Failed to detach shared memory segment {}: {:?}", seg, e);
        }
        let _ = self.xs_conn.flush();
    }

    /// Read `rect` of `pixmap` into segment `seg` at byte `offset`
    ///
    /// This waits for the reply, so the data is in the segment once
    /// this returns.
    pub fn shm_get_image(
        &self,
        pixmap: xproto::Pixmap,
        rect: &Rect<i32>,
        seg: shm::Seg,
        offset: u32,
    ) -> Result<()> {
        self.xs_conn
            .shm_get_image(
                pixmap,
                rect.r_pos.0 as i16,
                rect.r_pos.1 as i16,
                rect.r_size.0 as u16,
                rect.r_size.1 as u16,
                u32::MAX,
                xproto::ImageFormat::Z_PIXMAP.into(),
                seg,
                offset,
            )
            .map_err(|e| {
                log::error!("Failed to read image data into shared memory image: {:?}", e);
                GranizoError::X_REQUEST_FAILED
            })?
            .reply()
            .map_err(|e| {
                log::error!("Failed to read image data into shared memory image: {:?}", e);
                GranizoError::X_REQUEST_FAILED
            })?;

        Ok(())
    }

    pub fn free_pixmap(&self, pixmap: xproto::Pixmap) {
        if let Err(e) = self.xs_conn.free_pixmap(pixmap) {
            log::error!("Failed to free pixmap {:#08x}: {:?}", pixmap, e);
        }
        let _ = self.xs_conn.flush();
    }
}
