//! GPU surface management and DMA-BUF export (second half of C4).
//!
//! Grounded on `src/session/stream/video/pipeline/capture.rs`'s
//! `DmaBufInfo`/`Drop` (dup-then-close-on-drop fd ownership, generalized
//! here from *importing* a DMA-BUF to *exporting* one) and on
//! `examples/other_examples/89770faa_russelltg-wl-screenrec__src-main.rs.rs`
//! for the `gbm`/`drm` render-node open and buffer-object creation pattern.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use drm::control::Device as ControlDevice;
use drm::Device as DrmDevice;
use gbm::{BufferObjectFlags, Device as GbmDevice, Format};

use crate::error::{Error, Result};
use crate::video::convert::Nv12Frame;

/// Geometry of the currently exported surface, mirrored into the VIDEO PDU.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceGeometry {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub size: u32,
    pub bpp: u32,
}

struct CardFd(File);

impl AsFd for CardFd {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.0.as_fd()
    }
}
impl DrmDevice for CardFd {}
impl ControlDevice for CardFd {}

/// Owns the GPU render-node device and the current NV12 buffer object. At
/// most one buffer object is live at a time; a dimension change drops the
/// old one before creating a new one, as spec.md §4.4 requires.
pub struct GpuSurface {
    gbm: GbmDevice<CardFd>,
    bo: Option<gbm::BufferObject<()>>,
    geometry: Option<SurfaceGeometry>,
    exported_fd: Option<OwnedFd>,
}

impl GpuSurface {
    /// Open the GPU render node (default `/dev/dri/renderD128`, per
    /// spec.md §6) and initialize the GBM device context.
    pub fn open(render_node: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(render_node)
            .map_err(Error::Io)?;
        let gbm = GbmDevice::new(CardFd(file)).map_err(|_| Error::Create)?;
        Ok(Self { gbm, bo: None, geometry: None, exported_fd: None })
    }

    /// Ensure a buffer object of exactly `(width, height)` exists, creating
    /// (and discarding any previous one) if dimensions differ. Returns
    /// `true` if a new surface was (re)created, signaling the caller to
    /// reset `video_frame_count` to 0 per spec.md §4.4.
    pub fn ensure_surface(&mut self, width: u32, height: u32) -> Result<bool> {
        if let Some(geometry) = self.geometry {
            if geometry.width == width && geometry.height == height {
                return Ok(false);
            }
        }
        let bo = self
            .gbm
            .create_buffer_object::<()>(
                width,
                height,
                Format::Nv12,
                BufferObjectFlags::LINEAR | BufferObjectFlags::RENDERING,
            )
            .map_err(|_| Error::Create)?;
        let stride = bo.stride().map_err(|_| Error::Create)?;
        let bpp = 12;
        let size = stride * height * bpp / 8;
        self.bo = Some(bo);
        self.geometry = Some(SurfaceGeometry { width, height, stride, size, bpp });
        Ok(true)
    }

    /// Upload Y and UV planes, truncating each row to the lesser of the
    /// logical width and the plane's stride, per spec.md §4.4.
    pub fn upload(&mut self, frame: &Nv12Frame) -> Result<()> {
        let bo = self.bo.as_mut().ok_or(Error::NotReady)?;
        let stride = bo.stride().map_err(|_| Error::Create)? as usize;
        let row_bytes = (frame.width as usize).min(stride);

        let mut combined = vec![0u8; stride * frame.height as usize + stride * (frame.height as usize / 2)];
        for row in 0..frame.height as usize {
            let src = &frame.y[row * frame.width as usize..row * frame.width as usize + row_bytes];
            let dst_off = row * stride;
            combined[dst_off..dst_off + row_bytes].copy_from_slice(src);
        }
        let uv_base = stride * frame.height as usize;
        for row in 0..(frame.height as usize / 2) {
            let src = &frame.uv[row * frame.width as usize..row * frame.width as usize + row_bytes];
            let dst_off = uv_base + row * stride;
            combined[dst_off..dst_off + row_bytes].copy_from_slice(src);
        }

        bo.write(&combined).map_err(|_| Error::Create)?;
        Ok(())
    }

    /// Export the current buffer object as a DMA-BUF fd, closing any
    /// previously exported fd owned by this surface first.
    pub fn export(&mut self, ts_ms: u64) -> Result<(OwnedFd, SurfaceGeometry, u64)> {
        let bo = self.bo.as_ref().ok_or(Error::NotReady)?;
        let geometry = self.geometry.ok_or(Error::NotReady)?;

        let prime_fd = bo.fd().map_err(|_| Error::Fd)?;
        self.exported_fd = None; // drop (close) the previous export, if any

        let dup = prime_fd.try_clone().map_err(Error::Io)?;
        self.exported_fd = Some(prime_fd);
        let _ = ts_ms;
        Ok((dup, geometry, ts_ms))
    }

    pub fn geometry(&self) -> Option<SurfaceGeometry> {
        self.geometry
    }
}
