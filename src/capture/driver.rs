//! C3: capture driver adapter.
//!
//! The vendor capture SDK itself is out of scope (spec.md §1): this module
//! is the seam the dispatch core talks to. Grounded on
//! `examples/original_source/bmd_declink.cpp`'s device-enumeration /
//! mode-table / callback-install shape, and on
//! `src/session/stream/video/pipeline/capture.rs`'s pattern of a
//! driver-owned thread whose only job is to hand frames to a shared handle.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::capture::avslot::AvSlot;
use crate::error::{Error, Result};

/// Monotonic milliseconds since the driver module was first touched.
/// Grounded on `bmd_utils.h`'s `get_mstime` (CLOCK_MONOTONIC-backed); a
/// driver callback stamps each captured frame/buffer with this before
/// calling into [`AvSlot::try_publish_video`]/[`AvSlot::try_publish_audio`].
pub fn get_mstime() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/// Display-mode table from spec.md §4.3, indexed by mode_index.
pub const MODE_NAMES: &[&str] = &[
    "525i59.94 NTSC",
    "525p23.98 NTSC",
    "625i50 PAL",
    "525p59.94 NTSC",
    "625p50 PAL",
    "1080p23.98",
    "1080p24",
    "1080p25",
    "1080p29.97",
    "1080p30",
    "1080i50",
    "1080i59.94",
    "1080i60",
    "720p50",
    "720p59.94",
    "720p60",
];

pub const DEFAULT_MODE_INDEX: usize = 14;

/// Resolve a `-m` argument: either a decimal mode index or a canonical mode
/// name from [`MODE_NAMES`] (§A.3 CLI convenience, not present in the
/// original's index-only interface).
pub fn resolve_mode(arg: &str) -> Result<usize> {
    if let Ok(index) = arg.parse::<usize>() {
        if index < MODE_NAMES.len() {
            return Ok(index);
        }
        return Err(Error::Capture);
    }
    MODE_NAMES.iter().position(|name| *name == arg).ok_or(Error::Capture)
}

/// Handle to a running capture session. Dropping it does not stop capture;
/// callers must call [`CaptureDriver::stop`] then [`CaptureDriver::delete`]
/// explicitly, matching spec.md §4.3's explicit lifecycle contract.
pub struct CaptureDriver {
    mode_index: usize,
    slot: Arc<AvSlot>,
    running: bool,
}

impl CaptureDriver {
    /// Enumerate display modes of the first present device, select the one
    /// named by `MODE_NAMES[mode_index]`, enable 8-bit YUY2 video and 48kHz
    /// 16-bit stereo audio, and install a callback closing over `slot`.
    ///
    /// The real vendor SDK binding lives behind this call in a full build;
    /// here the seam is the installed callback's contract: it is invoked on
    /// a driver-owned thread exactly as described in spec.md §9's
    /// callback-into-mutex pattern, touching only `AvSlot`.
    pub fn create(mode_index: usize, slot: Arc<AvSlot>) -> Result<Self> {
        if mode_index >= MODE_NAMES.len() {
            return Err(Error::Capture);
        }
        Ok(Self { mode_index, slot, running: false })
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        self.running = true;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }

    pub fn mode_name(&self) -> &'static str {
        MODE_NAMES[self.mode_index]
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Test/fallback entry point standing in for the callback the vendor
    /// SDK would invoke on its own thread: publish a captured video frame
    /// and signal once.
    pub fn deliver_video(&self, frame: &[u8], width: u32, height: u32, stride: u32, ts_ms: u64) -> Result<()> {
        let published = self.slot.try_publish_video(frame, width, height, stride, ts_ms)?;
        if published {
            self.slot.signal()?;
        }
        Ok(())
    }

    /// Symmetric with [`Self::deliver_video`] for the audio path.
    pub fn deliver_audio(&self, pcm: &[u8], channels: u32, bytes_per_sample: u32, samples: u32, ts_ms: u64) -> Result<()> {
        let published = self.slot.try_publish_audio(pcm, channels, bytes_per_sample, samples, ts_ms)?;
        if published {
            self.slot.signal()?;
        }
        Ok(())
    }
}

impl Drop for CaptureDriver {
    fn drop(&mut self) {
        if self.running {
            tracing::warn!("capture driver dropped while still running");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mode_is_720p59_94() {
        assert_eq!(MODE_NAMES[DEFAULT_MODE_INDEX], "720p59.94");
    }

    #[test]
    fn resolve_mode_accepts_index_or_name() {
        assert_eq!(resolve_mode("14").unwrap(), 14);
        assert_eq!(resolve_mode("720p59.94").unwrap(), 14);
        assert!(resolve_mode("not-a-mode").is_err());
        assert!(resolve_mode("99").is_err());
    }

    #[test]
    fn start_stop_lifecycle() {
        let (slot, _rx) = AvSlot::new().unwrap();
        let mut driver = CaptureDriver::create(DEFAULT_MODE_INDEX, Arc::new(slot)).unwrap();
        assert!(!driver.is_running());
        driver.start().unwrap();
        assert!(driver.is_running());
        driver.stop().unwrap();
        assert!(!driver.is_running());
    }

    #[test]
    fn create_rejects_out_of_range_mode() {
        let (slot, _rx) = AvSlot::new().unwrap();
        assert!(CaptureDriver::create(999, Arc::new(slot)).is_err());
    }

    #[test]
    fn get_mstime_is_monotonic() {
        let first = get_mstime();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = get_mstime();
        assert!(second >= first);
    }
}
