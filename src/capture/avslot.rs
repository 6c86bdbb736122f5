//! C2: the single-slot A/V mailbox between the capture callback thread and
//! the loop thread.
//!
//! Grounded on spec.md §4.2 and the capture-thread/loop handoff shape in
//! `src/session/stream/video/pipeline/capture.rs` (teacher's mpsc-channel
//! capture-to-pipeline handoff), generalized from a channel to a
//! mutex-guarded single slot per spec.md's explicit "why a single slot, not
//! a queue" design note.

use std::io::Write;
use std::sync::Mutex;

use mio::unix::pipe;

use crate::error::{Error, Result};

/// One captured video frame, still in source (YUY2) pixel format.
#[derive(Debug, Clone)]
pub struct VideoOut {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub ts_ms: u64,
}

/// One captured audio buffer, interleaved PCM.
#[derive(Debug, Clone)]
pub struct AudioOut {
    pub data: Vec<u8>,
    pub channels: u32,
    pub bytes_per_sample: u32,
    pub samples: u32,
    pub ts_ms: u64,
}

struct VideoSlot {
    got: bool,
    width: u32,
    height: u32,
    stride: u32,
    ts_ms: u64,
    buf: Vec<u8>,
}

impl VideoSlot {
    fn empty() -> Self {
        Self { got: false, width: 0, height: 0, stride: 0, ts_ms: 0, buf: Vec::new() }
    }
}

struct AudioSlot {
    got: bool,
    channels: u32,
    bytes_per_sample: u32,
    samples: u32,
    ts_ms: u64,
    buf: Vec<u8>,
}

impl AudioSlot {
    fn empty() -> Self {
        Self { got: false, channels: 0, bytes_per_sample: 0, samples: 0, ts_ms: 0, buf: Vec::new() }
    }
}

struct Inner {
    video: VideoSlot,
    audio: AudioSlot,
}

/// The mailbox itself. `signal_write` is the write end of a self-pipe shared
/// with the loop thread; the loop thread owns the read end (registered with
/// `mio::Poll`) and is handed it separately at construction.
pub struct AvSlot {
    inner: Mutex<Inner>,
    signal_write: Mutex<pipe::Sender>,
}

impl AvSlot {
    /// Create a new slot plus its self-pipe. Returns the slot (to be shared,
    /// typically via `Arc`, with the capture driver's callback) and the
    /// read end of the pipe (to be registered with the loop's `mio::Poll`).
    pub fn new() -> Result<(Self, pipe::Receiver)> {
        let (sender, receiver) = pipe::new()?;
        let slot = Self {
            inner: Mutex::new(Inner { video: VideoSlot::empty(), audio: AudioSlot::empty() }),
            signal_write: Mutex::new(sender),
        };
        Ok((slot, receiver))
    }

    /// Publish one video frame. Returns `Ok(true)` if stored, `Ok(false)` if
    /// dropped because the previous frame has not yet been consumed.
    pub fn try_publish_video(&self, frame: &[u8], width: u32, height: u32, stride: u32, ts_ms: u64) -> Result<bool> {
        let mut inner = self.inner.lock().map_err(|_| Error::Mutex)?;
        if inner.video.got {
            return Ok(false);
        }
        let slot = &mut inner.video;
        if slot.buf.len() < frame.len() {
            slot.buf.resize(frame.len(), 0);
        }
        slot.buf[..frame.len()].copy_from_slice(frame);
        slot.buf.truncate(frame.len());
        slot.width = width;
        slot.height = height;
        slot.stride = stride;
        slot.ts_ms = ts_ms;
        slot.got = true;
        Ok(true)
    }

    /// Publish one audio buffer. Symmetric with [`Self::try_publish_video`].
    pub fn try_publish_audio(
        &self,
        pcm: &[u8],
        channels: u32,
        bytes_per_sample: u32,
        samples: u32,
        ts_ms: u64,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().map_err(|_| Error::Mutex)?;
        if inner.audio.got {
            return Ok(false);
        }
        let slot = &mut inner.audio;
        if slot.buf.len() < pcm.len() {
            slot.buf.resize(pcm.len(), 0);
        }
        slot.buf[..pcm.len()].copy_from_slice(pcm);
        slot.buf.truncate(pcm.len());
        slot.channels = channels;
        slot.bytes_per_sample = bytes_per_sample;
        slot.samples = samples;
        slot.ts_ms = ts_ms;
        slot.got = true;
        Ok(true)
    }

    /// Write exactly one 4-byte token to the self-pipe. Called at most once
    /// per capture callback invocation, after any successful publish(es).
    /// Never called while the slot's mutex is held.
    pub fn signal(&self) -> Result<()> {
        let mut w = self.signal_write.lock().map_err(|_| Error::Mutex)?;
        w.write_all(&[0u8; 4])?;
        Ok(())
    }

    /// Atomically take whichever sub-slots are filled, clearing their `got`
    /// flags. Called by the loop thread after draining the signal pipe.
    pub fn consume(&self) -> Result<(Option<VideoOut>, Option<AudioOut>)> {
        let mut inner = self.inner.lock().map_err(|_| Error::Mutex)?;

        let video = if inner.video.got {
            let slot = &mut inner.video;
            slot.got = false;
            Some(VideoOut {
                data: std::mem::take(&mut slot.buf),
                width: slot.width,
                height: slot.height,
                stride: slot.stride,
                ts_ms: slot.ts_ms,
            })
        } else {
            None
        };

        let audio = if inner.audio.got {
            let slot = &mut inner.audio;
            slot.got = false;
            Some(AudioOut {
                data: std::mem::take(&mut slot.buf),
                channels: slot.channels,
                bytes_per_sample: slot.bytes_per_sample,
                samples: slot.samples,
                ts_ms: slot.ts_ms,
            })
        } else {
            None
        };

        Ok((video, audio))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_then_consume_clears_got_flag() {
        let (slot, _rx) = AvSlot::new().unwrap();
        assert!(slot.try_publish_video(&[1, 2, 3, 4], 2, 1, 4, 100).unwrap());
        let (video, audio) = slot.consume().unwrap();
        assert!(video.is_some());
        assert!(audio.is_none());
        assert_eq!(video.unwrap().data, vec![1, 2, 3, 4]);

        let (video_again, _) = slot.consume().unwrap();
        assert!(video_again.is_none());
    }

    #[test]
    fn second_publish_before_consume_is_dropped() {
        let (slot, _rx) = AvSlot::new().unwrap();
        assert!(slot.try_publish_video(&[1, 2], 1, 1, 2, 1).unwrap());
        assert!(!slot.try_publish_video(&[9, 9], 1, 1, 2, 2).unwrap());
        let (video, _) = slot.consume().unwrap();
        assert_eq!(video.unwrap().data, vec![1, 2]);
    }

    #[test]
    fn audio_and_video_drop_independently() {
        let (slot, _rx) = AvSlot::new().unwrap();
        assert!(slot.try_publish_video(&[1], 1, 1, 1, 1).unwrap());
        assert!(slot.try_publish_audio(&[2, 2], 2, 2, 1, 1).unwrap());
        assert!(!slot.try_publish_video(&[3], 1, 1, 1, 2).unwrap());
        assert!(slot.try_publish_audio(&[4, 4], 2, 2, 1, 2).unwrap());

        let (video, audio) = slot.consume().unwrap();
        assert_eq!(video.unwrap().data, vec![1]);
        assert_eq!(audio.unwrap().data, vec![4, 4]);
    }

    #[test]
    fn signal_writes_one_token_per_call() {
        let (slot, mut rx) = AvSlot::new().unwrap();
        slot.try_publish_video(&[1], 1, 1, 1, 1).unwrap();
        slot.signal().unwrap();

        use std::io::Read;
        let mut buf = [0u8; 4];
        rx.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0u8; 4]);
    }
}
