//! Wire protocol: PDU codes, framing constants, and (de)serialization.
//!
//! Every PDU starts with an 8-byte header (`code: u32 le`, `length: u32 le`,
//! `length` counting from the first byte of `code`). This module is the only
//! place that knows the byte layout of a PDU; [`crate::peer`] and
//! [`crate::core`] only deal in typed values.

use crate::error::{Error, Result};
use crate::wire::cursor::Cursor;

pub const HEADER_LEN: usize = 8;
pub const MAX_PDU_LEN: usize = 1024 * 1024;

pub mod code {
    pub const SUBSCRIBE_AUDIO: u32 = 1;
    pub const AUDIO: u32 = 2;
    pub const REQUEST_VIDEO_FRAME: u32 = 3;
    pub const VIDEO: u32 = 4;
    pub const VERSION: u32 = 5;
}

pub const DAEMON_VERSION_MAJOR: u32 = 0;
pub const DAEMON_VERSION_MINOR: u32 = 1;
pub const AUDIO_LATENCY: u32 = 64;

/// The 8-byte PDU header, already parsed.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub code: u32,
    pub length: u32,
}

/// Decode a PDU header from the first 8 bytes of `buf`.
pub fn decode_header(buf: &mut [u8]) -> Result<Header> {
    let mut cursor = Cursor::new(buf);
    cursor.set_end(HEADER_LEN);
    let code = cursor.read_u32_le()?;
    let length = cursor.read_u32_le()?;
    Ok(Header { code, length })
}

/// Geometry of an exported video surface, as carried in the VIDEO PDU.
#[derive(Debug, Clone, Copy)]
pub struct VideoGeometry {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub size: u32,
    pub bpp: u32,
}

/// Build the VERSION PDU the daemon sends to every peer on connect.
pub fn encode_version() -> Vec<u8> {
    let mut buf = vec![0u8; 32];
    {
        let mut c = Cursor::new(&mut buf);
        c.write_u32_le(code::VERSION);
        c.write_u32_le(32);
        c.write_u32_le(DAEMON_VERSION_MAJOR);
        c.write_u32_le(DAEMON_VERSION_MINOR);
        c.write_u32_le(AUDIO_LATENCY);
        c.skip_bytes(12);
    }
    buf
}

/// Parse the payload of an inbound VERSION PDU (client reporting its own
/// version). Supplements spec.md's daemon-to-client-only VERSION direction
/// with the original daemon's symmetric handling (see SPEC_FULL.md §B.1).
pub fn decode_version_inbound(payload: &mut [u8]) -> Result<(u32, u32)> {
    let mut c = Cursor::new(payload);
    if !c.check_remaining(8) {
        return Err(Error::Range);
    }
    let major = c.read_u32_le()?;
    let minor = c.read_u32_le()?;
    Ok((major, minor))
}

/// Build the 40-byte VIDEO PDU header. The caller is responsible for
/// following it with the fd-carrying ancillary message (see
/// [`crate::peer::OutMessage::Fd`]).
pub fn encode_video(ts: u32, geometry: VideoGeometry) -> Vec<u8> {
    let mut buf = vec![0u8; 40];
    {
        let mut c = Cursor::new(&mut buf);
        c.write_u32_le(code::VIDEO);
        c.write_u32_le(40);
        c.write_u32_le(ts);
        c.skip_bytes(4); // pad
        c.write_u32_le(0); // fd_placeholder: real fd travels out-of-band via SCM_RIGHTS
        c.write_u32_le(geometry.width);
        c.write_u32_le(geometry.height);
        c.write_u32_le(geometry.stride);
        c.write_u32_le(geometry.size);
        c.write_u32_le(geometry.bpp);
    }
    buf
}

/// Build an AUDIO PDU carrying `pcm`.
pub fn encode_audio(ts: u32, channels: u32, pcm: &[u8]) -> Vec<u8> {
    let total_len = 24 + pcm.len();
    let mut buf = vec![0u8; total_len];
    {
        let mut c = Cursor::new(&mut buf);
        c.write_u32_le(code::AUDIO);
        c.write_u32_le(total_len as u32);
        c.write_u32_le(ts);
        c.skip_bytes(4); // pad
        c.write_u32_le(channels);
        c.write_u32_le(pcm.len() as u32);
        c.write_bytes_raw(pcm);
    }
    buf
}

/// Parse the payload of a SUBSCRIBE_AUDIO PDU.
pub fn decode_subscribe_audio(payload: &mut [u8]) -> Result<bool> {
    let mut c = Cursor::new(payload);
    if !c.check_remaining(1) {
        return Err(Error::Range);
    }
    Ok(c.read_u8()? != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_pdu_matches_scenario_1() {
        let buf = encode_version();
        let expected_header = [
            0x05, 0x00, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00,
            0x00, 0x00, 0x40, 0x00, 0x00, 0x00,
        ];
        assert_eq!(&buf[..20], &expected_header);
        assert_eq!(&buf[20..32], &[0u8; 12]);
    }

    #[test]
    fn video_header_round_trips_geometry() {
        let geometry = VideoGeometry { width: 1280, height: 720, stride: 1280, size: 1_382_400, bpp: 12 };
        let mut buf = encode_video(1234, geometry);
        let header = decode_header(&mut buf).unwrap();
        assert_eq!(header.code, code::VIDEO);
        assert_eq!(header.length, 40);

        let mut c = Cursor::new(&mut buf);
        c.skip(8).unwrap();
        let ts = c.read_u32_le().unwrap();
        c.skip(4).unwrap();
        let _fd_placeholder = c.read_u32_le().unwrap();
        let width = c.read_u32_le().unwrap();
        let height = c.read_u32_le().unwrap();
        assert_eq!(ts, 1234);
        assert_eq!(width, 1280);
        assert_eq!(height, 720);
    }

    #[test]
    fn subscribe_audio_decodes_enable_flag() {
        let mut payload = [1u8];
        assert!(decode_subscribe_audio(&mut payload).unwrap());
        let mut payload = [0u8];
        assert!(!decode_subscribe_audio(&mut payload).unwrap());
    }

    #[test]
    fn audio_pdu_length_accounts_for_header() {
        let pcm = vec![0u8; 100];
        let buf = encode_audio(10, 2, &pcm);
        assert_eq!(buf.len(), 24 + 100);
        let mut header_buf = buf.clone();
        let header = decode_header(&mut header_buf).unwrap();
        assert_eq!(header.length as usize, buf.len());
    }

    #[test]
    fn short_version_payload_is_range_error() {
        let mut payload = [0u8; 4];
        assert!(matches!(decode_version_inbound(&mut payload), Err(Error::Range)));
    }
}
