//! C5: per-peer connection state, and the peer list it lives in.
//!
//! Grounded on `examples/original_source/bmd_peer.c`: `struct peer_info` and
//! `struct stream` become [`Peer`] and [`OutMessage`]; `bmd_peer_check_fds`'s
//! header/payload state machine becomes [`Peer::read_ready`];
//! `bmd_peer_send_fd`'s raw `sendmsg`/`cmsghdr`/`SCM_RIGHTS` call becomes
//! [`Peer::send_fd`]; `bmd_peer_remove_one`'s sole/head/middle/tail removal
//! becomes [`PeerList::remove`].

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use mio::net::UnixStream;
use mio::Token;

use crate::error::{Error, Result};
use crate::wire::cursor::hex_dump;
use crate::wire::protocol::{self, code, HEADER_LEN, MAX_PDU_LEN};

/// One queued outbound unit: either a byte buffer or a single fd to hand
/// off via `sendmsg`/SCM_RIGHTS. Exactly the two shapes spec.md §3 allows.
pub enum OutMessage {
    Bytes { data: Vec<u8>, sent: usize },
    Fd(OwnedFd),
}

impl OutMessage {
    pub fn bytes(data: Vec<u8>) -> Self {
        Self::Bytes { data, sent: 0 }
    }
}

enum Inbound {
    Header { buf: [u8; HEADER_LEN], filled: usize },
    Payload { code: u32, buf: Vec<u8>, filled: usize },
}

impl Inbound {
    fn new() -> Self {
        Inbound::Header { buf: [0u8; HEADER_LEN], filled: 0 }
    }
}

/// One fully decoded inbound PDU, handed up to the dispatch core to act on
/// (the core owns `DaemonState`, which §5 says only it may touch).
pub enum InboundEvent {
    SubscribeAudio(bool),
    RequestVideoFrame,
    VersionInbound { major: u32, minor: u32 },
    Unknown(u32),
}

pub struct Peer {
    pub token: Token,
    pub stream: UnixStream,
    pub subscribed_audio: bool,
    pub wants_next_video: bool,
    pub last_frame: u64,
    pub closed: bool,
    /// Whether this peer's socket is currently registered with
    /// `Interest::WRITABLE` with the core's `Poll`. Tracked here so the
    /// core can tell, without an extra syscall, whether the writable set
    /// needs rebuilding for this peer (spec.md §4.7: the writable set is
    /// `{peer.sck | peer.outbound non-empty}`, rebuilt every iteration).
    pub writable_registered: bool,
    inbound: Inbound,
    outbound: VecDeque<OutMessage>,
}

impl Peer {
    pub fn new(token: Token, stream: UnixStream) -> Self {
        let mut peer = Self {
            token,
            stream,
            subscribed_audio: false,
            wants_next_video: false,
            last_frame: 0,
            closed: false,
            writable_registered: true,
            inbound: Inbound::new(),
            outbound: VecDeque::new(),
        };
        peer.queue_bytes(protocol::encode_version());
        peer
    }

    pub fn queue_bytes(&mut self, data: Vec<u8>) {
        self.outbound.push_back(OutMessage::bytes(data));
    }

    pub fn queue_fd(&mut self, fd: OwnedFd) {
        self.outbound.push_back(OutMessage::Fd(fd));
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Read whatever is available, advance the header/payload state
    /// machine, and return one [`InboundEvent`] per fully decoded PDU.
    /// Sets `self.closed` on EOF, a read error, or a framing violation
    /// (spec.md §8 boundary behavior: `length < 8` or `length > 1 MiB`).
    pub fn read_ready(&mut self) -> Result<Vec<InboundEvent>> {
        let mut events = Vec::new();
        loop {
            let progressed = match &mut self.inbound {
                Inbound::Header { buf, filled } => {
                    let n = match self.stream.read(&mut buf[*filled..]) {
                        Ok(0) => {
                            self.closed = true;
                            return Ok(events);
                        }
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(events),
                        Err(e) => {
                            self.closed = true;
                            return Err(Error::Io(e));
                        }
                    };
                    *filled += n;
                    if *filled == HEADER_LEN {
                        let mut header_buf = *buf;
                        let header = protocol::decode_header(&mut header_buf)?;
                        if (header.length as usize) < HEADER_LEN || header.length as usize > MAX_PDU_LEN {
                            self.closed = true;
                            return Err(Error::Decode);
                        }
                        let payload_len = header.length as usize - HEADER_LEN;
                        self.inbound = Inbound::Payload { code: header.code, buf: vec![0u8; payload_len], filled: 0 };
                    }
                    true
                }
                Inbound::Payload { buf, filled, .. } if *filled < buf.len() => {
                    let n = match self.stream.read(&mut buf[*filled..]) {
                        Ok(0) => {
                            self.closed = true;
                            return Ok(events);
                        }
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(events),
                        Err(e) => {
                            self.closed = true;
                            return Err(Error::Io(e));
                        }
                    };
                    *filled += n;
                    true
                }
                Inbound::Payload { .. } => false,
            };

            if let Inbound::Payload { code, buf, filled } = &self.inbound {
                if *filled == buf.len() {
                    hex_dump(buf);
                    let event = match Self::decode_payload(*code, &mut buf.clone()) {
                        Ok(event) => event,
                        Err(e) => {
                            self.closed = true;
                            return Err(e);
                        }
                    };
                    self.inbound = Inbound::new();
                    if let Some(event) = event {
                        events.push(event);
                    }
                    continue;
                }
            }

            if !progressed {
                return Ok(events);
            }
        }
    }

    fn decode_payload(code: u32, buf: &mut [u8]) -> Result<Option<InboundEvent>> {
        match code {
            code::SUBSCRIBE_AUDIO => Ok(Some(InboundEvent::SubscribeAudio(protocol::decode_subscribe_audio(buf)?))),
            code::REQUEST_VIDEO_FRAME => Ok(Some(InboundEvent::RequestVideoFrame)),
            code::VERSION => {
                let (major, minor) = protocol::decode_version_inbound(buf)?;
                Ok(Some(InboundEvent::VersionInbound { major, minor }))
            }
            other => Ok(Some(InboundEvent::Unknown(other))),
        }
    }

    /// Drain as much of the outbound queue as the socket will currently
    /// accept. Partial writes are normal; a write error closes the peer.
    pub fn write_ready(&mut self) -> Result<()> {
        loop {
            let Some(front) = self.outbound.front_mut() else { return Ok(()) };
            let done = match front {
                OutMessage::Bytes { data, sent } => match self.stream.write(&data[*sent..]) {
                    Ok(0) => return Ok(()),
                    Ok(n) => {
                        *sent += n;
                        *sent == data.len()
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => {
                        self.closed = true;
                        return Err(Error::Io(e));
                    }
                },
                OutMessage::Fd(fd) => match send_fd(self.stream.as_raw_fd(), fd.as_raw_fd()) {
                    Ok(()) => true,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => {
                        self.closed = true;
                        return Err(Error::Io(e));
                    }
                },
            };
            if done {
                self.outbound.pop_front();
            }
        }
    }
}

/// Send `fd` over `sck` as a single `sendmsg` carrying the literal 4-byte
/// in-band body `"int\0"` and one SCM_RIGHTS ancillary record, per
/// spec.md §4.6's VIDEO-PDU-followed-by-fd-message contract. Grounded on
/// `bmd_peer.c`'s `bmd_peer_send_fd`.
fn send_fd(sck: RawFd, fd: RawFd) -> io::Result<()> {
    let body = *b"int\0";
    let mut iov = libc::iovec { iov_base: body.as_ptr() as *mut _, iov_len: body.len() };

    let cmsg_space = unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: libc::msghdr = unsafe { MaybeUninit::zeroed().assume_init() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut _;
    msg.msg_controllen = cmsg_buf.len() as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<RawFd>() as u32) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);

        let ret = libc::sendmsg(sck, &msg, libc::MSG_NOSIGNAL);
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// The insertion-ordered peer list. Backed by a `Vec` rather than a literal
/// linked list: `Vec::remove` already preserves the order of remaining
/// peers for any removal position (sole/head/middle/tail), which is the
/// property spec.md §4.5/§8 actually requires.
#[derive(Default)]
pub struct PeerList {
    peers: Vec<Peer>,
}

impl PeerList {
    pub fn new() -> Self {
        Self { peers: Vec::new() }
    }

    pub fn push(&mut self, peer: Peer) {
        self.peers.push(peer);
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Peer> {
        self.peers.iter_mut()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Peer> {
        self.peers.get_mut(index)
    }

    pub fn find_by_token(&self, token: Token) -> Option<usize> {
        self.peers.iter().position(|p| p.token == token)
    }

    /// Remove the peer at `index`, preserving the relative order of every
    /// remaining peer (sole/head/middle/tail all handled identically).
    pub fn remove(&mut self, index: usize) -> Peer {
        self.peers.remove(index)
    }

    pub fn tokens_in_order(&self) -> Vec<Token> {
        self.peers.iter().map(|p| p.token).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream as StdUnixStream;

    fn make_peer(token: usize) -> Peer {
        let (a, _b) = StdUnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        Peer::new(Token(token), UnixStream::from_std(a))
    }

    #[test]
    fn new_peer_queues_version_immediately() {
        let peer = make_peer(1);
        assert!(peer.has_outbound());
    }

    #[test]
    fn removal_preserves_order_sole() {
        let mut list = PeerList::new();
        list.push(make_peer(1));
        list.remove(0);
        assert!(list.is_empty());
    }

    #[test]
    fn removal_preserves_order_head_middle_tail() {
        let mut list = PeerList::new();
        for t in 1..=4 {
            list.push(make_peer(t));
        }
        // remove head
        list.remove(0);
        assert_eq!(list.tokens_in_order(), vec![Token(2), Token(3), Token(4)]);
        // remove middle
        let idx = list.find_by_token(Token(3)).unwrap();
        list.remove(idx);
        assert_eq!(list.tokens_in_order(), vec![Token(2), Token(4)]);
        // remove tail
        let idx = list.find_by_token(Token(4)).unwrap();
        list.remove(idx);
        assert_eq!(list.tokens_in_order(), vec![Token(2)]);
    }

    #[test]
    fn version_pdu_round_trips_through_socket_pair() {
        let (a, b) = StdUnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let mut peer = Peer::new(Token(1), UnixStream::from_std(a));
        peer.write_ready().unwrap();

        let mut buf = [0u8; 32];
        let mut b = b;
        b.set_nonblocking(true).unwrap();
        use std::io::Read as _;
        let n = b.read(&mut buf).unwrap();
        assert_eq!(n, 32);
        assert_eq!(buf[0], code::VERSION as u8);
    }
}
