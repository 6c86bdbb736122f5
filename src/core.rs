//! C7: the dispatch core — the single-threaded event loop.
//!
//! Grounded on `examples/original_source/bmd.c`'s `bmd_process_fds`/`main`
//! (the `select()`-based loop shape: term pipe, listener, per-peer fds,
//! lazy capture start/stop tied to peer-list population), re-expressed with
//! `mio::Poll`/`Token` readiness the way
//! `examples/other_examples/89770faa_russelltg-wl-screenrec__src-main.rs.rs`
//! drives an equivalent single-threaded multiplexed loop with `mio` +
//! `signal-hook-mio`.

use std::mem::MaybeUninit;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mio::net::{UnixListener, UnixStream};
use mio::unix::pipe;
use mio::{Events, Interest, Poll, Token};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_mio::v1_0::Signals;

use crate::capture::{AvSlot, CaptureDriver};
use crate::error::{Error, Result};
use crate::peer::{InboundEvent, Peer, PeerList};
use crate::video::convert::yuy2_to_nv12;
use crate::video::surface::{GpuSurface, SurfaceGeometry};
use crate::wire::protocol::{self, VideoGeometry};

const LISTENER: Token = Token(0);
const SIGNALS: Token = Token(1);
const AVSLOT_SIGNAL: Token = Token(2);
const FIRST_PEER_TOKEN: usize = 3;

/// Everything the loop thread owns outright. Per spec.md §5, only this
/// thread ever touches these fields; the capture callback touches only
/// [`AvSlot`].
pub struct DaemonState {
    poll: Poll,
    listener: UnixListener,
    uds_path: PathBuf,
    signals: Signals,
    avslot: Arc<AvSlot>,
    avslot_signal_rx: pipe::Receiver,
    capture: Option<CaptureDriver>,
    mode_index: usize,
    gpu: GpuSurface,
    exported: Option<(OwnedFd, SurfaceGeometry, u64)>,
    video_frame_count: u64,
    peers: PeerList,
    next_token: usize,
    is_running: bool,
}

impl DaemonState {
    pub fn new(uds_path: &Path, render_node: &Path, mode_index: usize) -> Result<Self> {
        let _ = std::fs::remove_file(uds_path);
        let mut listener = UnixListener::from_std(bind_unix_listener(uds_path, 2)?);
        set_socket_mode(uds_path)?;

        let poll = Poll::new().map_err(Error::Io)?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE).map_err(Error::Io)?;

        let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(Error::Io)?;
        poll.registry().register(&mut signals, SIGNALS, Interest::READABLE).map_err(Error::Io)?;

        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        let (avslot, mut avslot_signal_rx) = AvSlot::new()?;
        poll.registry().register(&mut avslot_signal_rx, AVSLOT_SIGNAL, Interest::READABLE).map_err(Error::Io)?;

        let gpu = GpuSurface::open(render_node)?;

        Ok(Self {
            poll,
            listener,
            uds_path: uds_path.to_path_buf(),
            signals,
            avslot: Arc::new(avslot),
            avslot_signal_rx,
            capture: None,
            mode_index,
            gpu,
            exported: None,
            video_frame_count: 0,
            peers: PeerList::new(),
            next_token: FIRST_PEER_TOKEN,
            is_running: false,
        })
    }

    /// Run until SIGINT/SIGTERM, or an unrecoverable error.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(128);
        loop {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }

            for event in events.iter() {
                match event.token() {
                    SIGNALS => {
                        for signal in self.signals.pending() {
                            tracing::info!(signal, "received termination signal");
                        }
                        self.shutdown()?;
                        return Ok(());
                    }
                    AVSLOT_SIGNAL => self.drain_avslot_signal()?,
                    LISTENER => self.accept_all()?,
                    token => self.service_peer(token)?,
                }
            }

            self.reap_closed_peers()?;
            self.resync_peer_interests()?;
        }
    }

    /// Rebuild each peer's registered interest to match
    /// `{peer.sck | peer.outbound non-empty}` (spec.md §4.7). mio's epoll
    /// backend is edge-triggered: a peer's one-time WRITABLE edge at
    /// `accept()` is consumed the first time its queue drains, so without
    /// this, a peer whose outbound queue goes empty and is later refilled
    /// (a subscribed-audio peer, or a `wants_next_video` peer once a frame
    /// arrives) would never see another writable wakeup.
    fn resync_peer_interests(&mut self) -> Result<()> {
        for peer in self.peers.iter_mut() {
            let wants_writable = peer.has_outbound();
            if wants_writable == peer.writable_registered {
                continue;
            }
            let interest = if wants_writable {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            self.poll.registry().reregister(&mut peer.stream, peer.token, interest).map_err(Error::Io)?;
            peer.writable_registered = wants_writable;
        }
        Ok(())
    }

    fn accept_all(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => self.add_peer(stream)?,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn add_peer(&mut self, mut stream: UnixStream) -> Result<()> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
            .map_err(Error::Io)?;

        self.peers.push(Peer::new(token, stream));
        tracing::debug!(peers = self.peers.len(), "peer connected");

        if !self.is_running {
            match self.start_capture() {
                Ok(()) => self.is_running = true,
                Err(e) => {
                    tracing::error!(error = %e, "capture start failed on first peer");
                    self.stop_capture();
                }
            }
        }
        Ok(())
    }

    fn start_capture(&mut self) -> Result<()> {
        let mut driver = CaptureDriver::create(self.mode_index, Arc::clone(&self.avslot))?;
        driver.start()?;
        self.capture = Some(driver);
        Ok(())
    }

    fn stop_capture(&mut self) {
        if let Some(mut driver) = self.capture.take() {
            if let Err(e) = driver.stop() {
                tracing::error!(error = %e, "capture stop failed");
            }
        }
        self.is_running = false;
    }

    fn drain_avslot_signal(&mut self) -> Result<()> {
        use std::io::Read;
        let mut token = [0u8; 4];
        loop {
            match self.avslot_signal_rx.read(&mut token) {
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }

        let (video, audio) = self.avslot.consume()?;

        if let Some(video) = video {
            if let Err(e) = self.handle_video(video) {
                tracing::warn!(error = %e, "dropping video frame after processing error");
            }
        }
        if let Some(audio) = audio {
            self.handle_audio(audio);
        }
        Ok(())
    }

    fn handle_video(&mut self, video: crate::capture::avslot::VideoOut) -> Result<()> {
        let nv12 = match yuy2_to_nv12(&video.data, video.width, video.height, video.stride) {
            Ok(frame) => frame,
            Err(Error::Param) => return Ok(()), // malformed geometry: drop, don't kill the loop
            Err(e) => return Err(e),
        };

        let recreated = self.gpu.ensure_surface(nv12.width, nv12.height)?;
        if recreated {
            self.video_frame_count = 0;
        }
        self.gpu.upload(&nv12)?;
        let (fd, geometry, _ts) = self.gpu.export(video.ts_ms)?;
        self.exported = Some((fd, geometry, video.ts_ms));
        self.video_frame_count += 1;

        let ts = video.ts_ms as u32;
        let header = protocol::encode_video(
            ts,
            VideoGeometry {
                width: geometry.width,
                height: geometry.height,
                stride: geometry.stride,
                size: geometry.size,
                bpp: geometry.bpp,
            },
        );

        for peer in self.peers.iter_mut() {
            if !peer.wants_next_video {
                continue;
            }
            let Some((fd, _, _)) = &self.exported else { continue };
            let Ok(dup) = fd.try_clone() else { continue };
            peer.queue_bytes(header.clone());
            peer.queue_fd(dup);
            peer.last_frame = self.video_frame_count;
            peer.wants_next_video = false;
        }
        Ok(())
    }

    fn handle_audio(&mut self, audio: crate::capture::avslot::AudioOut) {
        let pdu = protocol::encode_audio(audio.ts_ms as u32, audio.channels, &audio.data);
        for peer in self.peers.iter_mut() {
            if peer.subscribed_audio {
                peer.queue_bytes(pdu.clone());
            }
        }
    }

    fn service_peer(&mut self, token: Token) -> Result<()> {
        let Some(index) = self.peers.find_by_token(token) else { return Ok(()) };

        let events = {
            let peer = self.peers.get_mut(index).expect("index from find_by_token");
            let read_result = peer.read_ready();
            if !peer.closed {
                if let Err(e) = peer.write_ready() {
                    tracing::debug!(error = %e, "peer write error");
                }
            }
            read_result
        };

        match events {
            Ok(events) => {
                for event in events {
                    self.dispatch_inbound(token, event)?;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "peer read error");
            }
        }
        Ok(())
    }

    fn dispatch_inbound(&mut self, token: Token, event: InboundEvent) -> Result<()> {
        let Some(index) = self.peers.find_by_token(token) else { return Ok(()) };
        let video_frame_count = self.video_frame_count;
        let has_fresh_frame = self.exported.is_some();
        let exported_fd = match &self.exported {
            Some((fd, geometry, ts)) => Some((fd.try_clone().ok(), *geometry, *ts)),
            None => None,
        };

        let peer = self.peers.get_mut(index).expect("index from find_by_token");
        match event {
            InboundEvent::SubscribeAudio(enabled) => {
                peer.subscribed_audio = enabled;
            }
            InboundEvent::RequestVideoFrame => {
                if !has_fresh_frame || peer.last_frame == video_frame_count {
                    peer.wants_next_video = true;
                } else if let Some((Some(fd), geometry, ts)) = exported_fd {
                    let header = protocol::encode_video(
                        ts as u32,
                        VideoGeometry {
                            width: geometry.width,
                            height: geometry.height,
                            stride: geometry.stride,
                            size: geometry.size,
                            bpp: geometry.bpp,
                        },
                    );
                    peer.queue_bytes(header);
                    peer.queue_fd(fd);
                    peer.last_frame = video_frame_count;
                }
            }
            InboundEvent::VersionInbound { major, minor } => {
                tracing::debug!(major, minor, "peer reported protocol version");
            }
            InboundEvent::Unknown(code) => {
                tracing::trace!(code, "ignored unknown PDU");
            }
        }
        Ok(())
    }

    fn reap_closed_peers(&mut self) -> Result<()> {
        let mut i = 0;
        while i < self.peers.len() {
            let closed = self.peers.get_mut(i).expect("in-bounds index").closed;
            if closed {
                let peer = self.peers.remove(i);
                let mut stream = peer.stream;
                let _ = self.poll.registry().deregister(&mut stream);
                tracing::debug!(peers = self.peers.len(), "peer removed");
            } else {
                i += 1;
            }
        }

        if self.peers.is_empty() && self.is_running {
            self.stop_capture();
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.stop_capture();
        while !self.peers.is_empty() {
            self.peers.remove(0);
        }
        let _ = std::fs::remove_file(&self.uds_path);
        Ok(())
    }
}

/// Bind a Unix listener with an explicit `listen` backlog (spec.md §4.7
/// calls for backlog 2). `std::os::unix::net::UnixListener::bind` does not
/// expose the backlog, so this goes through `libc` directly, matching
/// `bmd.c`'s `socket`/`bind`/`listen` sequence in `main()`.
fn bind_unix_listener(path: &Path, backlog: i32) -> Result<std::os::unix::net::UnixListener> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Param)?;
    if c_path.as_bytes().len() >= 108 {
        return Err(Error::Param);
    }

    unsafe {
        let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        let mut addr: libc::sockaddr_un = MaybeUninit::zeroed().assume_init();
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        std::ptr::copy_nonoverlapping(
            c_path.as_ptr(),
            addr.sun_path.as_mut_ptr(),
            c_path.as_bytes_with_nul().len(),
        );

        let addr_len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
        if libc::bind(fd, &addr as *const _ as *const libc::sockaddr, addr_len) != 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(Error::Io(err));
        }
        if libc::listen(fd, backlog) != 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(Error::Io(err));
        }

        use std::os::fd::FromRawFd;
        let std_listener = std::os::unix::net::UnixListener::from_raw_fd(fd);
        std_listener.set_nonblocking(true).map_err(Error::Io)?;
        Ok(std_listener)
    }
}

fn set_socket_mode(path: &Path) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Param)?;
    let ret = unsafe { libc::chmod(c_path.as_ptr(), 0o666) };
    if ret != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn bind_unix_listener_accepts_connections_with_given_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sock");

        let listener = bind_unix_listener(&path, 2).unwrap();
        set_socket_mode(&path).unwrap();

        let metadata = std::fs::metadata(&path).unwrap();
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(metadata.permissions().mode() & 0o777, 0o666);

        let _client = UnixStream::connect(&path).unwrap();
        // non-blocking accept should succeed immediately once the peer has connected.
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(listener.accept().is_ok());
    }

    #[test]
    fn bind_unix_listener_rejects_overlong_path() {
        let long = "a".repeat(200);
        let path = Path::new("/tmp").join(long);
        assert!(matches!(bind_unix_listener(&path, 2), Err(Error::Param)));
    }
}
