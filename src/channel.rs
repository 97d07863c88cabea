//! Cross-process channel plumbing.
//!
//! Session and engine talk over two `SOCK_SEQPACKET` socketpairs: a
//! bidirectional command channel and a unidirectional slot-index channel
//! (engine -> session). SEQPACKET gives lossless, FIFO, message-oriented
//! delivery, which is exactly the contract the protocol layer assumes.
//!
//! The session side adapts the blocking fds to the cooperative scheduler
//! with [`AsyncFd`]; the engine side stays synchronous and single-threaded.
//! The fds themselves are handed to the spawned engine by inheritance, with
//! the fd numbers announced in environment variables.

use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use std::{io, mem};

use log::warn;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};
use tokio::io::unix::AsyncFd;
use zerocopy::{FromBytes, IntoBytes};

use crate::proto::SlotRecord;

/// Environment variable announcing the command-channel fd to the engine.
pub(crate) const COMM_FD_ENV: &str = "POSED_COMM_FD";
/// Environment variable announcing the slot-channel fd to the engine.
pub(crate) const SLOT_FD_ENV: &str = "POSED_SLOT_FD";

/// Requested kernel send-buffer size for the slot channel. Slot records are
/// 16 bytes; the kernel rounds this up, but it still bounds the channel to a
/// handful of in-flight records, which is all the newest-wins policy needs.
const SLOT_SNDBUF: usize = 4096;

/// Raw fd wrapper that closes exactly once.
#[derive(Debug)]
pub(crate) struct RawFdHandle {
    fd: RawFd,
    is_closed: AtomicBool,
}

impl RawFdHandle {
    fn new(fd: OwnedFd) -> RawFdHandle {
        RawFdHandle {
            fd: fd.into_raw_fd(),
            is_closed: AtomicBool::new(false),
        }
    }

    fn close(&self) {
        let already_closed = self.is_closed.swap(true, Ordering::SeqCst);
        if !already_closed {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

impl Drop for RawFdHandle {
    fn drop(&mut self) {
        self.close()
    }
}

impl AsRawFd for RawFdHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// Create one SEQPACKET socketpair. Both fds are inheritable; the parent
/// flips close-on-exec on its end after spawning the engine.
pub(crate) fn seqpacket_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let (a, b) = socket::socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::empty(),
    )?;
    Ok((a, b))
}

/// Create the slot channel: `(session_rx, engine_tx)` with a small send
/// buffer on the engine end.
pub(crate) fn slot_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let (rx, tx) = seqpacket_pair()?;
    socket::setsockopt(&tx, socket::sockopt::SndBuf, &SLOT_SNDBUF)?;
    Ok((rx, tx))
}

fn fd_from_env(var: &str) -> io::Result<OwnedFd> {
    let value = std::env::var(var).map_err(|_| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{var} is not set; the engine must be spawned by a session"),
        )
    })?;
    let fd: RawFd = value
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("{var}={value}")))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Mark an fd close-on-exec so later spawns do not inherit it.
pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let code = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    if code == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let code = unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) };
    if code == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Receive one datagram (can block). `Ok(0)` means the peer is gone.
fn raw_recv(fd: &RawFdHandle, buffer: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
    let rc = unsafe {
        libc::recv(
            fd.fd,
            buffer.as_mut_ptr() as *mut libc::c_void,
            buffer.len() as libc::size_t,
            flags,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

/// Send one datagram (can block). `MSG_NOSIGNAL` keeps a dead peer from
/// raising SIGPIPE; the caller sees `EPIPE` instead.
fn raw_send(fd: &RawFdHandle, buffer: &[u8], flags: libc::c_int) -> io::Result<usize> {
    let rc = unsafe {
        libc::send(
            fd.fd,
            buffer.as_ptr() as *const libc::c_void,
            buffer.len() as libc::size_t,
            flags | libc::MSG_NOSIGNAL,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

/// Session-side endpoint: a nonblocking fd driven by the tokio reactor.
#[derive(Debug)]
pub(crate) struct AsyncEndpoint {
    fd: AsyncFd<RawFdHandle>,
}

impl AsyncEndpoint {
    pub(crate) fn new(fd: OwnedFd) -> io::Result<AsyncEndpoint> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(AsyncEndpoint {
            fd: AsyncFd::new(RawFdHandle::new(fd))?,
        })
    }

    /// Receive the next datagram into `buffer`; returns 0 at EOF.
    pub(crate) async fn recv(&self, buffer: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| raw_recv(inner.get_ref(), buffer, 0)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Send one datagram.
    pub(crate) async fn send(&self, buffer: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| raw_send(inner.get_ref(), buffer, 0)) {
                Ok(result) => return result.map(|_| ()),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Engine-side endpoint: plain blocking fd with bounded-wait and drain
/// helpers. The engine process is single-threaded by design.
#[derive(Debug)]
pub(crate) struct SyncEndpoint {
    fd: RawFdHandle,
}

impl SyncEndpoint {
    pub(crate) fn new(fd: OwnedFd) -> SyncEndpoint {
        SyncEndpoint {
            fd: RawFdHandle::new(fd),
        }
    }

    /// Reconstruct the endpoint from an inherited fd.
    pub(crate) fn from_env(var: &str) -> io::Result<SyncEndpoint> {
        Ok(SyncEndpoint::new(fd_from_env(var)?))
    }

    /// Non-blocking receive. `Ok(None)` when nothing is queued, `Ok(Some(0))`
    /// at EOF.
    pub(crate) fn try_recv(&self, buffer: &mut [u8]) -> io::Result<Option<usize>> {
        match raw_recv(&self.fd, buffer, libc::MSG_DONTWAIT) {
            Ok(n) => Ok(Some(n)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Receive with a deadline. `Ok(None)` when the deadline passes first,
    /// `Ok(Some(0))` at EOF.
    pub(crate) fn recv_deadline(
        &self,
        buffer: &mut [u8],
        deadline: Instant,
    ) -> io::Result<Option<usize>> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let ms = remaining.as_millis().min(u128::from(u16::MAX)) as u16;
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(self.fd.fd) };
            let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(ms)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
            match self.try_recv(buffer)? {
                Some(n) => return Ok(Some(n)),
                // Readable raced away; poll again.
                None => continue,
            }
        }
    }

    /// Blocking send of one datagram.
    pub(crate) fn send(&self, buffer: &[u8]) -> io::Result<()> {
        loop {
            match raw_send(&self.fd, buffer, 0) {
                Ok(_) => return Ok(()),
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

/// Engine-side publisher of [`SlotRecord`]s. Sends never block: a full
/// channel drops the publication, which is the newest-wins policy.
#[derive(Debug)]
pub(crate) struct SlotPublisher {
    fd: RawFdHandle,
}

impl SlotPublisher {
    pub(crate) fn new(fd: OwnedFd) -> SlotPublisher {
        SlotPublisher {
            fd: RawFdHandle::new(fd),
        }
    }

    /// Reconstruct the publisher from an inherited fd.
    pub(crate) fn from_env(var: &str) -> io::Result<SlotPublisher> {
        Ok(SlotPublisher::new(fd_from_env(var)?))
    }

    /// Publish one record; returns `false` when the record was dropped
    /// because the channel is full.
    pub(crate) fn publish(&self, record: &SlotRecord) -> io::Result<bool> {
        match raw_send(&self.fd, record.as_bytes(), libc::MSG_DONTWAIT) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Session-side receiver of [`SlotRecord`]s.
#[derive(Debug)]
pub(crate) struct SlotReceiver {
    endpoint: AsyncEndpoint,
}

impl SlotReceiver {
    pub(crate) fn new(fd: OwnedFd) -> io::Result<SlotReceiver> {
        Ok(SlotReceiver {
            endpoint: AsyncEndpoint::new(fd)?,
        })
    }

    /// Await the next record. `Ok(None)` means the engine closed its end.
    pub(crate) async fn recv(&self) -> io::Result<Option<SlotRecord>> {
        let mut buf = [0u8; mem::size_of::<SlotRecord>()];
        loop {
            let n = self.endpoint.recv(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            match SlotRecord::read_from_bytes(&buf[..n]) {
                Ok(record) => return Ok(Some(record)),
                Err(_) => {
                    warn!("discarding malformed {n}-byte slot record");
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sync_round_trip_and_eof() {
        let (a, b) = seqpacket_pair().unwrap();
        let a = SyncEndpoint::new(a);
        let b = SyncEndpoint::new(b);

        a.send(b"hello").unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(b.try_recv(&mut buf).unwrap(), Some(5));
        assert_eq!(&buf[..5], b"hello");

        // Nothing queued.
        assert_eq!(b.try_recv(&mut buf).unwrap(), None);

        // Peer gone.
        drop(a);
        assert_eq!(b.try_recv(&mut buf).unwrap(), Some(0));
    }

    #[test]
    fn recv_deadline_times_out() {
        let (a, b) = seqpacket_pair().unwrap();
        let _a = SyncEndpoint::new(a);
        let b = SyncEndpoint::new(b);
        let mut buf = [0u8; 16];
        let start = Instant::now();
        let got = b
            .recv_deadline(&mut buf, Instant::now() + Duration::from_millis(50))
            .unwrap();
        assert_eq!(got, None);
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn async_endpoint_round_trip() {
        let (a, b) = seqpacket_pair().unwrap();
        let asynchronous = AsyncEndpoint::new(a).unwrap();
        let synchronous = SyncEndpoint::new(b);

        asynchronous.send(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(synchronous.try_recv(&mut buf).unwrap(), Some(4));

        synchronous.send(b"pong").unwrap();
        let n = asynchronous.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[tokio::test]
    async fn slot_records_cross_the_pair() {
        let (rx, tx) = slot_pair().unwrap();
        let receiver = SlotReceiver::new(rx).unwrap();
        let publisher = SlotPublisher::new(tx);

        let record = SlotRecord {
            slot: 2,
            generation: 4,
            seq: 9,
        };
        assert!(publisher.publish(&record).unwrap());
        assert_eq!(receiver.recv().await.unwrap(), Some(record));

        drop(publisher);
        assert_eq!(receiver.recv().await.unwrap(), None);
    }
}
