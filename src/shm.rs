//! Shared-memory frame ring.
//!
//! A session owns a named POSIX shared-memory region holding [`SLOT_COUNT`]
//! fixed-size frame slots followed by a small control page. The engine
//! process attaches by name and is the only writer; the session's broadcast
//! task reads published slots without copying. The session creates the
//! region and is responsible for unlinking the name on every exit path, even
//! when the engine is already gone.
//!
//! The control page carries one generation counter per slot, seqlock style:
//! the engine bumps a slot's counter to odd before writing and to even after.
//! A reader that still holds a view of slot `i` can detect the writer coming
//! back around by comparing the published generation against the live one.

use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::{io, ptr, slice};

use log::{debug, warn};
use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use ref_cast::RefCast;

/// Number of slots in the ring. One may be in flight to clients, one just
/// produced, one under construction; the producer never stalls at steady
/// state.
pub const SLOT_COUNT: u32 = 3;

/// A zero-copy view of one frame: `num_bones` consecutive row-major 4x4
/// `f32` matrices, little-endian, no header.
#[derive(Debug, RefCast)]
#[repr(transparent)]
pub struct Frame([u8]);

impl Frame {
    /// The raw frame bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Frame length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for a zero-length frame (never produced by a healthy animator).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Read the `index`-th float of the frame.
    ///
    /// Mostly useful in tests and diagnostics; out-of-range reads return 0.
    pub fn float(&self, index: usize) -> f32 {
        let off = index * 4;
        match self.0.get(off..off + 4) {
            Some(bytes) => f32::from_le_bytes(bytes.try_into().unwrap()),
            None => 0.0,
        }
    }
}

/// Byte layout of the mapped region.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RingLayout {
    frame_bytes: usize,
}

impl RingLayout {
    pub(crate) fn new(frame_bytes: u32) -> RingLayout {
        RingLayout {
            frame_bytes: frame_bytes as usize,
        }
    }

    pub(crate) fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    pub(crate) fn slot_offset(&self, slot: u32) -> usize {
        debug_assert!(slot < SLOT_COUNT);
        slot as usize * self.frame_bytes
    }

    /// Length of the slot array; also where the control page starts, rounded
    /// up so the generation counters sit on their own cache line.
    pub(crate) fn control_offset(&self) -> usize {
        round_up(SLOT_COUNT as usize * self.frame_bytes, 64)
    }

    /// Total mapping length, page-granular.
    pub(crate) fn region_len(&self) -> usize {
        let raw = self.control_offset() + SLOT_COUNT as usize * std::mem::size_of::<AtomicU32>();
        round_up(raw, page_size::get())
    }
}

fn round_up(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}

/// Best-effort removal of a shm name that no live ring owns (stale leftover
/// from a crashed process).
pub(crate) fn unlink_name(name: &str) {
    if let Err(err) = mman::shm_unlink(name) {
        debug!("shm_unlink {name} failed: {err}");
    }
}

/// RAII mapping wrapper; unmapped on drop.
#[derive(Debug)]
struct Mapping {
    ptr: ptr::NonNull<libc::c_void>,
    len: usize,
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Err(err) = unsafe { mman::munmap(self.ptr, self.len) } {
            warn!("munmap of {} bytes failed: {}", self.len, err);
        }
    }
}

/// A mapped frame ring, either owned (session side) or attached (engine
/// side). The owner unlinks the name on drop or on an explicit
/// [`SharedRing::unlink`], whichever comes first.
#[derive(Debug)]
pub(crate) struct SharedRing {
    name: String,
    layout: RingLayout,
    map: Mapping,
    owner: bool,
    unlinked: AtomicBool,
}

// The mapping is shared with exactly one writer (the engine process);
// within this process it is only ever read, and the generation counters are
// atomics.
unsafe impl Send for SharedRing {}
unsafe impl Sync for SharedRing {}

impl SharedRing {
    /// Create and map a fresh region under `name`. Fails with `EEXIST` if
    /// the name is taken.
    pub(crate) fn create(name: &str, frame_bytes: u32) -> io::Result<SharedRing> {
        let layout = RingLayout::new(frame_bytes);
        let fd = mman::shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        let ring = (|| {
            nix::unistd::ftruncate(&fd, layout.region_len() as libc::off_t)?;
            let map = map_region(&fd, layout.region_len())?;
            Ok::<SharedRing, io::Error>(SharedRing {
                name: name.to_owned(),
                layout,
                map,
                owner: true,
                unlinked: AtomicBool::new(false),
            })
        })();
        match ring {
            Ok(ring) => {
                debug!(
                    "created shm ring {} ({} bytes, {} per frame)",
                    name,
                    layout.region_len(),
                    frame_bytes
                );
                Ok(ring)
            }
            Err(err) => {
                // The name was registered before sizing/mapping failed.
                let _ = mman::shm_unlink(name);
                Err(err)
            }
        }
    }

    /// Attach to an existing region by name. The region must be at least as
    /// large as the layout derived from `frame_bytes`.
    pub(crate) fn attach(name: &str, frame_bytes: u32) -> io::Result<SharedRing> {
        let layout = RingLayout::new(frame_bytes);
        let fd = mman::shm_open(name, OFlag::O_RDWR, Mode::empty())?;
        let size = region_size(&fd)?;
        if size < layout.region_len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "shm region {} is {} bytes, need {}",
                    name,
                    size,
                    layout.region_len()
                ),
            ));
        }
        let map = map_region(&fd, layout.region_len())?;
        Ok(SharedRing {
            name: name.to_owned(),
            layout,
            map,
            owner: false,
            unlinked: AtomicBool::new(false),
        })
    }

    pub(crate) fn layout(&self) -> &RingLayout {
        &self.layout
    }

    /// Remove the name from the namespace. Owner side only; idempotent. The
    /// mapping itself stays valid until drop.
    pub(crate) fn unlink(&self) {
        if !self.owner {
            return;
        }
        let already = self.unlinked.swap(true, Ordering::SeqCst);
        if !already {
            if let Err(err) = mman::shm_unlink(self.name.as_str()) {
                debug!("shm_unlink {} failed: {}", self.name, err);
            }
        }
    }

    fn base(&self) -> *mut u8 {
        self.map.ptr.as_ptr().cast::<u8>()
    }

    /// Zero-copy view of a slot's frame bytes.
    ///
    /// The slice aliases memory the engine process writes. The published slot
    /// is safe to read until the writer comes back around to the same index;
    /// the generation counter detects that.
    pub(crate) fn frame(&self, slot: u32) -> &Frame {
        let bytes = unsafe {
            slice::from_raw_parts(
                self.base().add(self.layout.slot_offset(slot)),
                self.layout.frame_bytes(),
            )
        };
        Frame::ref_cast(bytes)
    }

    /// Mutable view of the whole slot array.
    ///
    /// # Safety
    ///
    /// The caller must be the region's single writer (the engine process)
    /// and must not hold two such slices at once.
    pub(crate) unsafe fn slots_mut(&self) -> &mut [u8] {
        let len = SLOT_COUNT as usize * self.layout.frame_bytes();
        unsafe { slice::from_raw_parts_mut(self.base(), len) }
    }

    fn generation_cell(&self, slot: u32) -> &AtomicU32 {
        let off = self.layout.control_offset() + slot as usize * std::mem::size_of::<AtomicU32>();
        unsafe { &*self.base().add(off).cast::<AtomicU32>() }
    }

    /// Current generation of a slot. Even means no write in progress.
    pub(crate) fn generation(&self, slot: u32) -> u32 {
        self.generation_cell(slot).load(Ordering::Acquire)
    }

    /// Writer side: mark a slot as under construction (generation goes odd).
    pub(crate) fn begin_write(&self, slot: u32) {
        let cell = self.generation_cell(slot);
        let current = cell.load(Ordering::Relaxed);
        debug_assert!(current % 2 == 0, "begin_write on a slot already odd");
        cell.store(current.wrapping_add(1), Ordering::Release);
    }

    /// Writer side: mark the write complete and return the new (even)
    /// generation to publish alongside the slot index.
    pub(crate) fn end_write(&self, slot: u32) -> u32 {
        let cell = self.generation_cell(slot);
        let done = cell.load(Ordering::Relaxed).wrapping_add(1);
        cell.store(done, Ordering::Release);
        done
    }
}

impl Drop for SharedRing {
    fn drop(&mut self) {
        self.unlink();
    }
}

fn region_size(fd: &impl AsFd) -> io::Result<usize> {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    let rc = unsafe { libc::fstat(fd.as_fd().as_raw_fd(), stat.as_mut_ptr()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { stat.assume_init() }.st_size as usize)
}

fn map_region(fd: &impl AsFd, len: usize) -> io::Result<Mapping> {
    let length = NonZeroUsize::new(len)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "zero-length shm region"))?;
    let ptr = unsafe {
        mman::mmap(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )?
    };
    Ok(Mapping { ptr, len })
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_name(tag: &str) -> String {
        format!("/posed-test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn layout_math() {
        let layout = RingLayout::new(1536);
        assert_eq!(layout.slot_offset(0), 0);
        assert_eq!(layout.slot_offset(1), 1536);
        assert_eq!(layout.slot_offset(2), 3072);
        assert_eq!(layout.control_offset(), 3 * 1536);
        assert_eq!(layout.region_len() % page_size::get(), 0);
        // An odd frame size must not leave the counters misaligned.
        let odd = RingLayout::new(100);
        assert_eq!(odd.control_offset() % 64, 0);
    }

    #[test]
    fn create_write_attach_read() {
        let name = test_name("rw");
        let ring = SharedRing::create(&name, 256).unwrap();
        let reader = SharedRing::attach(&name, 256).unwrap();

        ring.begin_write(1);
        unsafe {
            let slots = ring.slots_mut();
            slots[256..260].copy_from_slice(&7.5f32.to_le_bytes());
        }
        let generation = ring.end_write(1);

        assert_eq!(generation, 2);
        assert_eq!(reader.generation(1), 2);
        assert_eq!(reader.frame(1).float(0), 7.5);
        assert_eq!(reader.frame(0).float(0), 0.0);
    }

    #[test]
    fn generation_detects_rewrite() {
        let name = test_name("generation");
        let ring = SharedRing::create(&name, 64).unwrap();
        ring.begin_write(0);
        let first = ring.end_write(0);
        ring.begin_write(0);
        // A reader holding `first` must now see a mismatch.
        assert_ne!(ring.generation(0), first);
        let second = ring.end_write(0);
        assert_eq!(second, first + 2);
    }

    #[test]
    fn create_rejects_existing_name() {
        let name = test_name("dup");
        let _ring = SharedRing::create(&name, 64).unwrap();
        let err = SharedRing::create(&name, 64).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
    }

    #[test]
    fn unlink_is_idempotent() {
        let name = test_name("unlink");
        let ring = SharedRing::create(&name, 64).unwrap();
        ring.unlink();
        ring.unlink();
        // The name is free again.
        let again = SharedRing::create(&name, 64).unwrap();
        again.unlink();
    }

    #[test]
    fn attach_checks_size() {
        let name = test_name("size");
        let _ring = SharedRing::create(&name, 64).unwrap();
        let err = SharedRing::attach(&name, 1 << 20).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
