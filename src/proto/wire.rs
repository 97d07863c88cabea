//! On-the-wire layout of command-channel and slot-channel messages.
//!
//! Both channels are message-oriented (`SOCK_SEQPACKET`); every message is a
//! fixed header optionally followed by a payload. Headers are plain
//! `#[repr(C)]` structs read and written with `zerocopy`; both endpoints run
//! on the same machine, so fields are native-endian.

use std::{error, fmt};

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Operation tag of a command-channel message.
///
/// Values below 64 flow session -> engine, values from 64 up are replies
/// engine -> session.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Opcode {
    /// Bind an animator kind and motion source (first-command init path).
    Init = 1,
    /// Attach the engine to the named shared-memory ring.
    SetShm = 2,
    /// Change playback speed.
    SetSpeed = 3,
    /// Freeze the playback cursor.
    Pause = 4,
    /// Resume after `Pause`.
    Resume = 5,
    /// Move the playback cursor to an absolute time.
    Seek = 6,
    /// Detach, release the animator, and exit cleanly.
    Shutdown = 7,

    /// Animator initialized; payload carries the skeleton.
    InitSuccess = 64,
    /// Animator initialization failed; payload carries the reason.
    InitFailure = 65,
    /// Acknowledgement of a command that set [`MessageFlags::REPLY_REQUIRED`].
    Ack = 66,
}

/// Returned when a header carries an opcode this build does not know.
#[derive(Debug)]
pub(crate) struct InvalidOpcodeError(pub u32);

impl fmt::Display for InvalidOpcodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown opcode ({})", self.0)
    }
}

impl error::Error for InvalidOpcodeError {}

impl TryFrom<u32> for Opcode {
    type Error = InvalidOpcodeError;

    fn try_from(value: u32) -> Result<Opcode, InvalidOpcodeError> {
        match value {
            1 => Ok(Opcode::Init),
            2 => Ok(Opcode::SetShm),
            3 => Ok(Opcode::SetSpeed),
            4 => Ok(Opcode::Pause),
            5 => Ok(Opcode::Resume),
            6 => Ok(Opcode::Seek),
            7 => Ok(Opcode::Shutdown),
            64 => Ok(Opcode::InitSuccess),
            65 => Ok(Opcode::InitFailure),
            66 => Ok(Opcode::Ack),
            n => Err(InvalidOpcodeError(n)),
        }
    }
}

bitflags! {
    /// Flag word of a [`MessageHeader`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct MessageFlags: u32 {
        /// The sender expects a paired `Ack` within one engine iteration.
        const REPLY_REQUIRED = 1 << 0;
    }
}

/// Fixed 16-byte header that starts every command-channel message.
///
/// `value` is overloaded per opcode: `f32` bits for `SetSpeed`/`Seek`, the
/// frame byte size for `InitSuccess`, the acknowledged opcode for `Ack`,
/// zero otherwise.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub(crate) struct MessageHeader {
    /// Tag; see [`Opcode`].
    pub opcode: u32,
    /// See [`MessageFlags`].
    pub flags: u32,
    /// Bytes of payload following the header.
    pub payload_len: u32,
    /// Per-opcode immediate value.
    pub value: u32,
}

/// One published frame: sent engine -> session after each `write_frame`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub(crate) struct SlotRecord {
    /// Ring slot the frame was written into.
    pub slot: u32,
    /// Slot generation after the write (even; see the ring's seqlock).
    pub generation: u32,
    /// Monotonic production counter, starting at 1.
    pub seq: u64,
}
