//! Command-channel protocol.
//!
//! Messages are tagged records `(opcode, flags, payload)`. The session sends
//! commands, the engine sends replies; both directions share the header
//! layout defined in [`wire`]. String arguments travel NUL-terminated; the
//! skeleton descriptor inside `InitSuccess` is a bincode blob (it is the one
//! variable-shape structure in the protocol).

mod argument;
pub(crate) mod wire;

use std::{error, fmt};

use smallvec::SmallVec;
use zerocopy::{FromBytes, IntoBytes};

use crate::skeleton::SkeletonDescriptor;
use argument::ArgumentIterator;
pub(crate) use wire::{MessageFlags, MessageHeader, Opcode, SlotRecord};

/// Upper bound on a single command-channel message. Commands are tiny; the
/// only grower is the skeleton blob, and a skeleton anywhere near this size
/// is a bug somewhere else.
pub(crate) const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Inline capacity for encoded messages; everything except `InitSuccess`
/// fits without touching the heap.
pub(crate) type MessageBuf = SmallVec<[u8; 144]>;

/// Error that may occur while parsing or building a channel message.
#[derive(Debug)]
pub(crate) enum ProtoError {
    /// Not enough data for the fixed header (short read).
    ShortHeader(usize),
    /// Header carries an opcode this build does not know.
    UnknownOperation(u32),
    /// Header's `payload_len` disagrees with the received datagram.
    PayloadMismatch(usize, usize),
    /// A required string argument is missing or malformed.
    BadArgument,
    /// The message is too large to be legitimate.
    Oversized(usize),
    /// The opcode is valid but not meaningful in this direction.
    UnexpectedOperation(Opcode),
    /// The skeleton blob failed to (de)serialize.
    Skeleton(String),
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::ShortHeader(len) => write!(
                f,
                "short read of message header ({} < {})",
                len,
                std::mem::size_of::<MessageHeader>()
            ),
            ProtoError::UnknownOperation(op) => write!(f, "unknown opcode ({op})"),
            ProtoError::PayloadMismatch(claimed, actual) => {
                write!(f, "payload length mismatch ({claimed} claimed, {actual} received)")
            }
            ProtoError::BadArgument => write!(f, "missing or malformed string argument"),
            ProtoError::Oversized(len) => write!(f, "message of {len} bytes exceeds limit"),
            ProtoError::UnexpectedOperation(op) => {
                write!(f, "opcode {op:?} not valid in this direction")
            }
            ProtoError::Skeleton(err) => write!(f, "skeleton blob: {err}"),
        }
    }
}

impl error::Error for ProtoError {}

impl From<ProtoError> for std::io::Error {
    fn from(err: ProtoError) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::InvalidData, err)
    }
}

/// A control command, session -> engine.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Command {
    /// Bind animator kind and motion source (first-command init path).
    Init { kind: String, source: String },
    /// Attach to the named shared-memory ring.
    SetShm { name: String },
    /// Change playback speed.
    SetSpeed { value: f32 },
    /// Freeze the playback cursor.
    Pause,
    /// Resume after pause.
    Resume,
    /// Move the playback cursor to `time` seconds.
    Seek { time: f32 },
    /// Clean shutdown.
    Shutdown,
}

/// A reply, engine -> session.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Reply {
    /// Handshake success: advertised frame size and skeleton.
    InitSuccess {
        frame_bytes: u32,
        skeleton: SkeletonDescriptor,
    },
    /// Handshake failure with the animator's reason.
    InitFailure { reason: String },
    /// Acknowledgement of a `REPLY_REQUIRED` command.
    Ack { opcode: Opcode },
}

fn split_message(buf: &[u8]) -> Result<(MessageHeader, &[u8]), ProtoError> {
    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(ProtoError::Oversized(buf.len()));
    }
    let (header, payload) =
        MessageHeader::read_from_prefix(buf).map_err(|_| ProtoError::ShortHeader(buf.len()))?;
    if header.payload_len as usize != payload.len() {
        return Err(ProtoError::PayloadMismatch(
            header.payload_len as usize,
            payload.len(),
        ));
    }
    Ok((header, payload))
}

fn assemble(opcode: Opcode, flags: MessageFlags, value: u32, payload: &[u8]) -> MessageBuf {
    let header = MessageHeader {
        opcode: opcode as u32,
        flags: flags.bits(),
        payload_len: payload.len() as u32,
        value,
    };
    let mut buf = MessageBuf::new();
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn push_str(buf: &mut MessageBuf, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

impl Command {
    /// Serialize into a single datagram.
    pub(crate) fn encode(&self, flags: MessageFlags) -> MessageBuf {
        let (opcode, value) = match self {
            Command::Init { .. } => (Opcode::Init, 0),
            Command::SetShm { .. } => (Opcode::SetShm, 0),
            Command::SetSpeed { value } => (Opcode::SetSpeed, value.to_bits()),
            Command::Pause => (Opcode::Pause, 0),
            Command::Resume => (Opcode::Resume, 0),
            Command::Seek { time } => (Opcode::Seek, time.to_bits()),
            Command::Shutdown => (Opcode::Shutdown, 0),
        };
        let mut payload = MessageBuf::new();
        match self {
            Command::Init { kind, source } => {
                push_str(&mut payload, kind);
                push_str(&mut payload, source);
            }
            Command::SetShm { name } => push_str(&mut payload, name),
            _ => {}
        }
        assemble(opcode, flags, value, &payload)
    }

    /// Parse a datagram received on the engine side.
    pub(crate) fn decode(buf: &[u8]) -> Result<(Command, MessageFlags), ProtoError> {
        let (header, payload) = split_message(buf)?;
        let opcode =
            Opcode::try_from(header.opcode).map_err(|e| ProtoError::UnknownOperation(e.0))?;
        let flags = MessageFlags::from_bits_truncate(header.flags);
        let mut args = ArgumentIterator::new(payload);
        let command = match opcode {
            Opcode::Init => Command::Init {
                kind: args.fetch_str().ok_or(ProtoError::BadArgument)?.to_owned(),
                source: args.fetch_str().ok_or(ProtoError::BadArgument)?.to_owned(),
            },
            Opcode::SetShm => Command::SetShm {
                name: args.fetch_str().ok_or(ProtoError::BadArgument)?.to_owned(),
            },
            Opcode::SetSpeed => Command::SetSpeed {
                value: f32::from_bits(header.value),
            },
            Opcode::Pause => Command::Pause,
            Opcode::Resume => Command::Resume,
            Opcode::Seek => Command::Seek {
                time: f32::from_bits(header.value),
            },
            Opcode::Shutdown => Command::Shutdown,
            other => return Err(ProtoError::UnexpectedOperation(other)),
        };
        Ok((command, flags))
    }

    /// Opcode this command is tagged with.
    pub(crate) fn opcode(&self) -> Opcode {
        match self {
            Command::Init { .. } => Opcode::Init,
            Command::SetShm { .. } => Opcode::SetShm,
            Command::SetSpeed { .. } => Opcode::SetSpeed,
            Command::Pause => Opcode::Pause,
            Command::Resume => Opcode::Resume,
            Command::Seek { .. } => Opcode::Seek,
            Command::Shutdown => Opcode::Shutdown,
        }
    }
}

impl Reply {
    /// Serialize into a single datagram.
    pub(crate) fn encode(&self) -> Result<MessageBuf, ProtoError> {
        match self {
            Reply::InitSuccess {
                frame_bytes,
                skeleton,
            } => {
                let blob = bincode::serialize(skeleton)
                    .map_err(|e| ProtoError::Skeleton(e.to_string()))?;
                if blob.len() > MAX_MESSAGE_SIZE - std::mem::size_of::<MessageHeader>() {
                    return Err(ProtoError::Oversized(blob.len()));
                }
                Ok(assemble(
                    Opcode::InitSuccess,
                    MessageFlags::empty(),
                    *frame_bytes,
                    &blob,
                ))
            }
            Reply::InitFailure { reason } => {
                let mut payload = MessageBuf::new();
                push_str(&mut payload, reason);
                Ok(assemble(
                    Opcode::InitFailure,
                    MessageFlags::empty(),
                    0,
                    &payload,
                ))
            }
            Reply::Ack { opcode } => Ok(assemble(
                Opcode::Ack,
                MessageFlags::empty(),
                *opcode as u32,
                &[],
            )),
        }
    }

    /// Parse a datagram received on the session side.
    pub(crate) fn decode(buf: &[u8]) -> Result<Reply, ProtoError> {
        let (header, payload) = split_message(buf)?;
        let opcode =
            Opcode::try_from(header.opcode).map_err(|e| ProtoError::UnknownOperation(e.0))?;
        match opcode {
            Opcode::InitSuccess => {
                let skeleton = bincode::deserialize(payload)
                    .map_err(|e| ProtoError::Skeleton(e.to_string()))?;
                Ok(Reply::InitSuccess {
                    frame_bytes: header.value,
                    skeleton,
                })
            }
            Opcode::InitFailure => {
                let mut args = ArgumentIterator::new(payload);
                Ok(Reply::InitFailure {
                    reason: args.fetch_str().ok_or(ProtoError::BadArgument)?.to_owned(),
                })
            }
            Opcode::Ack => Ok(Reply::Ack {
                opcode: Opcode::try_from(header.value)
                    .map_err(|e| ProtoError::UnknownOperation(e.0))?,
            }),
            other => Err(ProtoError::UnexpectedOperation(other)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::skeleton::SkeletonDescriptor;

    #[test]
    fn command_with_strings_round_trips() {
        let cmd = Command::Init {
            kind: "clip".to_owned(),
            source: "/tmp/run.clip".to_owned(),
        };
        let buf = cmd.encode(MessageFlags::REPLY_REQUIRED);
        let (decoded, flags) = Command::decode(&buf).unwrap();
        assert_eq!(decoded, cmd);
        assert!(flags.contains(MessageFlags::REPLY_REQUIRED));
    }

    #[test]
    fn speed_survives_bit_transport() {
        let buf = Command::SetSpeed { value: 1.75 }.encode(MessageFlags::empty());
        match Command::decode(&buf).unwrap().0 {
            Command::SetSpeed { value } => assert_eq!(value, 1.75),
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn init_success_carries_skeleton() {
        let skeleton = SkeletonDescriptor::chain(24);
        let reply = Reply::InitSuccess {
            frame_bytes: 24 * 64,
            skeleton: skeleton.clone(),
        };
        let buf = reply.encode().unwrap();
        match Reply::decode(&buf).unwrap() {
            Reply::InitSuccess {
                frame_bytes,
                skeleton: decoded,
            } => {
                assert_eq!(frame_bytes, 1536);
                assert_eq!(decoded, skeleton);
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn short_header_is_rejected() {
        match Command::decode(&[1, 2, 3]) {
            Err(ProtoError::ShortHeader(3)) => {}
            other => panic!("got {other:?}"),
        }
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut buf = Command::Pause.encode(MessageFlags::empty());
        buf[0..4].copy_from_slice(&9999u32.to_ne_bytes());
        assert!(matches!(
            Command::decode(&buf),
            Err(ProtoError::UnknownOperation(9999))
        ));
    }

    #[test]
    fn replies_are_not_commands() {
        let buf = Reply::Ack {
            opcode: Opcode::Pause,
        }
        .encode()
        .unwrap();
        assert!(matches!(
            Command::decode(&buf),
            Err(ProtoError::UnexpectedOperation(Opcode::Ack))
        ));
    }

    #[test]
    fn missing_terminator_is_rejected() {
        let mut buf = Command::SetShm {
            name: "/posed-s1".to_owned(),
        }
        .encode(MessageFlags::empty());
        // Chop the trailing NUL and patch the length to match.
        buf.pop();
        let len = (buf.len() - std::mem::size_of::<MessageHeader>()) as u32;
        buf[8..12].copy_from_slice(&len.to_ne_bytes());
        assert!(matches!(Command::decode(&buf), Err(ProtoError::BadArgument)));
    }
}
