//! Real-time skeletal animation streaming core.
//!
//! A session binds a CPU-bound compute worker (the engine process, one per
//! session) to a shared-memory frame ring and fans frames out to any number
//! of subscribers over a cooperative control plane. Frames are dense arrays
//! of per-bone 4x4 `f32` matrices, exchanged through the ring without
//! serialization and delivered to subscribers as raw byte views.
//!
//! The pieces, leaves first:
//!
//! - [`Animator`]: the plug-in contract an engine drives. Loads a motion
//!   source once, then writes one frame per tick into caller-supplied
//!   memory.
//! - [`engine`]: the per-session worker process. Fixed-rate loop: drain
//!   commands, write a frame into the next ring slot, publish the slot.
//! - The shared-memory ring (internal): three slots plus per-slot
//!   generation counters for tear detection.
//! - [`Session`]: the control plane. Spawns the engine, runs the handshake,
//!   owns the shared memory, and runs the broadcast task.
//! - [`SessionRegistry`]: the process-wide id -> session map the API
//!   collaborator talks to.
//!
//! Transports (WebSocket framing, upload, auth) live outside this crate;
//! [`FrameSink`] is the seam they implement.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

mod channel;
mod error;
mod proto;
mod registry;
mod session;
mod shm;
mod sink;
mod skeleton;

pub mod animator;
pub mod engine;

pub use crate::animator::{Animator, InitError};
pub use crate::error::{Error, Result};
pub use crate::registry::SessionRegistry;
pub use crate::session::{
    DEFAULT_FPS, ENGINE_PATH_ENV, EngineLauncher, Session, SessionId, SessionState, SubscriptionId,
};
pub use crate::shm::{Frame, SLOT_COUNT};
pub use crate::sink::{ChannelSink, FrameSink};
pub use crate::skeleton::{BYTES_PER_BONE, BindPose, SkeletonDescriptor};
