//! Animator interface and the kinds shipped with the engine.
//!
//! An animator lives inside the engine process, one per session. It does all
//! of its heavy loading in [`Animator::initialize`] and afterwards only
//! writes frames into caller-supplied memory; the write path must not
//! allocate or touch the filesystem. The core treats every animator as an
//! infinite producer; whether a clip loops or clamps at its end is the
//! animator's documented choice.

mod clip;
mod testing;
mod wave;

use std::{error, fmt, io};

pub use clip::{ClipAnimator, ClipFile};
pub use testing::{ClockAnimator, FailingAnimator, HangingAnimator};
pub use wave::WaveAnimator;

use crate::skeleton::SkeletonDescriptor;

/// Failure reason returned by [`Animator::initialize`]. Carried verbatim to
/// the session inside the `InitFailure` reply.
#[derive(Debug)]
pub struct InitError(pub String);

impl InitError {
    /// Build an error from anything displayable.
    pub fn new(reason: impl fmt::Display) -> InitError {
        InitError(reason.to_string())
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl error::Error for InitError {}

impl From<io::Error> for InitError {
    fn from(err: io::Error) -> InitError {
        InitError(err.to_string())
    }
}

/// The capability set the engine requires from a motion source.
///
/// Only `initialize` may fail. All other operations are infallible from the
/// engine's perspective; an implementation that cannot produce a frame must
/// write the zero pose (identity matrices) and log the condition.
pub trait Animator: Send {
    /// Load the motion source. Blocking is permitted here and only here.
    fn initialize(&mut self, source: &str) -> Result<(), InitError>;

    /// Skeleton metadata. Pure after `initialize`.
    fn skeleton(&self) -> SkeletonDescriptor;

    /// Bytes of one frame. Pure after `initialize`, stable for the session.
    fn frame_bytes(&self) -> u32;

    /// Advance the playback cursor by `dt * speed` seconds and write exactly
    /// `frame_bytes()` bytes at `region[offset..]`. No I/O, no allocation.
    fn write_frame(&mut self, region: &mut [u8], offset: usize, dt: f32, speed: f32);

    /// Set the playback cursor. May be a no-op for stateless animators.
    fn seek(&mut self, time: f32);
}

/// One registered animator kind.
pub struct AnimatorKind {
    /// Kind name as used in `create` calls and on the command channel.
    pub name: &'static str,
    /// Cheap parent-side sanity check of the source reference, run before a
    /// session is created. Heavy validation stays in `initialize`.
    check_source: fn(&str) -> Result<(), String>,
    construct: fn() -> Box<dyn Animator>,
}

impl AnimatorKind {
    /// Validate a source reference without constructing anything.
    pub fn check_source(&self, source: &str) -> Result<(), String> {
        (self.check_source)(source)
    }

    /// Construct an uninitialized animator of this kind.
    pub fn construct(&self) -> Box<dyn Animator> {
        (self.construct)()
    }
}

impl fmt::Debug for AnimatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnimatorKind")
            .field("name", &self.name)
            .finish()
    }
}

/// The kinds this build knows. `clock`, `failing`, and `hanging` are test
/// doubles but stay registered everywhere; the engine binary must be able
/// to construct them for the integration suite.
pub static KINDS: &[AnimatorKind] = &[
    AnimatorKind {
        name: "wave",
        check_source: wave::check_source,
        construct: || Box::new(WaveAnimator::new()),
    },
    AnimatorKind {
        name: "clip",
        check_source: clip::check_source,
        construct: || Box::new(ClipAnimator::new()),
    },
    AnimatorKind {
        name: "clock",
        check_source: testing::check_clock_source,
        construct: || Box::new(ClockAnimator::new()),
    },
    AnimatorKind {
        name: "failing",
        check_source: |_| Ok(()),
        construct: || Box::new(FailingAnimator),
    },
    AnimatorKind {
        name: "hanging",
        check_source: |_| Ok(()),
        construct: || Box::new(HangingAnimator),
    },
];

/// Look up a kind by name.
pub fn lookup(name: &str) -> Option<&'static AnimatorKind> {
    KINDS.iter().find(|k| k.name == name)
}

/// Identity matrix, row-major.
pub(crate) const IDENTITY: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Write one matrix as 16 little-endian floats.
pub(crate) fn write_matrix(dst: &mut [u8], matrix: &[f32; 16]) {
    for (i, v) in matrix.iter().enumerate() {
        dst[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
    }
}

/// The well-defined fallback pose: identity transforms for every bone.
pub(crate) fn write_zero_pose(region: &mut [u8], offset: usize, num_bones: usize) {
    for bone in 0..num_bones {
        write_matrix(&mut region[offset + bone * 64..], &IDENTITY);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn all_kinds_resolve() {
        for name in ["wave", "clip", "clock", "failing", "hanging"] {
            assert!(lookup(name).is_some(), "kind {name} missing");
        }
        assert!(lookup("vae").is_none());
    }

    #[test]
    fn zero_pose_is_identity() {
        let mut region = vec![0u8; 2 * 64];
        write_zero_pose(&mut region, 0, 2);
        let m00 = f32::from_le_bytes(region[0..4].try_into().unwrap());
        let m11 = f32::from_le_bytes(region[20..24].try_into().unwrap());
        let m01 = f32::from_le_bytes(region[4..8].try_into().unwrap());
        assert_eq!(m00, 1.0);
        assert_eq!(m11, 1.0);
        assert_eq!(m01, 0.0);
    }
}
