//! Animator test doubles.
//!
//! Registered in every build so the engine binary can be driven by the
//! integration suite without extra wiring.

use super::{Animator, IDENTITY, InitError, write_zero_pose};
use crate::skeleton::{BYTES_PER_BONE, SkeletonDescriptor};

const DEFAULT_BONES: usize = 24;

pub(super) fn check_clock_source(source: &str) -> Result<(), String> {
    if source.is_empty() {
        return Ok(());
    }
    source
        .parse::<usize>()
        .ok()
        .filter(|&n| n > 0 && n <= 1024)
        .map(|_| ())
        .ok_or_else(|| format!("clock source must be a bone count, got '{source}'"))
}

/// Writes the accumulated animation time into matrix element [0][0] of bone
/// 0 and identity everywhere else, which makes elapsed animation time
/// observable from delivered frames.
#[derive(Debug)]
pub struct ClockAnimator {
    bones: usize,
    elapsed: f32,
}

impl ClockAnimator {
    /// New clock over the default 24-bone chain.
    pub fn new() -> ClockAnimator {
        ClockAnimator {
            bones: DEFAULT_BONES,
            elapsed: 0.0,
        }
    }

    /// Animation seconds accumulated so far.
    pub fn elapsed(&self) -> f32 {
        self.elapsed
    }
}

impl Default for ClockAnimator {
    fn default() -> Self {
        ClockAnimator::new()
    }
}

impl Animator for ClockAnimator {
    fn initialize(&mut self, source: &str) -> Result<(), InitError> {
        if !source.is_empty() {
            self.bones = source
                .parse()
                .map_err(|_| InitError(format!("bad bone count '{source}'")))?;
        }
        Ok(())
    }

    fn skeleton(&self) -> SkeletonDescriptor {
        SkeletonDescriptor::chain(self.bones)
    }

    fn frame_bytes(&self) -> u32 {
        self.bones as u32 * BYTES_PER_BONE
    }

    fn write_frame(&mut self, region: &mut [u8], offset: usize, dt: f32, speed: f32) {
        self.elapsed += dt * speed;
        write_zero_pose(region, offset, self.bones);
        let mut head = IDENTITY;
        head[0] = self.elapsed;
        super::write_matrix(&mut region[offset..], &head);
    }

    fn seek(&mut self, time: f32) {
        self.elapsed = time;
    }
}

/// `initialize` never returns. Exercises the session's handshake deadline:
/// the parent times out, reports `InitTimeout`, and kills the engine.
#[derive(Debug)]
pub struct HangingAnimator;

impl Animator for HangingAnimator {
    fn initialize(&mut self, _source: &str) -> Result<(), InitError> {
        loop {
            std::thread::sleep(std::time::Duration::from_secs(60));
        }
    }

    fn skeleton(&self) -> SkeletonDescriptor {
        SkeletonDescriptor::chain(0)
    }

    fn frame_bytes(&self) -> u32 {
        0
    }

    fn write_frame(&mut self, _region: &mut [u8], _offset: usize, _dt: f32, _speed: f32) {}

    fn seek(&mut self, _time: f32) {}
}

/// `initialize` always fails. Exercises the session's init-failure teardown.
#[derive(Debug)]
pub struct FailingAnimator;

impl Animator for FailingAnimator {
    fn initialize(&mut self, source: &str) -> Result<(), InitError> {
        Err(InitError(format!(
            "failing animator refuses source '{source}'"
        )))
    }

    fn skeleton(&self) -> SkeletonDescriptor {
        SkeletonDescriptor::chain(0)
    }

    fn frame_bytes(&self) -> u32 {
        0
    }

    fn write_frame(&mut self, _region: &mut [u8], _offset: usize, _dt: f32, _speed: f32) {}

    fn seek(&mut self, _time: f32) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clock_accumulates_scaled_time() {
        let mut clock = ClockAnimator::new();
        clock.initialize("4").unwrap();
        let mut region = vec![0u8; 4 * 64];

        clock.write_frame(&mut region, 0, 0.5, 1.0);
        clock.write_frame(&mut region, 0, 0.5, 2.0);
        assert_eq!(clock.elapsed(), 1.5);
        let head = f32::from_le_bytes(region[0..4].try_into().unwrap());
        assert_eq!(head, 1.5);
    }

    #[test]
    fn paused_clock_is_constant() {
        let mut clock = ClockAnimator::new();
        clock.initialize("").unwrap();
        let mut region = vec![0u8; 24 * 64];
        clock.write_frame(&mut region, 0, 0.25, 1.0);
        let before = clock.elapsed();
        clock.write_frame(&mut region, 0, 0.0, 1.0);
        assert_eq!(clock.elapsed(), before);
    }

    #[test]
    fn failing_animator_fails() {
        assert!(FailingAnimator.initialize("anything").is_err());
    }
}
