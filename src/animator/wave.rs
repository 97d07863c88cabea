//! Procedural sine-wave animator.
//!
//! Source reference is the bone count, e.g. `"24"`. Each bone carries an
//! identity matrix whose translation row oscillates with a per-bone phase
//! offset. Loops forever by construction.

use log::debug;

use super::{Animator, IDENTITY, InitError, write_zero_pose};
use crate::skeleton::{BYTES_PER_BONE, SkeletonDescriptor};

const MAX_BONES: usize = 1024;

pub(super) fn check_source(source: &str) -> Result<(), String> {
    parse_bones(source).map(|_| ())
}

fn parse_bones(source: &str) -> Result<usize, String> {
    let bones: usize = source
        .parse()
        .map_err(|_| format!("wave source must be a bone count, got '{source}'"))?;
    if bones == 0 || bones > MAX_BONES {
        return Err(format!("bone count {bones} outside 1..={MAX_BONES}"));
    }
    Ok(bones)
}

/// See the module docs.
#[derive(Debug)]
pub struct WaveAnimator {
    bones: usize,
    cursor: f32,
}

impl WaveAnimator {
    /// New, uninitialized animator.
    pub fn new() -> WaveAnimator {
        WaveAnimator { bones: 0, cursor: 0.0 }
    }
}

impl Default for WaveAnimator {
    fn default() -> Self {
        WaveAnimator::new()
    }
}

impl Animator for WaveAnimator {
    fn initialize(&mut self, source: &str) -> Result<(), InitError> {
        self.bones = parse_bones(source).map_err(InitError)?;
        debug!("wave animator ready with {} bones", self.bones);
        Ok(())
    }

    fn skeleton(&self) -> SkeletonDescriptor {
        SkeletonDescriptor::chain(self.bones)
    }

    fn frame_bytes(&self) -> u32 {
        self.bones as u32 * BYTES_PER_BONE
    }

    fn write_frame(&mut self, region: &mut [u8], offset: usize, dt: f32, speed: f32) {
        if self.bones == 0 {
            return;
        }
        self.cursor += dt * speed;
        let end = offset + self.frame_bytes() as usize;
        if region.len() < end {
            log::error!("frame region too small ({} < {end})", region.len());
            write_zero_pose(region, offset, region.len().saturating_sub(offset) / 64);
            return;
        }
        for bone in 0..self.bones {
            let phase = self.cursor * std::f32::consts::TAU + bone as f32 * 0.3;
            let mut matrix = IDENTITY;
            // Translation in the last row (row-major).
            matrix[12] = phase.cos() * 0.1;
            matrix[13] = phase.sin() * 0.1 + bone as f32;
            super::write_matrix(&mut region[offset + bone * 64..], &matrix);
        }
    }

    fn seek(&mut self, time: f32) {
        self.cursor = time;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn source_is_a_bone_count() {
        assert!(check_source("24").is_ok());
        assert!(check_source("0").is_err());
        assert!(check_source("skeleton.bvh").is_err());
        assert!(check_source("100000").is_err());
    }

    #[test]
    fn frames_advance_with_the_cursor() {
        let mut wave = WaveAnimator::new();
        wave.initialize("4").unwrap();
        assert_eq!(wave.frame_bytes(), 256);

        let mut region = vec![0u8; 256];
        wave.write_frame(&mut region, 0, 0.25, 1.0);
        let first = region.clone();
        wave.write_frame(&mut region, 0, 0.25, 1.0);
        assert_ne!(first, region);

        // dt = 0 freezes the pose.
        let frozen = region.clone();
        wave.write_frame(&mut region, 0, 0.0, 1.0);
        assert_eq!(frozen, region);
    }

    #[test]
    fn seek_is_reproducible() {
        let mut a = WaveAnimator::new();
        let mut b = WaveAnimator::new();
        a.initialize("2").unwrap();
        b.initialize("2").unwrap();
        a.seek(1.5);
        b.seek(1.5);
        let mut ra = vec![0u8; 128];
        let mut rb = vec![0u8; 128];
        a.write_frame(&mut ra, 0, 0.0, 1.0);
        b.write_frame(&mut rb, 0, 0.0, 1.0);
        assert_eq!(ra, rb);
    }
}
