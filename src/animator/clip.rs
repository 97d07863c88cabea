//! Clip-file animator.
//!
//! Samples a pre-baked animation clip: a skeleton plus dense per-frame
//! matrix keyframes at a fixed rate, stored as a bincode blob on disk.
//! Playback interpolates linearly between neighboring keyframes and wraps
//! at the end of the clip (it loops; it does not clamp).

use std::fs::File;
use std::io::BufReader;

use log::{debug, error};
use serde::{Deserialize, Serialize};

use super::{Animator, InitError, write_zero_pose};
use crate::skeleton::{BYTES_PER_BONE, SkeletonDescriptor};

pub(super) fn check_source(source: &str) -> Result<(), String> {
    if source.is_empty() {
        return Err("clip source is empty".to_owned());
    }
    if !std::path::Path::new(source).is_file() {
        return Err(format!("clip file '{source}' does not exist"));
    }
    Ok(())
}

/// On-disk clip format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipFile {
    /// Skeleton the keyframes are expressed against.
    pub skeleton: SkeletonDescriptor,
    /// Keyframe rate in frames per second.
    pub fps: f32,
    /// Dense keyframes: `frames[k][bone]` is a row-major 4x4 matrix.
    pub frames: Vec<Vec<[f32; 16]>>,
}

impl ClipFile {
    /// Decode a clip from a file and check its shape.
    pub fn load(path: &str) -> Result<ClipFile, InitError> {
        let file = File::open(path)?;
        let clip: ClipFile = bincode::deserialize_from(BufReader::new(file))
            .map_err(|e| InitError(format!("clip '{path}' did not decode: {e}")))?;
        clip.validate().map_err(InitError)?;
        Ok(clip)
    }

    /// Encode the clip to a file. Authoring-side helper used by tooling and
    /// tests; the engine never writes clips.
    pub fn save(&self, path: &str) -> Result<(), InitError> {
        self.validate().map_err(InitError)?;
        let file = File::create(path)?;
        bincode::serialize_into(file, self).map_err(|e| InitError(e.to_string()))
    }

    fn validate(&self) -> Result<(), String> {
        self.skeleton.validate()?;
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return Err(format!("clip fps {} is not positive", self.fps));
        }
        if self.frames.is_empty() {
            return Err("clip has no keyframes".to_owned());
        }
        let bones = self.skeleton.num_bones();
        for (k, frame) in self.frames.iter().enumerate() {
            if frame.len() != bones {
                return Err(format!(
                    "keyframe {k} has {} bones, skeleton has {bones}",
                    frame.len()
                ));
            }
        }
        Ok(())
    }
}

/// See the module docs.
#[derive(Debug, Default)]
pub struct ClipAnimator {
    clip: Option<ClipFile>,
    cursor: f32,
}

impl ClipAnimator {
    /// New, uninitialized animator.
    pub fn new() -> ClipAnimator {
        ClipAnimator::default()
    }
}

impl Animator for ClipAnimator {
    fn initialize(&mut self, source: &str) -> Result<(), InitError> {
        let clip = ClipFile::load(source)?;
        debug!(
            "clip '{}': {} bones, {} keyframes at {} fps",
            source,
            clip.skeleton.num_bones(),
            clip.frames.len(),
            clip.fps
        );
        self.clip = Some(clip);
        self.cursor = 0.0;
        Ok(())
    }

    fn skeleton(&self) -> SkeletonDescriptor {
        match &self.clip {
            Some(clip) => clip.skeleton.clone(),
            None => SkeletonDescriptor::chain(0),
        }
    }

    fn frame_bytes(&self) -> u32 {
        match &self.clip {
            Some(clip) => clip.skeleton.num_bones() as u32 * BYTES_PER_BONE,
            None => 0,
        }
    }

    fn write_frame(&mut self, region: &mut [u8], offset: usize, dt: f32, speed: f32) {
        let Some(clip) = &self.clip else {
            error!("write_frame before initialize");
            return;
        };
        self.cursor += dt * speed;
        let bones = clip.skeleton.num_bones();
        let end = offset + bones * 64;
        if region.len() < end {
            error!("frame region too small ({} < {end})", region.len());
            write_zero_pose(region, offset, region.len().saturating_sub(offset) / 64);
            return;
        }

        let count = clip.frames.len();
        let position = (self.cursor * clip.fps).rem_euclid(count as f32);
        let lower = (position as usize).min(count - 1);
        let upper = (lower + 1) % count;
        let fraction = position - lower as f32;

        let mut matrix = [0f32; 16];
        for bone in 0..bones {
            let a = &clip.frames[lower][bone];
            let b = &clip.frames[upper][bone];
            for i in 0..16 {
                matrix[i] = a[i] + (b[i] - a[i]) * fraction;
            }
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
    use crate::skeleton::SkeletonDescriptor;

    fn two_frame_clip() -> ClipFile {
        ClipFile {
            skeleton: SkeletonDescriptor::chain(1),
            fps: 1.0,
            frames: vec![vec![[0.0; 16]], vec![[2.0; 16]]],
        }
    }

    fn first_float(region: &[u8]) -> f32 {
        f32::from_le_bytes(region[0..4].try_into().unwrap())
    }

    #[test]
    fn interpolates_between_keyframes() {
        let mut animator = ClipAnimator {
            clip: Some(two_frame_clip()),
            cursor: 0.0,
        };
        let mut region = vec![0u8; 64];

        animator.seek(0.5);
        animator.write_frame(&mut region, 0, 0.0, 1.0);
        assert_eq!(first_float(&region), 1.0);
    }

    #[test]
    fn wraps_at_clip_end() {
        let mut animator = ClipAnimator {
            clip: Some(two_frame_clip()),
            cursor: 0.0,
        };
        let mut region = vec![0u8; 64];

        // 2.5 s into a 2-keyframe 1 fps clip lands halfway between the
        // first and second keyframes again.
        animator.seek(2.5);
        animator.write_frame(&mut region, 0, 0.0, 1.0);
        assert_eq!(first_float(&region), 1.0);

        // 1.5 s interpolates from the last keyframe back to the first.
        animator.seek(1.5);
        animator.write_frame(&mut region, 0, 0.0, 1.0);
        assert_eq!(first_float(&region), 1.0);
    }

    #[test]
    fn load_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walk.clip");
        let path = path.to_str().unwrap();

        two_frame_clip().save(path).unwrap();
        check_source(path).unwrap();
        let loaded = ClipFile::load(path).unwrap();
        assert_eq!(loaded.frames.len(), 2);
        assert_eq!(loaded.skeleton.num_bones(), 1);
    }

    #[test]
    fn empty_clip_is_rejected() {
        let mut clip = two_frame_clip();
        clip.frames.clear();
        assert!(clip.validate().is_err());
    }
}
