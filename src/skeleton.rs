//! Skeleton description exchanged during the session handshake.
//!
//! A skeleton is produced exactly once per session, when the engine finishes
//! initializing its animator, and never changes afterwards. It is delivered
//! to clients out-of-band by the API collaborator; the core only carries it
//! across the command channel inside the `InitSuccess` reply.

use serde::{Deserialize, Serialize};

/// Bytes occupied by one bone in the default frame layout: a 4x4 matrix of
/// little-endian `f32`, row-major.
pub const BYTES_PER_BONE: u32 = 64;

/// Immutable description of a session's skeleton.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkeletonDescriptor {
    /// Bone names, in frame order.
    pub bone_names: Vec<String>,
    /// Parent index per bone; `-1` marks a root.
    pub parents: Vec<i32>,
    /// Optional rest pose.
    pub bind_pose: Option<BindPose>,
}

/// Per-bone rest pose, split into translation / rotation / scale tracks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindPose {
    /// Bone translations.
    pub positions: Vec<[f32; 3]>,
    /// Bone rotations as quaternions (x, y, z, w).
    pub rotations: Vec<[f32; 4]>,
    /// Bone scales.
    pub scales: Vec<[f32; 3]>,
}

impl SkeletonDescriptor {
    /// Build a simple chain skeleton (`bone_000` parented by `bone_001` etc.)
    /// with no bind pose. Used by the procedural animators.
    pub fn chain(num_bones: usize) -> SkeletonDescriptor {
        let bone_names = (0..num_bones).map(|i| format!("bone_{i:03}")).collect();
        let parents = (0..num_bones).map(|i| i as i32 - 1).collect();
        SkeletonDescriptor {
            bone_names,
            parents,
            bind_pose: None,
        }
    }

    /// Number of bones.
    pub fn num_bones(&self) -> usize {
        self.bone_names.len()
    }

    /// Frame size under the default layout: one 4x4 `f32` matrix per bone.
    pub fn default_frame_bytes(&self) -> u32 {
        self.num_bones() as u32 * BYTES_PER_BONE
    }

    /// Structural sanity check: track lengths must agree with the bone count
    /// and every parent index must refer to an earlier bone or be `-1`.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let n = self.num_bones();
        if n == 0 {
            return Err("skeleton has no bones".to_owned());
        }
        if self.parents.len() != n {
            return Err(format!(
                "parent table has {} entries for {} bones",
                self.parents.len(),
                n
            ));
        }
        for (i, &p) in self.parents.iter().enumerate() {
            if p >= i as i32 || p < -1 {
                return Err(format!("bone {i} has invalid parent {p}"));
            }
        }
        if let Some(pose) = &self.bind_pose {
            if pose.positions.len() != n || pose.rotations.len() != n || pose.scales.len() != n {
                return Err("bind pose track lengths do not match bone count".to_owned());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chain_skeleton_shape() {
        let skel = SkeletonDescriptor::chain(24);
        assert_eq!(skel.num_bones(), 24);
        assert_eq!(skel.parents[0], -1);
        assert_eq!(skel.parents[23], 22);
        assert_eq!(skel.default_frame_bytes(), 24 * 64);
        skel.validate().unwrap();
    }

    #[test]
    fn validate_rejects_forward_parents() {
        let mut skel = SkeletonDescriptor::chain(3);
        skel.parents[1] = 2;
        assert!(skel.validate().is_err());
    }

    #[test]
    fn validate_rejects_track_mismatch() {
        let mut skel = SkeletonDescriptor::chain(2);
        skel.parents.pop();
        assert!(skel.validate().is_err());
    }
}
