//! Binary pose frames broadcast every simulation tick.
//!
//! Layout: big-endian `u16` wrapping millisecond timestamp, one presence
//! byte, then seven `f32` components (position xyz, rotation quaternion
//! xyzw) for each slot whose presence bit is set.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const MASK_AVATAR: u8 = 1 << 0;
const MASK_LEFT_HAND: u8 = 1 << 1;
const MASK_RIGHT_HAND: u8 = 1 << 2;
const KNOWN_MASK: u8 = MASK_AVATAR | MASK_LEFT_HAND | MASK_RIGHT_HAND;

const POSE_BYTES: usize = 7 * 4;
const HEADER_BYTES: usize = 2 + 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("pose frame truncated: {actual} bytes, need {expected}")]
    Truncated { expected: usize, actual: usize },
    #[error("pose frame carries unknown presence bits {0:#04x}")]
    UnknownMask(u8),
}

/// Position and orientation of one tracked actor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    pub position: [f32; 3],
    pub rotation: [f32; 4],
}

/// One tick's worth of local actor transforms.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PoseFrame {
    pub timestamp: u16,
    pub avatar: Option<Pose>,
    pub left_hand: Option<Pose>,
    pub right_hand: Option<Pose>,
}

impl PoseFrame {
    pub fn encode(&self) -> Bytes {
        let slots = [self.avatar, self.left_hand, self.right_hand];
        let present = slots.iter().filter(|slot| slot.is_some()).count();
        let mut buf = BytesMut::with_capacity(HEADER_BYTES + present * POSE_BYTES);
        buf.put_u16(self.timestamp);
        let mut mask = 0u8;
        for (bit, slot) in [MASK_AVATAR, MASK_LEFT_HAND, MASK_RIGHT_HAND]
            .into_iter()
            .zip(slots)
        {
            if slot.is_some() {
                mask |= bit;
            }
        }
        buf.put_u8(mask);
        for pose in slots.into_iter().flatten() {
            for component in pose.position {
                buf.put_f32(component);
            }
            for component in pose.rotation {
                buf.put_f32(component);
            }
        }
        buf.freeze()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, FrameError> {
        if raw.len() < HEADER_BYTES {
            return Err(FrameError::Truncated {
                expected: HEADER_BYTES,
                actual: raw.len(),
            });
        }
        let mut buf = raw;
        let timestamp = buf.get_u16();
        let mask = buf.get_u8();
        if mask & !KNOWN_MASK != 0 {
            return Err(FrameError::UnknownMask(mask));
        }
        let present = mask.count_ones() as usize;
        let expected = HEADER_BYTES + present * POSE_BYTES;
        if raw.len() < expected {
            return Err(FrameError::Truncated {
                expected,
                actual: raw.len(),
            });
        }
        let mut read_pose = |wanted: u8| -> Option<Pose> {
            if mask & wanted == 0 {
                return None;
            }
            let mut pose = Pose::default();
            for component in pose.position.iter_mut() {
                *component = buf.get_f32();
            }
            for component in pose.rotation.iter_mut() {
                *component = buf.get_f32();
            }
            Some(pose)
        };
        Ok(Self {
            timestamp,
            avatar: read_pose(MASK_AVATAR),
            left_hand: read_pose(MASK_LEFT_HAND),
            right_hand: read_pose(MASK_RIGHT_HAND),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.avatar.is_none() && self.left_hand.is_none() && self.right_hand.is_none()
    }
}

/// Reads the wrapping timestamp without decoding the rest of the frame.
/// Used when enqueueing into the jitter buffer.
pub fn peek_timestamp(raw: &[u8]) -> Option<u16> {
    let high = *raw.first()?;
    let low = *raw.get(1)?;
    Some(u16::from_be_bytes([high, low]))
}
