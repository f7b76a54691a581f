//! Keyframe data model.
//!
//! An [`ActionFrame`] is one timed pose of all six axes. An
//! [`ActionProject`] is a named, ordered list of frames that can be
//! persisted and replayed by the sequencer.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Number of servo axes on the arm.
pub const AXIS_COUNT: usize = 6;

pub const PWM_MIN: u16 = 500;
pub const PWM_MAX: u16 = 2500;
/// Neutral servo position.
pub const PWM_CENTER: u16 = 1500;

pub const DURATION_MIN_MS: u32 = 500;
pub const DURATION_MAX_MS: u32 = 5000;

pub const SOUND_ID_MIN: u8 = 1;
pub const SOUND_ID_MAX: u8 = 255;

pub const REMOTE_SLOT_RANGE: RangeInclusive<u8> = 1..=10;

/// Names are shown truncated to this many characters.
pub const DISPLAY_NAME_LEN: usize = 50;

fn clamp_i64(value: i64, min: i64, max: i64) -> i64 {
    value.clamp(min, max)
}

pub fn clamp_pwm(pwm: i64) -> u16 {
    clamp_i64(pwm, PWM_MIN as i64, PWM_MAX as i64) as u16
}

pub fn clamp_duration(duration_ms: i64) -> u32 {
    clamp_i64(duration_ms, DURATION_MIN_MS as i64, DURATION_MAX_MS as i64) as u32
}

pub fn clamp_sound_id(sound_id: i64) -> u8 {
    clamp_i64(sound_id, SOUND_ID_MIN as i64, SOUND_ID_MAX as i64) as u8
}

/// One keyframe: six axis targets held for `duration_ms`.
///
/// `servos[0]` is axis 1. Every value is within range; construct through
/// [`ActionFrame::new`] (strict) or [`ActionFrameFactory`] (clamping).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FrameRecord")]
pub struct ActionFrame {
    sequence_id: i32,
    duration_ms: u32,
    servos: [u16; AXIS_COUNT],
    sound_id: Option<u8>,
}

impl ActionFrame {
    /// Build a frame from already-valid values.
    pub fn new(
        sequence_id: i32,
        duration_ms: u32,
        servos: [u16; AXIS_COUNT],
        sound_id: Option<u8>,
    ) -> Result<Self> {
        if !(DURATION_MIN_MS..=DURATION_MAX_MS).contains(&duration_ms) {
            return Err(Error::InvalidFrame(format!(
                "duration must be {}-{}ms, got {}",
                DURATION_MIN_MS, DURATION_MAX_MS, duration_ms
            )));
        }
        if let Some((axis, pwm)) = servos
            .iter()
            .enumerate()
            .find(|(_, pwm)| !(PWM_MIN..=PWM_MAX).contains(*pwm))
        {
            return Err(Error::InvalidFrame(format!(
                "axis {} PWM must be {}-{}, got {}",
                axis + 1,
                PWM_MIN,
                PWM_MAX,
                pwm
            )));
        }
        if sound_id == Some(0) {
            return Err(Error::InvalidFrame("sound id must be 1-255".to_string()));
        }

        Ok(Self {
            sequence_id,
            duration_ms,
            servos,
            sound_id,
        })
    }

    /// Build a frame from a raw pose, clamping every value into range.
    pub fn clamped(
        sequence_id: i32,
        duration_ms: i64,
        servos: [i64; AXIS_COUNT],
        sound_id: Option<i64>,
    ) -> Self {
        Self {
            sequence_id,
            duration_ms: clamp_duration(duration_ms),
            servos: servos.map(clamp_pwm),
            sound_id: sound_id.map(clamp_sound_id),
        }
    }

    pub fn sequence_id(&self) -> i32 {
        self.sequence_id
    }

    pub fn duration_ms(&self) -> u32 {
        self.duration_ms
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms as u64)
    }

    pub fn servos(&self) -> &[u16; AXIS_COUNT] {
        &self.servos
    }

    /// PWM target for a 1-based axis number.
    pub fn servo(&self, axis: u8) -> Option<u16> {
        let index = (axis as usize).checked_sub(1)?;
        self.servos.get(index).copied()
    }

    pub fn sound_id(&self) -> Option<u8> {
        self.sound_id
    }

    /// `(axis, pwm)` pairs in axis order, axis numbered from 1.
    pub fn axes(&self) -> impl Iterator<Item = (u8, u16)> + '_ {
        self.servos
            .iter()
            .enumerate()
            .map(|(index, pwm)| (index as u8 + 1, *pwm))
    }

    pub(crate) fn with_sequence_id(mut self, sequence_id: i32) -> Self {
        self.sequence_id = sequence_id;
        self
    }
}

/// Creates frames from untrusted input by clamping numeric fields.
///
/// The axis set is structural and is not clamped: the map must hold exactly
/// the keys 1 through 6.
pub struct ActionFrameFactory;

impl ActionFrameFactory {
    pub fn create(
        sequence_id: i32,
        duration_ms: i64,
        servos: &BTreeMap<u8, i64>,
        sound_id: Option<i64>,
    ) -> Result<ActionFrame> {
        if servos.len() != AXIS_COUNT {
            return Err(Error::InvalidFrame(format!(
                "must have exactly {} servo positions, got {}",
                AXIS_COUNT,
                servos.len()
            )));
        }

        let mut pose = [PWM_CENTER as i64; AXIS_COUNT];
        for (axis, pwm) in servos {
            let slot = (*axis as usize)
                .checked_sub(1)
                .and_then(|index| pose.get_mut(index))
                .ok_or_else(|| {
                    Error::InvalidFrame(format!("servo index must be 1-6, got {}", axis))
                })?;
            *slot = *pwm;
        }

        Ok(ActionFrame::clamped(sequence_id, duration_ms, pose, sound_id))
    }
}

/// Wire shape of [`ActionFrame`]; validated by [`ActionFrame::new`].
#[derive(Deserialize)]
struct FrameRecord {
    sequence_id: i32,
    duration_ms: u32,
    servos: [u16; AXIS_COUNT],
    sound_id: Option<u8>,
}

impl TryFrom<FrameRecord> for ActionFrame {
    type Error = Error;

    fn try_from(record: FrameRecord) -> Result<Self> {
        Self::new(
            record.sequence_id,
            record.duration_ms,
            record.servos,
            record.sound_id,
        )
    }
}

/// A named, ordered collection of keyframes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ProjectRecord")]
pub struct ActionProject {
    /// Storage-assigned id; 0 until first saved.
    pub id: i64,
    name: String,
    remote_slot_id: Option<u8>,
    pub frames: Vec<ActionFrame>,
    pub created_at: i64,
    pub modified_at: i64,
}

/// Wire shape of [`ActionProject`]; validated by [`ActionProject::from_parts`].
#[derive(Deserialize)]
struct ProjectRecord {
    id: i64,
    name: String,
    remote_slot_id: Option<u8>,
    frames: Vec<ActionFrame>,
    created_at: i64,
    modified_at: i64,
}

impl TryFrom<ProjectRecord> for ActionProject {
    type Error = Error;

    fn try_from(record: ProjectRecord) -> Result<Self> {
        Self::from_parts(
            record.id,
            record.name,
            record.remote_slot_id,
            record.frames,
            record.created_at,
            record.modified_at,
        )
    }
}

impl ActionProject {
    /// A new, unsaved project with no frames.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let now = now_millis();
        Self::from_parts(0, name, None, Vec::new(), now, now)
    }

    pub fn from_parts(
        id: i64,
        name: impl Into<String>,
        remote_slot_id: Option<u8>,
        frames: Vec<ActionFrame>,
        created_at: i64,
        modified_at: i64,
    ) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::BlankProjectName);
        }
        if let Some(slot) = remote_slot_id {
            if !REMOTE_SLOT_RANGE.contains(&slot) {
                return Err(Error::InvalidRemoteSlot(slot as i64));
            }
        }

        Ok(Self {
            id,
            name,
            remote_slot_id,
            frames,
            created_at,
            modified_at,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name cut to its first 50 characters.
    pub fn truncated_name(&self) -> String {
        self.name.chars().take(DISPLAY_NAME_LEN).collect()
    }

    pub fn remote_slot_id(&self) -> Option<u8> {
        self.remote_slot_id
    }

    pub fn set_remote_slot_id(&mut self, slot: Option<u8>) -> Result<()> {
        if let Some(slot) = slot {
            if !REMOTE_SLOT_RANGE.contains(&slot) {
                return Err(Error::InvalidRemoteSlot(slot as i64));
            }
        }
        self.remote_slot_id = slot;
        Ok(())
    }

    /// Sum of all frame durations in milliseconds.
    pub fn total_duration_ms(&self) -> u64 {
        self.frames.iter().map(|f| f.duration_ms() as u64).sum()
    }

    pub fn is_saved(&self) -> bool {
        self.id != 0
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pose(pwm: i64) -> BTreeMap<u8, i64> {
        (1..=6).map(|axis| (axis, pwm)).collect()
    }

    #[test]
    fn test_factory_clamps_out_of_range_values() {
        let frame = ActionFrameFactory::create(3, 10_000, &pose(9_999), Some(0)).unwrap();
        assert_eq!(frame.duration_ms(), 5000);
        assert_eq!(frame.servos(), &[2500; 6]);
        assert_eq!(frame.sound_id(), Some(1));
        assert_eq!(frame.sequence_id(), 3);
    }

    #[test]
    fn test_factory_rejects_wrong_axis_count() {
        let mut servos = pose(1500);
        servos.remove(&6);
        assert!(matches!(
            ActionFrameFactory::create(0, 1000, &servos, None),
            Err(Error::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_factory_rejects_unknown_axis() {
        let mut servos = pose(1500);
        servos.remove(&6);
        servos.insert(7, 1500);
        assert!(ActionFrameFactory::create(0, 1000, &servos, None).is_err());
    }

    #[test]
    fn test_strict_constructor_rejects_out_of_range() {
        assert!(ActionFrame::new(0, 499, [1500; 6], None).is_err());
        assert!(ActionFrame::new(0, 1000, [1500, 1500, 2501, 1500, 1500, 1500], None).is_err());
        assert!(ActionFrame::new(0, 1000, [1500; 6], Some(0)).is_err());
        assert!(ActionFrame::new(0, 1000, [1500; 6], Some(255)).is_ok());
    }

    #[test]
    fn test_axes_are_numbered_from_one() {
        let frame = ActionFrame::new(0, 1000, [500, 600, 700, 800, 900, 1000], None).unwrap();
        let axes: Vec<_> = frame.axes().collect();
        assert_eq!(axes.first(), Some(&(1, 500)));
        assert_eq!(axes.last(), Some(&(6, 1000)));
        assert_eq!(frame.servo(3), Some(700));
        assert_eq!(frame.servo(0), None);
        assert_eq!(frame.servo(7), None);
    }

    #[test]
    fn test_project_rejects_blank_name() {
        assert!(matches!(
            ActionProject::new("   "),
            Err(Error::BlankProjectName)
        ));
    }

    #[test]
    fn test_project_rejects_invalid_slot() {
        assert!(ActionProject::from_parts(0, "wave", Some(11), Vec::new(), 0, 0).is_err());
        assert!(ActionProject::from_parts(0, "wave", Some(0), Vec::new(), 0, 0).is_err());
        let mut project = ActionProject::new("wave").unwrap();
        assert!(project.set_remote_slot_id(Some(10)).is_ok());
        assert!(project.set_remote_slot_id(Some(12)).is_err());
        assert_eq!(project.remote_slot_id(), Some(10));
    }

    #[test]
    fn test_truncated_name_and_total_duration() {
        let long_name = "x".repeat(80);
        let mut project = ActionProject::new(long_name).unwrap();
        for duration in [500, 1000, 1500] {
            project
                .frames
                .push(ActionFrame::new(0, duration, [1500; 6], None).unwrap());
        }
        assert_eq!(project.truncated_name().chars().count(), 50);
        assert_eq!(project.total_duration_ms(), 3000);
    }

    #[test]
    fn test_deserialize_validates_frames() {
        let frame = ActionFrame::new(2, 800, [1500; 6], Some(7)).unwrap();
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(serde_json::from_str::<ActionFrame>(&json).unwrap(), frame);

        let zero_duration = r#"{"sequence_id":0,"duration_ms":0,"servos":[1500,1500,1500,1500,1500,1500],"sound_id":null}"#;
        assert!(serde_json::from_str::<ActionFrame>(zero_duration).is_err());
        let zero_pwm = r#"{"sequence_id":0,"duration_ms":500,"servos":[0,1500,1500,1500,1500,1500],"sound_id":null}"#;
        assert!(serde_json::from_str::<ActionFrame>(zero_pwm).is_err());
        let zero_sound = r#"{"sequence_id":0,"duration_ms":500,"servos":[1500,1500,1500,1500,1500,1500],"sound_id":0}"#;
        assert!(serde_json::from_str::<ActionFrame>(zero_sound).is_err());
    }

    #[test]
    fn test_deserialize_validates_projects() {
        let project = ActionProject::from_parts(3, "wave", Some(2), Vec::new(), 10, 20).unwrap();
        let json = serde_json::to_string(&project).unwrap();
        assert_eq!(serde_json::from_str::<ActionProject>(&json).unwrap(), project);

        let blank = r#"{"id":1,"name":"  ","remote_slot_id":null,"frames":[],"created_at":0,"modified_at":0}"#;
        assert!(serde_json::from_str::<ActionProject>(blank).is_err());
        let bad_slot = r#"{"id":1,"name":"wave","remote_slot_id":11,"frames":[],"created_at":0,"modified_at":0}"#;
        assert!(serde_json::from_str::<ActionProject>(bad_slot).is_err());
    }

    proptest! {
        #[test]
        fn prop_clamped_values_are_in_range(
            duration in any::<i64>(),
            pwm in any::<i64>(),
            sound in proptest::option::of(any::<i64>()),
        ) {
            let frame = ActionFrameFactory::create(0, duration, &pose(pwm), sound).unwrap();
            prop_assert!((500..=5000).contains(&frame.duration_ms()));
            prop_assert!(frame.servos().iter().all(|p| (500..=2500).contains(p)));
            prop_assert_eq!(frame.sound_id().is_some(), sound.is_some());
            if let Some(id) = frame.sound_id() {
                prop_assert!(id >= 1);
            }
        }

        #[test]
        fn prop_clamping_is_idempotent(
            duration in any::<i64>(),
            pwm in any::<i64>(),
            sound in any::<i64>(),
        ) {
            let once = clamp_duration(duration);
            prop_assert_eq!(clamp_duration(once as i64), once);
            let once = clamp_pwm(pwm);
            prop_assert_eq!(clamp_pwm(once as i64), once);
            let once = clamp_sound_id(sound);
            prop_assert_eq!(clamp_sound_id(once as i64), once);
        }
    }
}
