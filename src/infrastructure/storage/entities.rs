//! Row types and their mapping to the domain model.

use crate::domain::action::{ActionFrame, ActionProject, AXIS_COUNT};
use crate::error::{Error, Result};
use serde::Serialize;

/// Row of `action_projects`.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ActionProjectEntity {
    pub id: i64,
    pub name: String,
    pub remote_slot_id: Option<i64>,
    pub created_at: i64,
    pub modified_at: i64,
}

impl ActionProjectEntity {
    pub fn from_domain(project: &ActionProject) -> Self {
        Self {
            id: project.id,
            name: project.name().to_string(),
            remote_slot_id: project.remote_slot_id().map(i64::from),
            created_at: project.created_at,
            modified_at: project.modified_at,
        }
    }

    pub fn into_domain(self, frames: Vec<ActionFrame>) -> Result<ActionProject> {
        let remote_slot_id = self
            .remote_slot_id
            .map(|slot| u8::try_from(slot).map_err(|_| Error::InvalidRemoteSlot(slot)))
            .transpose()?;

        ActionProject::from_parts(
            self.id,
            self.name,
            remote_slot_id,
            frames,
            self.created_at,
            self.modified_at,
        )
    }
}

/// Row of `action_frames`.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ActionFrameEntity {
    pub id: i64,
    pub project_id: i64,
    pub sequence_id: i64,
    pub duration: i64,
    pub servo1: i64,
    pub servo2: i64,
    pub servo3: i64,
    pub servo4: i64,
    pub servo5: i64,
    pub servo6: i64,
    pub sound_id: Option<i64>,
}

impl ActionFrameEntity {
    /// New row for `project_id`; `id` is assigned on insert.
    pub fn from_domain(frame: &ActionFrame, project_id: i64) -> Self {
        let [servo1, servo2, servo3, servo4, servo5, servo6] = frame.servos().map(i64::from);
        Self {
            id: 0,
            project_id,
            sequence_id: i64::from(frame.sequence_id()),
            duration: i64::from(frame.duration_ms()),
            servo1,
            servo2,
            servo3,
            servo4,
            servo5,
            servo6,
            sound_id: frame.sound_id().map(i64::from),
        }
    }

    /// Stored values are clamped back into range on load.
    pub fn into_domain(self) -> ActionFrame {
        let servos: [i64; AXIS_COUNT] = [
            self.servo1,
            self.servo2,
            self.servo3,
            self.servo4,
            self.servo5,
            self.servo6,
        ];
        let sequence_id = self
            .sequence_id
            .clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
        ActionFrame::clamped(sequence_id, self.duration, servos, self.sound_id)
    }
}

/// Project listing row without frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ProjectSummary {
    pub id: i64,
    pub name: String,
    pub remote_slot_id: Option<i64>,
    pub frame_count: i64,
    pub total_duration_ms: i64,
    pub modified_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_entity_round_trip() {
        let frame = ActionFrame::new(4, 1750, [500, 900, 1500, 2100, 2500, 1234], Some(42)).unwrap();
        let entity = ActionFrameEntity::from_domain(&frame, 7);
        assert_eq!(entity.project_id, 7);
        assert_eq!(entity.servo3, 1500);
        assert_eq!(entity.into_domain(), frame);
    }

    #[test]
    fn test_frame_without_sound_round_trip() {
        let frame = ActionFrame::new(0, 500, [1500; 6], None).unwrap();
        let entity = ActionFrameEntity::from_domain(&frame, 1);
        assert_eq!(entity.sound_id, None);
        assert_eq!(entity.into_domain(), frame);
    }

    #[test]
    fn test_project_entity_round_trip() {
        let frames = vec![ActionFrame::new(0, 800, [1500; 6], None).unwrap()];
        let project =
            ActionProject::from_parts(12, "wave", Some(3), frames.clone(), 1_000, 2_000).unwrap();

        let entity = ActionProjectEntity::from_domain(&project);
        assert_eq!(entity.remote_slot_id, Some(3));
        let restored = entity.into_domain(frames).unwrap();
        assert_eq!(restored, project);
    }

    #[test]
    fn test_out_of_range_rows_are_clamped_or_rejected() {
        let entity = ActionFrameEntity {
            id: 1,
            project_id: 1,
            sequence_id: 0,
            duration: 99_999,
            servo1: 0,
            servo2: 1500,
            servo3: 1500,
            servo4: 1500,
            servo5: 1500,
            servo6: 9_000,
            sound_id: Some(0),
        };
        let frame = entity.into_domain();
        assert_eq!(frame.duration_ms(), 5000);
        assert_eq!(frame.servo(1), Some(500));
        assert_eq!(frame.servo(6), Some(2500));
        assert_eq!(frame.sound_id(), Some(1));

        let project = ActionProjectEntity {
            id: 1,
            name: "bad slot".to_string(),
            remote_slot_id: Some(300),
            created_at: 0,
            modified_at: 0,
        };
        assert!(matches!(
            project.into_domain(Vec::new()),
            Err(Error::InvalidRemoteSlot(300))
        ));
    }
}
