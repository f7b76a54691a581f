//! Keyframe Store
//!
//! SQLite persistence for action projects and their frames.
//!
//! ```text
//! action_projects (id, name, remote_slot_id, created_at, modified_at)
//!        │ 1
//!        │
//!        │ n   ON DELETE CASCADE
//! action_frames   (id, project_id, sequence_id, duration,
//!                  servo1..servo6, sound_id)
//! ```
//!
//! Multi-row writes (insert-with-frames, update-with-frames) run in a
//! single transaction.

mod entities;
mod repository;
mod schema;

pub use entities::{ActionFrameEntity, ActionProjectEntity, ProjectSummary};
pub use repository::ActionRepository;
pub use schema::SCHEMA_VERSION;
