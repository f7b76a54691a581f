//! Error types for the arm controller library.
//!
//! Transport faults never surface here: device connections report them as a
//! `false` result or an `Error` connection state. This type covers model
//! construction and persistence.

use thiserror::Error;

/// Result alias using the crate [`enum@Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Project names must contain at least one non-whitespace character.
    #[error("Project name cannot be blank")]
    BlankProjectName,

    /// Firmware storage slots are numbered 1-10.
    #[error("Remote slot must be 1-10, got {0}")]
    InvalidRemoteSlot(i64),

    /// A keyframe violated a structural invariant (axis set, ranges).
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// No project with the given id exists in the store.
    #[error("Project {0} not found")]
    ProjectNotFound(i64),

    /// There is no project loaded in the working buffer.
    #[error("No project loaded")]
    NoProjectLoaded,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
