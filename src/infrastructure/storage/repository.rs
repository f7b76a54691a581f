//! Action Repository - Database operations

use super::entities::{ActionFrameEntity, ActionProjectEntity, ProjectSummary};
use super::schema;
use crate::domain::action::{ActionFrame, ActionProject};
use crate::domain::sequencer::ProjectStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const SELECT_PROJECT: &str = r#"
    SELECT id, name, remote_slot_id, created_at, modified_at
    FROM action_projects
"#;

const SELECT_FRAMES: &str = r#"
    SELECT id, project_id, sequence_id, duration,
           servo1, servo2, servo3, servo4, servo5, servo6, sound_id
    FROM action_frames
    WHERE project_id = ?
    ORDER BY sequence_id ASC, id ASC
"#;

#[derive(Clone)]
pub struct ActionRepository {
    pool: SqlitePool,
}

impl ActionRepository {
    /// Open (creating if needed) the database file at `path` and migrate it.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        info!(path = %path.display(), "Opened action database");
        Self::from_pool(pool).await
    }

    /// Private in-memory database. Lives as long as the repository.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and migrate it. Deletes remove frames
    /// explicitly, so pools without `foreign_keys` still cascade.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        schema::migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn schema_version(&self) -> Result<i64> {
        schema::user_version(&self.pool).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ========================================================================
    // Projects
    // ========================================================================

    /// Insert a project and its frames in one transaction. The project's own
    /// id is ignored; the new id is returned.
    pub async fn insert_project_with_frames(&self, project: &ActionProject) -> Result<i64> {
        let entity = ActionProjectEntity::from_domain(project);
        let mut tx = self.pool.begin().await?;

        let project_id = sqlx::query(
            r#"
            INSERT INTO action_projects (name, remote_slot_id, created_at, modified_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&entity.name)
        .bind(entity.remote_slot_id)
        .bind(entity.created_at)
        .bind(entity.modified_at)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        insert_frames(&mut tx, project_id, &project.frames).await?;
        tx.commit().await?;

        info!(id = project_id, name = %entity.name, frames = project.frames.len(), "Inserted project");
        Ok(project_id)
    }

    /// Update the project row and replace all of its frames.
    pub async fn update_project_with_frames(&self, project: &ActionProject) -> Result<()> {
        let entity = ActionProjectEntity::from_domain(project);
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE action_projects
            SET name = ?, remote_slot_id = ?, created_at = ?, modified_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&entity.name)
        .bind(entity.remote_slot_id)
        .bind(entity.created_at)
        .bind(entity.modified_at)
        .bind(entity.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(Error::ProjectNotFound(entity.id));
        }

        sqlx::query("DELETE FROM action_frames WHERE project_id = ?")
            .bind(entity.id)
            .execute(&mut *tx)
            .await?;
        insert_frames(&mut tx, entity.id, &project.frames).await?;
        tx.commit().await?;

        info!(id = entity.id, frames = project.frames.len(), "Updated project");
        Ok(())
    }

    pub async fn get_project_with_frames(&self, id: i64) -> Result<Option<ActionProject>> {
        let row: Option<ActionProjectEntity> =
            sqlx::query_as(&format!("{} WHERE id = ?", SELECT_PROJECT))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(row) => {
                let frames = self.get_frames_by_project_id(row.id).await?;
                Ok(Some(row.into_domain(frames)?))
            }
            None => Ok(None),
        }
    }

    /// Every project with its frames, most recently modified first.
    pub async fn get_all_projects_with_frames(&self) -> Result<Vec<ActionProject>> {
        let rows: Vec<ActionProjectEntity> =
            sqlx::query_as(&format!("{} ORDER BY modified_at DESC", SELECT_PROJECT))
                .fetch_all(&self.pool)
                .await?;

        let mut projects = Vec::with_capacity(rows.len());
        for row in rows {
            let frames = self.get_frames_by_project_id(row.id).await?;
            projects.push(row.into_domain(frames)?);
        }
        Ok(projects)
    }

    /// Project overview without loading frames, most recently modified first.
    pub async fn list_projects(&self) -> Result<Vec<ProjectSummary>> {
        let rows: Vec<ProjectSummary> = sqlx::query_as(
            r#"
            SELECT p.id, p.name, p.remote_slot_id,
                   COUNT(f.id) AS frame_count,
                   COALESCE(SUM(f.duration), 0) AS total_duration_ms,
                   p.modified_at
            FROM action_projects p
            LEFT JOIN action_frames f ON f.project_id = p.id
            GROUP BY p.id
            ORDER BY p.modified_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Delete a project; its frames go with it. Returns whether it existed.
    pub async fn delete_project(&self, id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM action_frames WHERE project_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM action_projects WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        debug!(id, deleted, "Delete project");
        Ok(deleted > 0)
    }

    // ========================================================================
    // Frames
    // ========================================================================

    pub async fn get_frames_by_project_id(&self, project_id: i64) -> Result<Vec<ActionFrame>> {
        let rows: Vec<ActionFrameEntity> = sqlx::query_as(SELECT_FRAMES)
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(ActionFrameEntity::into_domain).collect())
    }

    /// Returns the number of frames removed.
    pub async fn delete_frame_by_sequence_id(&self, project_id: i64, sequence_id: i32) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM action_frames WHERE project_id = ? AND sequence_id = ?")
            .bind(project_id)
            .bind(sequence_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }
}

async fn insert_frames(
    tx: &mut Transaction<'_, Sqlite>,
    project_id: i64,
    frames: &[ActionFrame],
) -> Result<()> {
    for frame in frames {
        let entity = ActionFrameEntity::from_domain(frame, project_id);
        sqlx::query(
            r#"
            INSERT INTO action_frames
                (project_id, sequence_id, duration,
                 servo1, servo2, servo3, servo4, servo5, servo6, sound_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entity.project_id)
        .bind(entity.sequence_id)
        .bind(entity.duration)
        .bind(entity.servo1)
        .bind(entity.servo2)
        .bind(entity.servo3)
        .bind(entity.servo4)
        .bind(entity.servo5)
        .bind(entity.servo6)
        .bind(entity.sound_id)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl ProjectStore for ActionRepository {
    async fn insert_project_with_frames(&self, project: &ActionProject) -> Result<i64> {
        ActionRepository::insert_project_with_frames(self, project).await
    }

    async fn update_project_with_frames(&self, project: &ActionProject) -> Result<()> {
        ActionRepository::update_project_with_frames(self, project).await
    }
}
