//! Schema creation and migrations, tracked with `PRAGMA user_version`.
//!
//! Version 1 stored projects in a single `action_projects` table with the
//! frame list serialized into a `frames` text column. Version 2 splits
//! frames into `action_frames`. The inline frames of a version 1 database
//! are dropped during migration; project rows are kept.

use crate::error::Result;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{info, warn};

pub const SCHEMA_VERSION: i64 = 2;

const CREATE_PROJECTS: &str = r#"
    CREATE TABLE IF NOT EXISTS action_projects (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        name           TEXT    NOT NULL,
        remote_slot_id INTEGER,
        created_at     INTEGER NOT NULL,
        modified_at    INTEGER NOT NULL
    )
"#;

const CREATE_FRAMES: &str = r#"
    CREATE TABLE IF NOT EXISTS action_frames (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id  INTEGER NOT NULL
                    REFERENCES action_projects(id) ON DELETE CASCADE,
        sequence_id INTEGER NOT NULL,
        duration    INTEGER NOT NULL,
        servo1      INTEGER NOT NULL,
        servo2      INTEGER NOT NULL,
        servo3      INTEGER NOT NULL,
        servo4      INTEGER NOT NULL,
        servo5      INTEGER NOT NULL,
        servo6      INTEGER NOT NULL,
        sound_id    INTEGER
    )
"#;

const CREATE_FRAME_INDICES: [&str; 2] = [
    "CREATE INDEX IF NOT EXISTS idx_action_frames_project_id ON action_frames(project_id)",
    "CREATE INDEX IF NOT EXISTS idx_action_frames_sequence_id ON action_frames(sequence_id)",
];

/// Bring the database up to [`SCHEMA_VERSION`].
pub(crate) async fn migrate(pool: &SqlitePool) -> Result<()> {
    let version = user_version(pool).await?;
    if version == SCHEMA_VERSION {
        return Ok(());
    }
    if version > SCHEMA_VERSION {
        warn!(
            version,
            supported = SCHEMA_VERSION,
            "Database was written by a newer version, opening anyway"
        );
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    if has_inline_frames(&mut tx).await? {
        migrate_inline_frames(&mut tx).await?;
    } else {
        create_tables(&mut tx).await?;
    }
    sqlx::query(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    info!(from = version, to = SCHEMA_VERSION, "Database schema migrated");
    Ok(())
}

pub(crate) async fn user_version(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar::<_, i64>("PRAGMA user_version")
        .fetch_one(pool)
        .await?)
}

async fn create_tables(tx: &mut Transaction<'_, Sqlite>) -> Result<()> {
    sqlx::query(CREATE_PROJECTS).execute(&mut **tx).await?;
    sqlx::query(CREATE_FRAMES).execute(&mut **tx).await?;
    for statement in CREATE_FRAME_INDICES {
        sqlx::query(statement).execute(&mut **tx).await?;
    }
    Ok(())
}

/// Whether `action_projects` still has the version 1 `frames` column.
async fn has_inline_frames(tx: &mut Transaction<'_, Sqlite>) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info('action_projects') WHERE name = 'frames'",
    )
    .fetch_one(&mut **tx)
    .await?;
    Ok(count > 0)
}

async fn migrate_inline_frames(tx: &mut Transaction<'_, Sqlite>) -> Result<()> {
    warn!("Migrating single-table project layout, inline frames are not carried over");

    sqlx::query("ALTER TABLE action_projects RENAME TO action_projects_v1")
        .execute(&mut **tx)
        .await?;
    create_tables(tx).await?;
    let copied = sqlx::query(
        r#"
        INSERT INTO action_projects (id, name, remote_slot_id, created_at, modified_at)
        SELECT id, name, remoteSlotId, createdAt, modifiedAt
        FROM action_projects_v1
        "#,
    )
    .execute(&mut **tx)
    .await?
    .rows_affected();
    sqlx::query("DROP TABLE action_projects_v1")
        .execute(&mut **tx)
        .await?;

    info!(projects = copied, "Kept project rows from single-table layout");
    Ok(())
}
