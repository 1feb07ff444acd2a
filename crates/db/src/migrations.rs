use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Versions of applied migrations, oldest first.
pub async fn applied_versions(pool: &DbPool) -> Result<Vec<i64>, sqlx::Error> {
    let exists: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = '_sqlx_migrations'",
    )
    .fetch_one(pool)
    .await?;
    if exists == 0 {
        return Ok(Vec::new());
    }

    sqlx::query_scalar("SELECT version FROM _sqlx_migrations WHERE success = 1 ORDER BY version")
        .fetch_all(pool)
        .await
}

/// Number of migrations bundled into this build.
pub fn known_migrations() -> usize {
    MIGRATOR.iter().filter(|migration| migration.migration_type.is_up_migration()).count()
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::{applied_versions, known_migrations, run_pending};
    use crate::{connect_with_settings, migrations::MIGRATOR};

    const MANAGED_SCHEMA_OBJECTS: &[&str] = &[
        "institution",
        "app_user",
        "role",
        "user_role",
        "approver_group",
        "approver_group_user",
        "approver_group_role",
        "approval_document",
        "approval_document_level",
        "approval_document_level_approver",
        "approval_document_level_overrider",
        "approval",
        "approval_task",
        "entity_approval_state",
        "idx_app_user_institution_id",
        "idx_user_role_role_id",
        "idx_approval_document_active",
        "idx_approval_pending_entity",
        "idx_approval_institution_status",
        "idx_approval_task_status_updated_at",
    ];

    async fn table_count(pool: &sqlx::SqlitePool, name: &str) -> i64 {
        sqlx::query(
            "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(name)
        .fetch_one(pool)
        .await
        .expect("check table")
        .get::<i64, _>("count")
    }

    #[tokio::test]
    async fn migrations_create_baseline_tables() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        for table in [
            "institution",
            "approval_document",
            "approval_document_level",
            "approval",
            "approval_task",
            "entity_approval_state",
        ] {
            assert_eq!(table_count(&pool, table).await, 1, "missing table {table}");
        }
        assert_eq!(applied_versions(&pool).await.expect("versions").len(), known_migrations());
    }

    #[tokio::test]
    async fn migrations_are_reversible() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");

        assert_eq!(table_count(&pool, "approval").await, 0);
        assert!(applied_versions(&pool).await.expect("versions").is_empty());
    }

    #[tokio::test]
    async fn migrations_up_down_up_preserves_schema_signature() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let initial_signature = managed_schema_signature(&pool).await;
        assert_eq!(
            initial_signature.len(),
            MANAGED_SCHEMA_OBJECTS.len(),
            "initial migration pass should create all managed schema objects",
        );

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");

        let after_down_signature = managed_schema_signature(&pool).await;
        assert!(
            after_down_signature.is_empty(),
            "managed schema objects should be removed after full undo",
        );

        run_pending(&pool).await.expect("re-run migrations");

        let after_second_up_signature = managed_schema_signature(&pool).await;
        assert_eq!(
            after_second_up_signature, initial_signature,
            "up/down/up should preserve migration-managed schema signature",
        );
    }

    #[tokio::test]
    async fn only_one_pending_approval_per_entity_is_storable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        sqlx::query(
            "INSERT INTO institution (id, name, created_at) VALUES ('inst-1', 'Demo', '2026-01-01T00:00:00Z');
             INSERT INTO approval_document (id, institution_id, entity_type, name, active, created_at, updated_at)
             VALUES ('DOC-1', 'inst-1', 'project', 'Projects', 1, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z');",
        )
        .execute(&pool)
        .await
        .expect("seed");

        let insert = "INSERT INTO approval (id, institution_id, document_id, entity_type, entity_id,
                          entity_label, action, status, current_level, requested_by, created_at, updated_at)
                      VALUES (?, 'inst-1', 'DOC-1', 'project', 'P-1', 'Apollo', 'update', 'pending', 1,
                              'u-req', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')";
        sqlx::query(insert).bind("APR-1").execute(&pool).await.expect("first pending approval");
        let duplicate = sqlx::query(insert).bind("APR-2").execute(&pool).await;
        assert!(duplicate.is_err(), "second pending approval for one entity must be refused");
    }

    async fn managed_schema_signature(pool: &sqlx::SqlitePool) -> Vec<(String, String, String)> {
        let mut signature: Vec<(String, String, String)> = sqlx::query(
            "SELECT type, name, IFNULL(sql, '') AS sql
             FROM sqlite_master
             WHERE type IN ('table', 'index')",
        )
        .fetch_all(pool)
        .await
        .expect("load schema objects")
        .into_iter()
        .filter_map(|row| {
            let name = row.get::<String, _>("name");
            if MANAGED_SCHEMA_OBJECTS.contains(&name.as_str()) {
                Some((row.get::<String, _>("type"), name, row.get::<String, _>("sql")))
            } else {
                None
            }
        })
        .collect();
        signature.sort();
        signature
    }
}
