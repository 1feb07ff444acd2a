use sqlx::sqlite::SqliteRow;
use tracing::info;

use ladder_core::domain::document::{
    ApprovalDocument, ApprovalDocumentId, ApprovalDocumentLevel, Principal,
};
use ladder_core::domain::entity::EntityType;
use ladder_core::domain::identity::InstitutionId;
use ladder_core::workflow::{DocumentCatalog, StoreError};

use super::{column, decode_level, decode_timestamp, encode_timestamp, RepositoryError};
use crate::DbPool;

const DOCUMENT_COLUMNS: &str =
    "id, institution_id, entity_type, name, active, created_at, updated_at";

pub struct SqlDocumentRepository {
    pool: DbPool,
}

impl SqlDocumentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Validates and upserts a document with all of its levels. Saving an
    /// active document deactivates every other active document for the same
    /// institution and entity type in the same transaction.
    pub async fn save(&self, document: &ApprovalDocument) -> Result<(), RepositoryError> {
        document.validate().map_err(|e| RepositoryError::Invalid(e.to_string()))?;
        let mut tx = self.pool.begin().await?;

        if document.active {
            sqlx::query(
                "UPDATE approval_document SET active = 0, updated_at = ?
                 WHERE institution_id = ? AND entity_type = ? AND id <> ? AND active = 1",
            )
            .bind(encode_timestamp(document.updated_at))
            .bind(&document.institution_id.0)
            .bind(document.entity_type.as_str())
            .bind(&document.id.0)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO approval_document (id, institution_id, entity_type, name, active,
                                            created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 institution_id = excluded.institution_id,
                 entity_type = excluded.entity_type,
                 name = excluded.name,
                 active = excluded.active,
                 updated_at = excluded.updated_at",
        )
        .bind(&document.id.0)
        .bind(&document.institution_id.0)
        .bind(document.entity_type.as_str())
        .bind(&document.name)
        .bind(document.active)
        .bind(encode_timestamp(document.created_at))
        .bind(encode_timestamp(document.updated_at))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM approval_document_level WHERE document_id = ?")
            .bind(&document.id.0)
            .execute(&mut *tx)
            .await?;

        for level in &document.levels {
            sqlx::query(
                "INSERT INTO approval_document_level (document_id, level, name, auto_approve)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&document.id.0)
            .bind(i64::from(level.level))
            .bind(level.name.as_deref())
            .bind(level.auto_approve)
            .execute(&mut *tx)
            .await?;

            for (table, principals) in [
                ("approval_document_level_approver", &level.approvers),
                ("approval_document_level_overrider", &level.overriders),
            ] {
                for principal in principals {
                    sqlx::query(&format!(
                        "INSERT OR IGNORE INTO {table} (document_id, level, principal_kind, principal_id)
                         VALUES (?, ?, ?, ?)"
                    ))
                    .bind(&document.id.0)
                    .bind(i64::from(level.level))
                    .bind(principal.kind())
                    .bind(principal.id())
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        info!(
            event_name = "db.document.saved",
            document_id = %document.id,
            institution_id = %document.institution_id,
            entity_type = %document.entity_type,
            levels = document.levels.len(),
            active = document.active,
            "approval document saved"
        );
        Ok(())
    }

    /// Deactivates a document. Approvals already bound to it keep using it.
    pub async fn deactivate(&self, id: &ApprovalDocumentId) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE approval_document SET active = 0, updated_at = ? WHERE id = ? AND active = 1",
        )
        .bind(encode_timestamp(chrono::Utc::now()))
        .bind(&id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn load(&self, row: &SqliteRow) -> Result<ApprovalDocument, RepositoryError> {
        let id: String = column(row, "id")?;
        let entity_type: String = column(row, "entity_type")?;
        let created_at: String = column(row, "created_at")?;
        let updated_at: String = column(row, "updated_at")?;

        Ok(ApprovalDocument {
            levels: self.load_levels(&id).await?,
            id: ApprovalDocumentId(id),
            institution_id: InstitutionId(column(row, "institution_id")?),
            entity_type: EntityType::parse(&entity_type).ok_or_else(|| {
                RepositoryError::Decode(format!("unknown entity type `{entity_type}`"))
            })?,
            name: column(row, "name")?,
            active: column(row, "active")?,
            created_at: decode_timestamp(&created_at)?,
            updated_at: decode_timestamp(&updated_at)?,
        })
    }

    async fn load_levels(
        &self,
        document_id: &str,
    ) -> Result<Vec<ApprovalDocumentLevel>, RepositoryError> {
        let rows: Vec<(i64, Option<String>, bool)> = sqlx::query_as(
            "SELECT level, name, auto_approve FROM approval_document_level
             WHERE document_id = ? ORDER BY level",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        let mut levels = Vec::with_capacity(rows.len());
        for (level, name, auto_approve) in rows {
            let level = decode_level(level)?;
            levels.push(ApprovalDocumentLevel {
                level,
                name,
                approvers: self
                    .load_principals("approval_document_level_approver", document_id, level)
                    .await?,
                overriders: self
                    .load_principals("approval_document_level_overrider", document_id, level)
                    .await?,
                auto_approve,
            });
        }
        Ok(levels)
    }

    async fn load_principals(
        &self,
        table: &str,
        document_id: &str,
        level: u32,
    ) -> Result<Vec<Principal>, RepositoryError> {
        let rows: Vec<(String, String)> = sqlx::query_as(&format!(
            "SELECT principal_kind, principal_id FROM {table}
             WHERE document_id = ? AND level = ?
             ORDER BY principal_kind DESC, principal_id"
        ))
        .bind(document_id)
        .bind(i64::from(level))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(kind, id)| {
                Principal::from_parts(&kind, id).ok_or_else(|| {
                    RepositoryError::Decode(format!("unknown principal kind `{kind}`"))
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl DocumentCatalog for SqlDocumentRepository {
    async fn find_for_entity(
        &self,
        institution_id: &InstitutionId,
        entity_type: EntityType,
    ) -> Result<Option<ApprovalDocument>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM approval_document
             WHERE institution_id = ? AND entity_type = ? AND active = 1"
        ))
        .bind(&institution_id.0)
        .bind(entity_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        match row {
            Some(ref r) => Ok(Some(self.load(r).await?)),
            None => Ok(None),
        }
    }

    async fn find_document(
        &self,
        id: &ApprovalDocumentId,
    ) -> Result<Option<ApprovalDocument>, StoreError> {
        let row =
            sqlx::query(&format!("SELECT {DOCUMENT_COLUMNS} FROM approval_document WHERE id = ?"))
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(RepositoryError::from)?;

        match row {
            Some(ref r) => Ok(Some(self.load(r).await?)),
            None => Ok(None),
        }
    }

    async fn list_documents(
        &self,
        institution_id: &InstitutionId,
    ) -> Result<Vec<ApprovalDocument>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM approval_document
             WHERE institution_id = ? ORDER BY id"
        ))
        .bind(&institution_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in &rows {
            documents.push(self.load(row).await?);
        }
        Ok(documents)
    }
}
