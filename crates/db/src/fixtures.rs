use serde::Serialize;
use sqlx::Executor;

use ladder_core::domain::document::ApprovalDocumentId;
use ladder_core::workflow::DocumentCatalog;

use crate::connection::DbPool;
use crate::repositories::{RepositoryError, SqlDocumentRepository};

pub const DEMO_INSTITUTION_ID: &str = "inst-demo";

const SEED_USER_IDS: &[&str] =
    &["u-requester", "u-lead", "u-lead-2", "u-hr", "u-ceo", "u-director"];

const SEED_GROUP_IDS: &[&str] = &["g-hr", "g-exec"];

const SEED_DOCUMENTS: &[SeedDocumentContract] = &[
    SeedDocumentContract {
        document_id: "DOC-DEMO-PROJECT",
        entity_type: "project",
        expected_levels: 3,
        description: "Team lead, then HR (overridable by executives), then director",
    },
    SeedDocumentContract {
        document_id: "DOC-DEMO-TASK",
        entity_type: "project_task",
        expected_levels: 2,
        description: "Team lead, then an auto-approved bookkeeping level",
    },
];

#[derive(Debug, Clone, Copy)]
struct SeedDocumentContract {
    document_id: &'static str,
    entity_type: &'static str,
    expected_levels: usize,
    description: &'static str,
}

/// Demo dataset for local runs and end-to-end checks: one institution, six
/// users, two roles, two approver groups and two approval documents.
pub struct DemoSeedDataset;

impl DemoSeedDataset {
    pub const SQL: &str = include_str!("../../../config/fixtures/demo_seed.sql");

    /// Applies the seed. Re-applying leaves existing rows untouched.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;
        tx.execute(sqlx::query(Self::SQL)).await?;
        tx.commit().await?;

        Ok(SeedResult {
            institution_id: DEMO_INSTITUTION_ID,
            users_seeded: SEED_USER_IDS.len(),
            groups_seeded: SEED_GROUP_IDS.len(),
            documents_seeded: SEED_DOCUMENTS
                .iter()
                .map(|doc| DocumentSeedInfo {
                    document_id: doc.document_id,
                    entity_type: doc.entity_type,
                    description: doc.description,
                })
                .collect(),
        })
    }

    /// Checks that the seed is present and that each seeded document still
    /// loads as a valid, active configuration.
    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        let institution: i64 =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM institution WHERE id = ?1)")
                .bind(DEMO_INSTITUTION_ID)
                .fetch_one(pool)
                .await?;
        checks.push(("institution", institution == 1));

        let users: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(1) FROM app_user WHERE deleted_at IS NULL AND id IN {}",
            sql_array_from_ids(SEED_USER_IDS)
        ))
        .fetch_one(pool)
        .await?;
        checks.push(("users", users == SEED_USER_IDS.len() as i64));

        let groups: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(1) FROM approver_group WHERE deleted_at IS NULL AND id IN {}",
            sql_array_from_ids(SEED_GROUP_IDS)
        ))
        .fetch_one(pool)
        .await?;
        checks.push(("groups", groups == SEED_GROUP_IDS.len() as i64));

        let repository = SqlDocumentRepository::new(pool.clone());
        for contract in SEED_DOCUMENTS {
            let document = repository
                .find_document(&ApprovalDocumentId(contract.document_id.to_string()))
                .await
                .map_err(|e| RepositoryError::Invalid(e.to_string()))?;
            let valid = document.is_some_and(|doc| {
                doc.active
                    && doc.entity_type.as_str() == contract.entity_type
                    && doc.levels.len() == contract.expected_levels
                    && doc.validate().is_ok()
            });
            checks.push((contract.document_id, valid));
        }

        let all_present = checks.iter().all(|(_, ok)| *ok);
        Ok(VerificationResult { all_present, checks })
    }

    /// Removes the demo institution and everything recorded under it,
    /// including workflows started against the demo documents.
    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        let mut tx = pool.begin().await?;

        for statement in [
            "DELETE FROM entity_approval_state WHERE institution_id = ?1",
            "DELETE FROM approval_task WHERE approval_id IN
                 (SELECT id FROM approval WHERE institution_id = ?1)",
            "DELETE FROM approval WHERE institution_id = ?1",
            "DELETE FROM approval_document WHERE institution_id = ?1",
            "DELETE FROM approver_group WHERE institution_id = ?1",
            "DELETE FROM user_role WHERE user_id IN
                 (SELECT id FROM app_user WHERE institution_id = ?1)",
            "DELETE FROM role WHERE institution_id = ?1",
            "DELETE FROM app_user WHERE institution_id = ?1",
            "DELETE FROM institution WHERE id = ?1",
        ] {
            sqlx::query(statement).bind(DEMO_INSTITUTION_ID).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn sql_array_from_ids(ids: &[&str]) -> String {
    let quoted = ids.iter().map(|id| format!("'{}'", id)).collect::<Vec<_>>().join(",");
    format!("({quoted})")
}

#[derive(Debug, Serialize)]
pub struct SeedResult {
    pub institution_id: &'static str,
    pub users_seeded: usize,
    pub groups_seeded: usize,
    pub documents_seeded: Vec<DocumentSeedInfo>,
}

#[derive(Debug, Serialize)]
pub struct DocumentSeedInfo {
    pub document_id: &'static str,
    pub entity_type: &'static str,
    pub description: &'static str,
}

#[derive(Debug, Serialize)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}
