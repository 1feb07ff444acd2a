use std::collections::BTreeSet;

use chrono::Utc;

use ladder_core::domain::identity::{ApproverGroup, GroupId, InstitutionId, RoleId, UserId};
use ladder_core::workflow::{DirectoryError, IdentityDirectory};

use super::{encode_timestamp, RepositoryError};
use crate::DbPool;

fn unavailable(error: sqlx::Error) -> DirectoryError {
    DirectoryError::Unavailable(error.to_string())
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Reads users, roles and approver groups from the local identity tables.
/// Soft-deleted rows (`deleted_at IS NOT NULL`) never resolve.
pub struct SqlIdentityDirectory {
    pool: DbPool,
}

impl SqlIdentityDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn upsert_institution(
        &self,
        id: &InstitutionId,
        name: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO institution (id, name, created_at) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        )
        .bind(&id.0)
        .bind(name)
        .bind(encode_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_user(
        &self,
        institution_id: &InstitutionId,
        user_id: &UserId,
        display_name: &str,
        email: Option<&str>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO app_user (id, institution_id, display_name, email, deleted_at, created_at)
             VALUES (?, ?, ?, ?, NULL, ?)
             ON CONFLICT(id) DO UPDATE SET
                 institution_id = excluded.institution_id,
                 display_name = excluded.display_name,
                 email = excluded.email,
                 deleted_at = NULL",
        )
        .bind(&user_id.0)
        .bind(&institution_id.0)
        .bind(display_name)
        .bind(email)
        .bind(encode_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn soft_delete_user(&self, user_id: &UserId) -> Result<bool, RepositoryError> {
        self.soft_delete("app_user", &user_id.0).await
    }

    pub async fn upsert_role(
        &self,
        institution_id: &InstitutionId,
        role_id: &RoleId,
        name: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO role (id, institution_id, name, deleted_at, created_at)
             VALUES (?, ?, ?, NULL, ?)
             ON CONFLICT(id) DO UPDATE SET
                 institution_id = excluded.institution_id,
                 name = excluded.name,
                 deleted_at = NULL",
        )
        .bind(&role_id.0)
        .bind(&institution_id.0)
        .bind(name)
        .bind(encode_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn soft_delete_role(&self, role_id: &RoleId) -> Result<bool, RepositoryError> {
        self.soft_delete("role", &role_id.0).await
    }

    pub async fn assign_role(&self, user_id: &UserId, role_id: &RoleId) -> Result<(), RepositoryError> {
        sqlx::query("INSERT OR IGNORE INTO user_role (user_id, role_id) VALUES (?, ?)")
            .bind(&user_id.0)
            .bind(&role_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn revoke_role(&self, user_id: &UserId, role_id: &RoleId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM user_role WHERE user_id = ? AND role_id = ?")
            .bind(&user_id.0)
            .bind(&role_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Writes a group and replaces its user and role membership.
    pub async fn upsert_group(&self, group: &ApproverGroup) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO approver_group (id, institution_id, name, deleted_at, created_at)
             VALUES (?, ?, ?, NULL, ?)
             ON CONFLICT(id) DO UPDATE SET
                 institution_id = excluded.institution_id,
                 name = excluded.name,
                 deleted_at = NULL",
        )
        .bind(&group.id.0)
        .bind(&group.institution_id.0)
        .bind(&group.name)
        .bind(encode_timestamp(Utc::now()))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM approver_group_user WHERE group_id = ?")
            .bind(&group.id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM approver_group_role WHERE group_id = ?")
            .bind(&group.id.0)
            .execute(&mut *tx)
            .await?;

        for user_id in &group.users {
            sqlx::query("INSERT OR IGNORE INTO approver_group_user (group_id, user_id) VALUES (?, ?)")
                .bind(&group.id.0)
                .bind(&user_id.0)
                .execute(&mut *tx)
                .await?;
        }
        for role_id in &group.roles {
            sqlx::query("INSERT OR IGNORE INTO approver_group_role (group_id, role_id) VALUES (?, ?)")
                .bind(&group.id.0)
                .bind(&role_id.0)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn soft_delete_group(&self, group_id: &GroupId) -> Result<bool, RepositoryError> {
        self.soft_delete("approver_group", &group_id.0).await
    }

    async fn soft_delete(&self, table: &str, id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query(&format!(
            "UPDATE {table} SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL"
        ))
        .bind(encode_timestamp(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait::async_trait]
impl IdentityDirectory for SqlIdentityDirectory {
    async fn active_users(
        &self,
        institution_id: &InstitutionId,
        candidates: &[UserId],
    ) -> Result<BTreeSet<UserId>, DirectoryError> {
        if candidates.is_empty() {
            return Ok(BTreeSet::new());
        }

        let sql = format!(
            "SELECT id FROM app_user
             WHERE institution_id = ? AND deleted_at IS NULL AND id IN ({})",
            placeholders(candidates.len())
        );
        let mut query = sqlx::query_scalar::<_, String>(&sql).bind(&institution_id.0);
        for candidate in candidates {
            query = query.bind(&candidate.0);
        }

        let ids = query.fetch_all(&self.pool).await.map_err(unavailable)?;
        Ok(ids.into_iter().map(UserId).collect())
    }

    async fn group_membership(
        &self,
        institution_id: &InstitutionId,
        group_id: &GroupId,
    ) -> Result<Option<ApproverGroup>, DirectoryError> {
        let name: Option<String> = sqlx::query_scalar(
            "SELECT name FROM approver_group
             WHERE id = ? AND institution_id = ? AND deleted_at IS NULL",
        )
        .bind(&group_id.0)
        .bind(&institution_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        let Some(name) = name else {
            return Ok(None);
        };

        let users: Vec<String> = sqlx::query_scalar(
            "SELECT user_id FROM approver_group_user WHERE group_id = ? ORDER BY user_id",
        )
        .bind(&group_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        let roles: Vec<String> = sqlx::query_scalar(
            "SELECT role_id FROM approver_group_role WHERE group_id = ? ORDER BY role_id",
        )
        .bind(&group_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(Some(ApproverGroup {
            id: group_id.clone(),
            institution_id: institution_id.clone(),
            name,
            users: users.into_iter().map(UserId).collect(),
            roles: roles.into_iter().map(RoleId).collect(),
        }))
    }

    async fn users_holding_roles(
        &self,
        institution_id: &InstitutionId,
        roles: &[RoleId],
    ) -> Result<BTreeSet<UserId>, DirectoryError> {
        if roles.is_empty() {
            return Ok(BTreeSet::new());
        }

        let sql = format!(
            "SELECT DISTINCT u.id
             FROM user_role ur
             JOIN app_user u ON u.id = ur.user_id
             JOIN role r ON r.id = ur.role_id
             WHERE u.institution_id = ? AND u.deleted_at IS NULL
               AND r.institution_id = ? AND r.deleted_at IS NULL
               AND r.id IN ({})",
            placeholders(roles.len())
        );
        let mut query = sqlx::query_scalar::<_, String>(&sql)
            .bind(&institution_id.0)
            .bind(&institution_id.0);
        for role in roles {
            query = query.bind(&role.0);
        }

        let ids = query.fetch_all(&self.pool).await.map_err(unavailable)?;
        Ok(ids.into_iter().map(UserId).collect())
    }
}
