use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::document::{ApprovalDocumentLevel, Principal};
use crate::domain::identity::{ApproverGroup, GroupId, InstitutionId, RoleId, UserId};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("identity directory unavailable: {0}")]
    Unavailable(String),
}

/// Identity and role lookups owned by the identity subsystem. Every method
/// is institution-scoped and must ignore soft-deleted users, roles and
/// groups.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// The subset of `candidates` that are active users of the institution.
    async fn active_users(
        &self,
        institution_id: &InstitutionId,
        candidates: &[UserId],
    ) -> Result<BTreeSet<UserId>, DirectoryError>;

    async fn group_membership(
        &self,
        institution_id: &InstitutionId,
        group_id: &GroupId,
    ) -> Result<Option<ApproverGroup>, DirectoryError>;

    async fn users_holding_roles(
        &self,
        institution_id: &InstitutionId,
        roles: &[RoleId],
    ) -> Result<BTreeSet<UserId>, DirectoryError>;
}

/// What a user may do on one level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Standing {
    pub approver: bool,
    pub overrider: bool,
}

impl Standing {
    pub fn may_decide(&self) -> bool {
        self.approver || self.overrider
    }
}

/// Turns level principals into concrete user ids. Nothing is cached: each
/// call reads the directory, so role changes apply to the next check.
#[derive(Clone)]
pub struct ApproverResolver {
    directory: Arc<dyn IdentityDirectory>,
}

impl ApproverResolver {
    pub fn new(directory: Arc<dyn IdentityDirectory>) -> Self {
        Self { directory }
    }

    pub async fn resolve(
        &self,
        institution_id: &InstitutionId,
        principals: &[Principal],
    ) -> Result<BTreeSet<UserId>, DirectoryError> {
        let mut direct = Vec::new();
        let mut groups = Vec::new();
        for principal in principals {
            match principal {
                Principal::User(user_id) => direct.push(user_id.clone()),
                Principal::Group(group_id) => groups.push(group_id.clone()),
            }
        }

        let mut resolved = if direct.is_empty() {
            BTreeSet::new()
        } else {
            self.directory.active_users(institution_id, &direct).await?
        };

        for group_id in &groups {
            let Some(group) = self.directory.group_membership(institution_id, group_id).await?
            else {
                continue;
            };

            if !group.users.is_empty() {
                resolved.extend(self.directory.active_users(institution_id, &group.users).await?);
            }
            if !group.roles.is_empty() {
                resolved
                    .extend(self.directory.users_holding_roles(institution_id, &group.roles).await?);
            }
        }

        Ok(resolved)
    }

    pub async fn approvers(
        &self,
        institution_id: &InstitutionId,
        level: &ApprovalDocumentLevel,
    ) -> Result<BTreeSet<UserId>, DirectoryError> {
        self.resolve(institution_id, &level.approvers).await
    }

    pub async fn overriders(
        &self,
        institution_id: &InstitutionId,
        level: &ApprovalDocumentLevel,
    ) -> Result<BTreeSet<UserId>, DirectoryError> {
        self.resolve(institution_id, &level.overriders).await
    }

    pub async fn standing(
        &self,
        institution_id: &InstitutionId,
        level: &ApprovalDocumentLevel,
        user_id: &UserId,
    ) -> Result<Standing, DirectoryError> {
        let approver = self.approvers(institution_id, level).await?.contains(user_id);
        let overrider = self.overriders(institution_id, level).await?.contains(user_id);
        Ok(Standing { approver, overrider })
    }
}

#[derive(Clone, Debug)]
struct UserRecord {
    institution_id: InstitutionId,
    deleted: bool,
}

#[derive(Clone, Debug)]
struct RoleRecord {
    institution_id: InstitutionId,
    deleted: bool,
}

#[derive(Clone, Debug)]
struct GroupRecord {
    group: ApproverGroup,
    deleted: bool,
}

#[derive(Debug, Default)]
struct DirectoryState {
    users: HashMap<UserId, UserRecord>,
    roles: HashMap<RoleId, RoleRecord>,
    assignments: HashSet<(UserId, RoleId)>,
    groups: HashMap<GroupId, GroupRecord>,
}

/// Mutable in-process directory for tests and demos.
#[derive(Debug, Default)]
pub struct InMemoryIdentityDirectory {
    state: RwLock<DirectoryState>,
}

impl InMemoryIdentityDirectory {
    pub fn add_user(&self, institution_id: &InstitutionId, user_id: &UserId) {
        self.write(|state| {
            state.users.insert(
                user_id.clone(),
                UserRecord { institution_id: institution_id.clone(), deleted: false },
            );
        });
    }

    pub fn delete_user(&self, user_id: &UserId) {
        self.write(|state| {
            if let Some(record) = state.users.get_mut(user_id) {
                record.deleted = true;
            }
        });
    }

    pub fn add_role(&self, institution_id: &InstitutionId, role_id: &RoleId) {
        self.write(|state| {
            state.roles.insert(
                role_id.clone(),
                RoleRecord { institution_id: institution_id.clone(), deleted: false },
            );
        });
    }

    pub fn delete_role(&self, role_id: &RoleId) {
        self.write(|state| {
            if let Some(record) = state.roles.get_mut(role_id) {
                record.deleted = true;
            }
        });
    }

    pub fn assign_role(&self, user_id: &UserId, role_id: &RoleId) {
        self.write(|state| {
            state.assignments.insert((user_id.clone(), role_id.clone()));
        });
    }

    pub fn revoke_role(&self, user_id: &UserId, role_id: &RoleId) {
        self.write(|state| {
            state.assignments.remove(&(user_id.clone(), role_id.clone()));
        });
    }

    pub fn add_group(&self, group: ApproverGroup) {
        self.write(|state| {
            state.groups.insert(group.id.clone(), GroupRecord { group, deleted: false });
        });
    }

    pub fn delete_group(&self, group_id: &GroupId) {
        self.write(|state| {
            if let Some(record) = state.groups.get_mut(group_id) {
                record.deleted = true;
            }
        });
    }

    fn write(&self, apply: impl FnOnce(&mut DirectoryState)) {
        match self.state.write() {
            Ok(mut state) => apply(&mut state),
            Err(poisoned) => apply(&mut poisoned.into_inner()),
        }
    }

    fn read<T>(&self, view: impl FnOnce(&DirectoryState) -> T) -> T {
        match self.state.read() {
            Ok(state) => view(&state),
            Err(poisoned) => view(&poisoned.into_inner()),
        }
    }
}

impl DirectoryState {
    fn is_active_user(&self, institution_id: &InstitutionId, user_id: &UserId) -> bool {
        self.users
            .get(user_id)
            .is_some_and(|record| !record.deleted && &record.institution_id == institution_id)
    }

    fn is_active_role(&self, institution_id: &InstitutionId, role_id: &RoleId) -> bool {
        self.roles
            .get(role_id)
            .is_some_and(|record| !record.deleted && &record.institution_id == institution_id)
    }
}

#[async_trait]
impl IdentityDirectory for InMemoryIdentityDirectory {
    async fn active_users(
        &self,
        institution_id: &InstitutionId,
        candidates: &[UserId],
    ) -> Result<BTreeSet<UserId>, DirectoryError> {
        Ok(self.read(|state| {
            candidates
                .iter()
                .filter(|user_id| state.is_active_user(institution_id, user_id))
                .cloned()
                .collect()
        }))
    }

    async fn group_membership(
        &self,
        institution_id: &InstitutionId,
        group_id: &GroupId,
    ) -> Result<Option<ApproverGroup>, DirectoryError> {
        Ok(self.read(|state| {
            state
                .groups
                .get(group_id)
                .filter(|record| {
                    !record.deleted && &record.group.institution_id == institution_id
                })
                .map(|record| record.group.clone())
        }))
    }

    async fn users_holding_roles(
        &self,
        institution_id: &InstitutionId,
        roles: &[RoleId],
    ) -> Result<BTreeSet<UserId>, DirectoryError> {
        Ok(self.read(|state| {
            state
                .assignments
                .iter()
                .filter(|(user_id, role_id)| {
                    roles.contains(role_id)
                        && state.is_active_role(institution_id, role_id)
                        && state.is_active_user(institution_id, user_id)
                })
                .map(|(user_id, _)| user_id.clone())
                .collect()
        }))
    }
}
