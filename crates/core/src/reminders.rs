//! Periodic nudges for approval tasks nobody has acted on.
//!
//! A scan is read-only: it never touches task timestamps, so the same stale
//! task is reported again on every scan until someone decides it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::document::{ApprovalDocument, ApprovalDocumentId};
use crate::workflow::{
    ApproverResolver, DocumentCatalog, IdentityDirectory, Notification, NotificationKind,
    Notifier, WorkflowError, WorkflowStore,
};

pub const DEFAULT_STALE_AFTER_HOURS: i64 = 72;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReminderConfig {
    pub stale_after: Duration,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self { stale_after: Duration::hours(DEFAULT_STALE_AFTER_HOURS) }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReminderReport {
    pub tasks_scanned: usize,
    pub notifications_sent: usize,
    pub notification_failures: usize,
    /// Tasks whose document or level no longer exists.
    pub tasks_skipped: usize,
}

pub struct ReminderScheduler {
    store: Arc<dyn WorkflowStore>,
    catalog: Arc<dyn DocumentCatalog>,
    resolver: ApproverResolver,
    notifier: Arc<dyn Notifier>,
    config: ReminderConfig,
}

impl ReminderScheduler {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        catalog: Arc<dyn DocumentCatalog>,
        directory: Arc<dyn IdentityDirectory>,
        notifier: Arc<dyn Notifier>,
        config: ReminderConfig,
    ) -> Self {
        Self { store, catalog, resolver: ApproverResolver::new(directory), notifier, config }
    }

    pub fn config(&self) -> ReminderConfig {
        self.config
    }

    pub async fn scan(&self) -> Result<ReminderReport, WorkflowError> {
        self.scan_at(Utc::now()).await
    }

    pub async fn scan_at(&self, now: DateTime<Utc>) -> Result<ReminderReport, WorkflowError> {
        let cutoff = now - self.config.stale_after;
        let stale = self.store.list_stale_pending_tasks(cutoff).await?;
        let mut documents: HashMap<ApprovalDocumentId, Option<ApprovalDocument>> = HashMap::new();
        let mut report = ReminderReport { tasks_scanned: stale.len(), ..ReminderReport::default() };

        for item in stale {
            let approval = &item.approval;
            let task = &item.task;
            if !documents.contains_key(&approval.document_id) {
                let document = self.catalog.find_document(&approval.document_id).await?;
                documents.insert(approval.document_id.clone(), document);
            }
            let Some(level) = documents
                .get(&approval.document_id)
                .and_then(Option::as_ref)
                .and_then(|document| document.level(task.level))
            else {
                warn!(
                    event_name = "reminders.task.skipped",
                    approval_id = %approval.id,
                    task_id = %task.id,
                    document_id = %approval.document_id,
                    level = task.level,
                    "stale task has no matching document level"
                );
                report.tasks_skipped += 1;
                continue;
            };

            let approvers = self.resolver.approvers(&approval.institution_id, level).await?;
            let waiting_hours = (now - task.updated_at).num_hours();
            debug!(
                event_name = "reminders.task.stale",
                approval_id = %approval.id,
                task_id = %task.id,
                approvers = approvers.len(),
                waiting_hours,
                "reminding approvers of stale task"
            );

            for recipient in approvers {
                let notification = Notification {
                    recipient: recipient.clone(),
                    institution_id: approval.institution_id.clone(),
                    kind: NotificationKind::TaskReminder,
                    message: format!(
                        "Reminder: {} has waited {waiting_hours}h for your approval at level {}",
                        approval.entity_label, task.level
                    ),
                    approval_id: approval.id.clone(),
                    task_id: Some(task.id.clone()),
                };
                match self.notifier.notify(notification).await {
                    Ok(()) => report.notifications_sent += 1,
                    Err(error) => {
                        warn!(
                            event_name = "reminders.notification.failed",
                            task_id = %task.id,
                            recipient = %recipient,
                            error = %error,
                            "reminder delivery failed"
                        );
                        report.notification_failures += 1;
                    }
                }
            }
        }

        info!(
            event_name = "reminders.scan.completed",
            tasks_scanned = report.tasks_scanned,
            notifications_sent = report.notifications_sent,
            notification_failures = report.notification_failures,
            tasks_skipped = report.tasks_skipped,
            "reminder scan completed"
        );
        Ok(report)
    }
}
