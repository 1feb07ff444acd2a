use std::sync::Arc;

use ladder_core::config::LoadOptions;
use ladder_core::workflow::{InMemoryNotifier, Notification};
use ladder_core::{ReminderReport, ReminderScheduler};
use ladder_db::{SqlDocumentRepository, SqlIdentityDirectory, SqlWorkflowStore};
use serde::Serialize;

use crate::commands::{load_config, migrated_pool, runtime, CommandResult};

#[derive(Debug, Serialize)]
struct RemindOutput {
    stale_after_hours: i64,
    report: ReminderReport,
    reminders: Vec<Notification>,
}

/// Runs one reminder scan. Reminders are collected and returned in the
/// command output rather than delivered; the server's loop owns delivery.
pub fn run(options: LoadOptions, stale_after_hours: Option<u64>) -> CommandResult {
    let mut config = match load_config("remind", options) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    if let Some(hours) = stale_after_hours {
        config.reminders.stale_after_hours = hours;
    }
    let runtime = match runtime("remind") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = migrated_pool(&config).await?;
        let store = Arc::new(SqlWorkflowStore::new(pool.clone()));
        let notifier = Arc::new(InMemoryNotifier::default());
        let scheduler_config = config.reminders.scheduler_config();
        let scheduler = ReminderScheduler::new(
            store,
            Arc::new(SqlDocumentRepository::new(pool.clone())),
            Arc::new(SqlIdentityDirectory::new(pool.clone())),
            notifier.clone(),
            scheduler_config,
        );

        let report =
            scheduler.scan().await.map_err(|error| ("reminder_scan", error.to_string(), 6u8));
        pool.close().await;

        Ok::<_, (&'static str, String, u8)>(RemindOutput {
            stale_after_hours: scheduler_config.stale_after.num_hours(),
            report: report?,
            reminders: notifier.sent(),
        })
    });

    match result {
        Ok(output) => CommandResult::success_with_data(
            "remind",
            format!(
                "{} stale task(s), {} reminder(s) produced",
                output.report.tasks_scanned, output.report.notifications_sent
            ),
            &output,
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("remind", error_class, message, exit_code)
        }
    }
}
