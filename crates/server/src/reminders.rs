use std::sync::Arc;
use std::time::Duration;

use ladder_core::ReminderScheduler;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Runs a reminder scan every `interval` until `shutdown` flips to true.
/// The first scan happens one full interval after start.
pub fn spawn_reminder_loop(
    scheduler: Arc<ReminderScheduler>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            event_name = "reminders.loop.started",
            correlation_id = "reminders",
            interval_secs = interval.as_secs(),
            stale_after_hours = scheduler.config().stale_after.num_hours(),
            "reminder loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => run_scan(&scheduler).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            event_name = "reminders.loop.stopped",
            correlation_id = "reminders",
            "reminder loop stopped"
        );
    })
}

async fn run_scan(scheduler: &ReminderScheduler) {
    match scheduler.scan().await {
        Ok(report) => info!(
            event_name = "reminders.scan.completed",
            correlation_id = "reminders",
            tasks_scanned = report.tasks_scanned,
            notifications_sent = report.notifications_sent,
            notification_failures = report.notification_failures,
            tasks_skipped = report.tasks_skipped,
            "reminder scan completed"
        ),
        Err(scan_error) => error!(
            event_name = "reminders.scan.failed",
            correlation_id = "reminders",
            error = %scan_error,
            "reminder scan failed"
        ),
    }
}
