use std::sync::Arc;

use ladder_core::config::{AppConfig, ConfigError, LoadOptions};
use ladder_core::workflow::EntityHookRegistry;
use ladder_core::{ApprovalWorkflow, ReminderScheduler, TracingAuditSink};
use ladder_db::{
    connect_with_settings, migrations, DbPool, SqlDocumentRepository, SqlEntityStateRecorder,
    SqlIdentityDirectory, SqlWorkflowStore,
};
use thiserror::Error;
use tracing::info;

use crate::notifier;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub workflow: ApprovalWorkflow,
    pub reminders: Arc<ReminderScheduler>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("notifier setup failed: {0}")]
    Notifier(#[source] reqwest::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let store = Arc::new(SqlWorkflowStore::new(db_pool.clone()));
    let catalog = Arc::new(SqlDocumentRepository::new(db_pool.clone()));
    let directory = Arc::new(SqlIdentityDirectory::new(db_pool.clone()));
    let notifier =
        notifier::from_config(&config.notifications).map_err(BootstrapError::Notifier)?;
    let hooks = EntityHookRegistry::default()
        .register_all(Arc::new(SqlEntityStateRecorder::new(db_pool.clone())));

    let workflow = ApprovalWorkflow::new(
        store.clone(),
        catalog.clone(),
        directory.clone(),
        notifier.clone(),
        Arc::new(TracingAuditSink),
    )
    .with_hooks(hooks);
    let reminders = Arc::new(ReminderScheduler::new(
        store,
        catalog,
        directory,
        notifier,
        config.reminders.scheduler_config(),
    ));
    info!(
        event_name = "system.bootstrap.workflow_ready",
        correlation_id = "bootstrap",
        webhook_enabled = config.notifications.webhook_url.is_some(),
        reminders_enabled = config.reminders.enabled,
        "approval workflow wired"
    );

    Ok(Application { config, db_pool, workflow, reminders })
}
