pub mod application;
pub mod domain;
pub mod infrastructure;

#[cfg(test)]
mod test_support;

use application::bootstrap::{bootstrap_workspace, BootstrapResult};
use application::calendar_gateway::CalendarGateway;
use application::calendar_sync::CalendarSyncManager;
use application::channels::{ChannelRegistry, SystemChannel, TelegramChannel};
use application::dispatcher::NotificationDispatcher;
use application::engine::ReminderEngine;
use application::fallback_scheduler::FallbackScheduler;
use application::jobs::{JobWorker, JobWorkerConfig, TokioJobScheduler};
use application::oauth::{CredentialManager, OAuthConfig};
use application::transfer::TransferOrchestrator;
use domain::models::ChannelType;
use infrastructure::credential_store::KeyringCredentialStore;
use infrastructure::error::InfraError;
use infrastructure::google_calendar_client::ReqwestGoogleCalendarClient;
use infrastructure::logging::init_logging;
use infrastructure::notification_repository::SqliteNotificationRepository;
use infrastructure::oauth_client::ReqwestOAuthClient;
use infrastructure::recipient_directory::SqliteRecipientDirectory;
use infrastructure::task_repository::SqliteTaskRepository;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_LOG_LEVEL: &str = "info";

/// Production wiring: SQLite stores, OS keyring, Google Calendar and Telegram.
pub struct EngineRuntime {
    pub engine: Arc<ReminderEngine>,
    pub worker: JobWorker,
}

pub fn build_runtime(bootstrap: &BootstrapResult) -> Result<EngineRuntime, InfraError> {
    let settings = &bootstrap.settings;
    let http = reqwest::Client::new();

    let tasks = Arc::new(SqliteTaskRepository::new(&bootstrap.database_path));
    let notifications = Arc::new(SqliteNotificationRepository::new(&bootstrap.database_path));
    let recipients = Arc::new(SqliteRecipientDirectory::new(&bootstrap.database_path));

    let credentials = Arc::new(CredentialManager::new(
        OAuthConfig::from_env()?,
        Arc::new(KeyringCredentialStore::default()),
        Arc::new(ReqwestOAuthClient::new(http.clone())),
    ));
    let gateway = Arc::new(CalendarGateway::new(
        credentials,
        Arc::new(ReqwestGoogleCalendarClient::new(http.clone())),
        settings.calendar.clone(),
    ));

    let mut channels = ChannelRegistry::new().with_channel(ChannelType::System, Arc::new(SystemChannel));
    match TelegramChannel::from_env(http) {
        Ok(telegram) => channels = channels.with_channel(ChannelType::Telegram, Arc::new(telegram)),
        Err(error) => warn!(%error, "telegram channel disabled"),
    }

    let (scheduler, receiver) = TokioJobScheduler::new();
    let scheduler = Arc::new(scheduler);
    let dispatcher = Arc::new(NotificationDispatcher::new(
        notifications.clone(),
        recipients,
        channels,
        scheduler.clone(),
        settings.delivery.clone(),
    ));
    let fallback = Arc::new(
        FallbackScheduler::new(notifications.clone(), dispatcher.clone())
            .with_time_zone(settings.calendar.timezone.as_deref()),
    );
    let sync = Arc::new(CalendarSyncManager::new(
        tasks.clone(),
        gateway.clone(),
        fallback.clone(),
        dispatcher.clone(),
        settings.reminders.clone(),
    ));
    let transfer = Arc::new(TransferOrchestrator::new(
        tasks,
        notifications,
        sync.clone(),
        fallback,
        dispatcher.clone(),
        scheduler,
    ));
    let engine = Arc::new(ReminderEngine::new(
        gateway,
        sync,
        transfer,
        dispatcher,
        settings.reminders.clone(),
    ));

    let worker = JobWorker::new(
        engine.clone(),
        receiver,
        JobWorkerConfig {
            sweep_interval: settings.delivery.sweep_interval,
            ..JobWorkerConfig::default()
        },
    );
    Ok(EngineRuntime { engine, worker })
}

/// Bootstraps the workspace and runs the job worker until Ctrl-C.
pub async fn run(workspace_root: &Path) -> Result<(), InfraError> {
    let bootstrap = bootstrap_workspace(workspace_root)?;
    let _log_guard = init_logging(&bootstrap.logs_dir, DEFAULT_LOG_LEVEL)?;
    info!(
        workspace = %bootstrap.workspace_root.display(),
        database = %bootstrap.database_path.display(),
        "remindsync worker starting"
    );

    let mut runtime = build_runtime(&bootstrap)?;
    runtime.worker.start()?;
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    runtime.worker.stop().await
}
