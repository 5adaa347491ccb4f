//! Fakes and a fully wired engine for unit tests.

use crate::application::calendar_gateway::CalendarGateway;
use crate::application::calendar_sync::CalendarSyncManager;
use crate::application::channels::{ChannelRegistry, DeliveryChannel, DeliveryError, SystemChannel};
use crate::application::dispatcher::NotificationDispatcher;
use crate::application::engine::ReminderEngine;
use crate::application::fallback_scheduler::FallbackScheduler;
use crate::application::jobs::InMemoryJobScheduler;
use crate::application::oauth::{CredentialManager, OAuthConfig};
use crate::application::transfer::TransferOrchestrator;
use crate::application::NowProvider;
use crate::domain::models::{ChannelType, Notification, NotificationStatus, OAuthToken, Role};
use crate::domain::reminders::ReminderPolicy;
use crate::infrastructure::config::{CalendarSettings, DeliveryPolicy};
use crate::infrastructure::credential_store::{CredentialStore, InMemoryCredentialStore};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_mapper::{decode_correlation, GoogleCalendarEvent};
use crate::infrastructure::google_calendar_client::{CalendarProviderClient, GoogleCalendarSummary};
use crate::infrastructure::notification_repository::InMemoryNotificationRepository;
use crate::infrastructure::oauth_client::{OAuthHttpClient, OAuthRefreshRequest, OAuthTokenResponse};
use crate::infrastructure::recipient_directory::InMemoryRecipientDirectory;
use crate::infrastructure::task_repository::InMemoryTaskRepository;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn fixed_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .expect("valid datetime")
        .with_timezone(&Utc)
}

/// Directory under the system temp dir, removed on drop.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new(prefix: &str) -> Self {
        let path = std::env::temp_dir().join(format!("{prefix}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&path).expect("create temp dir");
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

#[derive(Clone)]
pub struct TestClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl Default for TestClock {
    fn default() -> Self {
        Self {
            now: Arc::new(Mutex::new(fixed_time("2026-03-01T09:00:00Z"))),
        }
    }
}

impl TestClock {
    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock mutex poisoned")
    }

    pub fn set(&self, value: &str) {
        *self.now.lock().expect("clock mutex poisoned") = fixed_time(value);
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().expect("clock mutex poisoned") += by;
    }

    pub fn provider(&self) -> NowProvider {
        let clock = self.clone();
        Arc::new(move || clock.now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeRefresh {
    Success,
    Rejected,
    Unavailable,
}

pub struct FakeOAuthHttpClient {
    pub refresh_calls: AtomicUsize,
    behaviour: Mutex<FakeRefresh>,
}

impl Default for FakeOAuthHttpClient {
    fn default() -> Self {
        Self {
            refresh_calls: AtomicUsize::new(0),
            behaviour: Mutex::new(FakeRefresh::Success),
        }
    }
}

impl FakeOAuthHttpClient {
    pub fn set_refresh(&self, behaviour: FakeRefresh) {
        *self.behaviour.lock().expect("refresh mutex poisoned") = behaviour;
    }
}

#[async_trait]
impl OAuthHttpClient for FakeOAuthHttpClient {
    async fn refresh_access_token(
        &self,
        _request: OAuthRefreshRequest,
    ) -> Result<OAuthTokenResponse, InfraError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        match *self.behaviour.lock().expect("refresh mutex poisoned") {
            FakeRefresh::Success => Ok(OAuthTokenResponse {
                access_token: "fresh-access".to_string(),
                refresh_token: None,
                expires_in: 3600,
                token_type: Some("Bearer".to_string()),
                scope: None,
            }),
            FakeRefresh::Rejected => Err(InfraError::AuthRequired("invalid_grant".to_string())),
            FakeRefresh::Unavailable => Err(InfraError::Transient("token endpoint timeout".to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    Auth,
    Transient,
    Provider,
    NotFound,
}

impl FakeFailure {
    fn into_error(self, op: &str) -> InfraError {
        match self {
            Self::Auth => InfraError::AuthRequired(format!("{op}: http 401")),
            Self::Transient => InfraError::Transient(format!("{op}: timeout")),
            Self::Provider => InfraError::Provider(format!("{op}: http 400")),
            Self::NotFound => InfraError::NotFound(format!("{op}: http 404")),
        }
    }
}

/// Calendar provider kept in memory. Failures injected with [`Self::fail`]
/// persist until [`Self::clear_failures`].
#[derive(Default)]
pub struct FakeCalendarProvider {
    pub list_calls: AtomicUsize,
    pub create_calendar_calls: AtomicUsize,
    pub create_event_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    calendars: Mutex<Vec<GoogleCalendarSummary>>,
    events: Mutex<BTreeMap<String, GoogleCalendarEvent>>,
    failures: Mutex<HashMap<String, FakeFailure>>,
    next_id: AtomicUsize,
}

impl FakeCalendarProvider {
    pub fn add_calendar(&self, calendar: GoogleCalendarSummary) {
        self.calendars.lock().expect("calendars mutex poisoned").push(calendar);
    }

    pub fn calendar_names(&self) -> Vec<String> {
        self.calendars
            .lock()
            .expect("calendars mutex poisoned")
            .iter()
            .map(|calendar| calendar.summary.clone())
            .collect()
    }

    pub fn fail(&self, op: &str, failure: FakeFailure) {
        self.failures
            .lock()
            .expect("failures mutex poisoned")
            .insert(op.to_string(), failure);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().expect("failures mutex poisoned").clear();
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().expect("events mutex poisoned").len()
    }

    pub fn event(&self, event_id: &str) -> Option<GoogleCalendarEvent> {
        self.events
            .lock()
            .expect("events mutex poisoned")
            .get(event_id)
            .cloned()
    }

    /// Simulates a user deleting the event in the calendar UI.
    pub fn remove_event(&self, event_id: &str) {
        self.events.lock().expect("events mutex poisoned").remove(event_id);
    }

    fn check(&self, op: &str) -> Result<(), InfraError> {
        match self.failures.lock().expect("failures mutex poisoned").get(op) {
            Some(failure) => Err(failure.into_error(op)),
            None => Ok(()),
        }
    }

    fn missing(event_id: &str) -> InfraError {
        InfraError::NotFound(format!("event {event_id}"))
    }
}

#[async_trait]
impl CalendarProviderClient for FakeCalendarProvider {
    async fn list_calendars(&self, _access_token: &str) -> Result<Vec<GoogleCalendarSummary>, InfraError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check("list_calendars")?;
        Ok(self.calendars.lock().expect("calendars mutex poisoned").clone())
    }

    async fn create_calendar(
        &self,
        _access_token: &str,
        summary: &str,
        _time_zone: Option<&str>,
    ) -> Result<GoogleCalendarSummary, InfraError> {
        let sequence = self.create_calendar_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.check("create_calendar")?;
        let calendar = GoogleCalendarSummary {
            id: format!("cal-{sequence}"),
            summary: summary.to_string(),
        };
        self.add_calendar(calendar.clone());
        Ok(calendar)
    }

    async fn get_event(
        &self,
        _access_token: &str,
        _calendar_id: &str,
        event_id: &str,
    ) -> Result<GoogleCalendarEvent, InfraError> {
        self.check("get_event")?;
        self.event(event_id).ok_or_else(|| Self::missing(event_id))
    }

    async fn find_events_by_correlation(
        &self,
        _access_token: &str,
        _calendar_id: &str,
        task_id: &str,
        role: Role,
    ) -> Result<Vec<GoogleCalendarEvent>, InfraError> {
        self.check("find_events")?;
        Ok(self
            .events
            .lock()
            .expect("events mutex poisoned")
            .values()
            .filter(|event| {
                decode_correlation(event).is_some_and(|tag| tag.task_id == task_id && tag.role == role)
            })
            .cloned()
            .collect())
    }

    async fn create_event(
        &self,
        _access_token: &str,
        _calendar_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<String, InfraError> {
        self.create_event_calls.fetch_add(1, Ordering::SeqCst);
        self.check("create_event")?;
        let event_id = format!("evt-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let mut stored = event.clone();
        stored.id = Some(event_id.clone());
        self.events
            .lock()
            .expect("events mutex poisoned")
            .insert(event_id.clone(), stored);
        Ok(event_id)
    }

    async fn update_event(
        &self,
        _access_token: &str,
        _calendar_id: &str,
        event_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<(), InfraError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.check("update_event")?;
        let mut events = self.events.lock().expect("events mutex poisoned");
        let slot = events.get_mut(event_id).ok_or_else(|| Self::missing(event_id))?;
        let mut stored = event.clone();
        stored.id = Some(event_id.to_string());
        *slot = stored;
        Ok(())
    }

    async fn delete_event(
        &self,
        _access_token: &str,
        _calendar_id: &str,
        event_id: &str,
    ) -> Result<(), InfraError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check("delete_event")?;
        self.events
            .lock()
            .expect("events mutex poisoned")
            .remove(event_id)
            .map(|_| ())
            .ok_or_else(|| Self::missing(event_id))
    }
}

/// Records recipients of successful sends; queued outcomes are consumed first.
#[derive(Default)]
pub struct FakeDeliveryChannel {
    sent: Mutex<Vec<String>>,
    outcomes: Mutex<VecDeque<Result<(), DeliveryError>>>,
}

impl FakeDeliveryChannel {
    pub fn push_outcome(&self, outcome: Result<(), DeliveryError>) {
        self.outcomes
            .lock()
            .expect("outcomes mutex poisoned")
            .push_back(outcome);
    }

    pub fn sent_to(&self) -> Vec<String> {
        self.sent.lock().expect("sent mutex poisoned").clone()
    }
}

#[async_trait]
impl DeliveryChannel for FakeDeliveryChannel {
    async fn send(&self, recipient: &str, _title: &str, _message: &str) -> Result<(), DeliveryError> {
        let outcome = self
            .outcomes
            .lock()
            .expect("outcomes mutex poisoned")
            .pop_front()
            .unwrap_or(Ok(()));
        if outcome.is_ok() {
            self.sent
                .lock()
                .expect("sent mutex poisoned")
                .push(recipient.to_string());
        }
        outcome
    }
}

/// The whole engine wired over in-memory stores and fakes, sharing one clock.
pub struct EngineHarness {
    pub clock: TestClock,
    pub tasks: Arc<InMemoryTaskRepository>,
    pub notifications: Arc<InMemoryNotificationRepository>,
    pub recipients: Arc<InMemoryRecipientDirectory>,
    pub credentials: Arc<InMemoryCredentialStore>,
    pub oauth_client: Arc<FakeOAuthHttpClient>,
    pub provider: Arc<FakeCalendarProvider>,
    pub scheduler: Arc<InMemoryJobScheduler>,
    pub channel: Arc<FakeDeliveryChannel>,
    pub gateway: Arc<CalendarGateway>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub fallback: Arc<FallbackScheduler>,
    pub sync: Arc<CalendarSyncManager>,
    pub transfer: Arc<TransferOrchestrator>,
    pub engine: ReminderEngine,
}

impl EngineHarness {
    pub fn new() -> Self {
        let clock = TestClock::default();
        let tasks = Arc::new(InMemoryTaskRepository::default());
        let notifications = Arc::new(InMemoryNotificationRepository::default());
        let recipients = Arc::new(InMemoryRecipientDirectory::default());
        let credentials = Arc::new(InMemoryCredentialStore::default());
        let oauth_client = Arc::new(FakeOAuthHttpClient::default());
        let provider = Arc::new(FakeCalendarProvider::default());
        let scheduler = Arc::new(InMemoryJobScheduler::default());
        let channel = Arc::new(FakeDeliveryChannel::default());
        let policy = ReminderPolicy::default();

        let manager = Arc::new(
            CredentialManager::new(
                OAuthConfig::new("client-id", "client-secret"),
                credentials.clone(),
                oauth_client.clone(),
            )
            .with_now_provider(clock.provider()),
        );
        let gateway = Arc::new(CalendarGateway::new(
            manager,
            provider.clone(),
            CalendarSettings::default(),
        ));
        let registry = ChannelRegistry::new()
            .with_channel(ChannelType::Telegram, channel.clone())
            .with_channel(ChannelType::System, Arc::new(SystemChannel));
        let dispatcher = Arc::new(
            NotificationDispatcher::new(
                notifications.clone(),
                recipients.clone(),
                registry,
                scheduler.clone(),
                DeliveryPolicy::default(),
            )
            .with_now_provider(clock.provider()),
        );
        let fallback = Arc::new(
            FallbackScheduler::new(notifications.clone(), dispatcher.clone())
                .with_now_provider(clock.provider()),
        );
        let sync = Arc::new(CalendarSyncManager::new(
            tasks.clone(),
            gateway.clone(),
            fallback.clone(),
            dispatcher.clone(),
            policy.clone(),
        ));
        let transfer = Arc::new(
            TransferOrchestrator::new(
                tasks.clone(),
                notifications.clone(),
                sync.clone(),
                fallback.clone(),
                dispatcher.clone(),
                scheduler.clone(),
            )
            .with_now_provider(clock.provider()),
        );
        let engine = ReminderEngine::new(
            gateway.clone(),
            sync.clone(),
            transfer.clone(),
            dispatcher.clone(),
            policy,
        );

        Self {
            clock,
            tasks,
            notifications,
            recipients,
            credentials,
            oauth_client,
            provider,
            scheduler,
            channel,
            gateway,
            dispatcher,
            fallback,
            sync,
            transfer,
            engine,
        }
    }

    /// Stores a valid calendar credential for the user.
    pub fn connect(&self, user_id: &str) {
        let token = OAuthToken {
            access_token: format!("access-{user_id}"),
            refresh_token: Some(format!("refresh-{user_id}")),
            expires_at: self.clock.now() + Duration::hours(1),
            token_type: "Bearer".to_string(),
            scope: None,
        };
        self.credentials.save_token(user_id, &token).expect("save token");
    }

    pub fn disconnect(&self, user_id: &str) {
        self.credentials.delete_token(user_id).expect("delete token");
    }

    pub fn register_telegram(&self, user_id: &str, chat_id: &str) {
        self.recipients
            .insert(user_id, ChannelType::Telegram, chat_id)
            .expect("register recipient");
    }

    pub fn notification(&self, id: &str) -> Notification {
        self.all_notifications()
            .into_iter()
            .find(|row| row.id == id)
            .expect("notification exists")
    }

    pub fn all_notifications(&self) -> Vec<Notification> {
        self.notifications.all().expect("list notifications")
    }

    pub fn pending_for(&self, user_id: &str) -> Vec<Notification> {
        self.all_notifications()
            .into_iter()
            .filter(|row| row.user_id == user_id && row.status == NotificationStatus::Pending)
            .collect()
    }
}
