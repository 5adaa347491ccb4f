pub mod config;
pub mod credential_store;
pub mod error;
pub mod event_mapper;
pub mod google_calendar_client;
pub mod logging;
pub mod notification_repository;
pub mod oauth_client;
pub mod recipient_directory;
pub mod storage;
pub mod task_repository;
