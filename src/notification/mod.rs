// Declare submodules
pub mod memory_backend;
pub mod notification_backend;
pub mod notification_dto;
pub mod notification_handlers;
pub mod notification_models;
pub mod notification_repository;
pub mod notification_sync;
pub mod routes;

// Re-export public items
pub use memory_backend::InMemoryBackend;
pub use notification_backend::{ChangeFeed, NotificationBackend};
pub use notification_models::{ChangeEvent, ChangeKind, NewNotification, Notification, NotificationState};
pub use notification_repository::PgNotificationRepository;
pub use notification_sync::NotificationSync;
