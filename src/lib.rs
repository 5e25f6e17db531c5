//! Notification sync for the hackathon platform.
//!
//! [`notification::NotificationSync`] mirrors one user's notifications from a
//! [`notification::NotificationBackend`] and keeps them current through the
//! backend's change feed. The `routes` module exposes sync sessions over
//! WebSocket alongside a small REST surface.

pub mod db;
pub mod error;
pub mod notification;
pub mod routes;
pub mod state;
pub mod websocket;
