pub mod connection;
pub mod handler;
pub mod types;

pub use connection::SessionManager;
pub use handler::ws_handler;
