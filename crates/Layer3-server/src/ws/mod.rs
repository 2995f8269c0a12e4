//! WebSocket channel surface

mod handler;

pub use handler::ws_handler;
