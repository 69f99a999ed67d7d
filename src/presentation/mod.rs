// Presentation layer - HTTP status and live plot endpoints
pub mod app_state;
pub mod handlers;
