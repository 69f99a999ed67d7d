// Infrastructure layer - External dependencies and adapters
pub mod chunked_stream;
pub mod config;
pub mod file_sinks;
pub mod http_response;
pub mod mqtt;
pub mod plot_feed;
pub mod scpi_input;
pub mod simulator;
