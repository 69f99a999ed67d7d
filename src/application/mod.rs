// Application layer - Settle detection and sweep orchestration
pub mod analog_input;
pub mod config_rpc;
pub mod settle_detector;
pub mod sweep_service;
pub mod sweep_sink;
pub mod telemetry_channel;
pub mod telemetry_feed;
pub mod telemetry_receiver;
