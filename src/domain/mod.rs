// Domain layer - Sweep, settle and telemetry models
pub mod settle;
pub mod sweep;
pub mod telemetry;
pub mod thermostat;
