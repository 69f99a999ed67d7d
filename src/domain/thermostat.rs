// Thermostat controller settings and the setting paths they map to
use serde_json::{Value, json};

pub const TARGET_PATH: &str = "pidsettings/0/target";
pub const ENGAGE_PATH: &str = "engage_iir/0";

/// Topic the controller publishes its status reports on.
pub fn telemetry_topic(prefix: &str) -> String {
    format!("{}/telemetry", prefix)
}

/// Controller tuning applied once before the sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct ThermostatSettings {
    pub prefix: String,
    pub p_gain: f64,
    pub i_gain: f64,
    pub max_i_pos: f64,
    pub max_i_neg: f64,
}

impl ThermostatSettings {
    /// Setting writes that configure and engage the controller, in the order
    /// they must be applied. Limits go out before the gains, and the loop is
    /// engaged last.
    pub fn setup_commands(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("pidsettings/0/max_i_pos", json!(self.max_i_pos)),
            ("pidsettings/0/max_i_neg", json!(self.max_i_neg)),
            ("pidsettings/0/pid/0", json!(self.p_gain)),
            ("pidsettings/0/pid/1", json!(self.i_gain)),
            (ENGAGE_PATH, json!(true)),
        ]
    }
}
