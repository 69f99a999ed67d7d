use crate::domain::settle::{SettleConfig, SettleConfigError};
use crate::domain::sweep::{SweepSpec, SweepSpecError};
use crate::domain::thermostat::ThermostatSettings;
use crate::infrastructure::simulator::ThermalModel;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/sweep";
/// One week; longer per-setpoint deadlines are treated as a typo.
const MAX_WAIT_LIMIT: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerSettings,
    #[serde(default)]
    pub thermostat: ThermostatConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub settle: SettleSettings,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub rpc_timeout_secs: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "10.42.0.1".to_string(),
            port: 1883,
            client_id: "thermostat-sweep".to_string(),
            rpc_timeout_secs: 5,
        }
    }
}

impl BrokerSettings {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ThermostatConfig {
    pub prefix: String,
    pub p_gain: f64,
    pub i_gain: f64,
    pub max_i_pos: f64,
    pub max_i_neg: f64,
    /// Run against the built-in thermal model instead of a broker.
    pub simulated: bool,
}

// Tuning for a LUCENT D2525P37 laser diode mount.
impl Default for ThermostatConfig {
    fn default() -> Self {
        Self {
            prefix: "dt/sinara/thermostat-mqtt/80-1f-12-63-84-1a".to_string(),
            p_gain: 10.0,
            i_gain: 2.0,
            max_i_pos: 0.3,
            max_i_neg: 0.1,
            simulated: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SweepConfig {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            start: 20.0,
            stop: 40.0,
            step: 0.5,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SettleSettings {
    pub tolerance: f64,
    pub required_in_band: usize,
    pub max_samples: usize,
    pub window: usize,
    /// Optional wall-clock limit per setpoint, in seconds.
    pub max_wait_secs: Option<f64>,
}

impl Default for SettleSettings {
    fn default() -> Self {
        Self {
            tolerance: 0.001,
            required_in_band: 15,
            max_samples: 1000,
            window: 20,
            max_wait_secs: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Scpi,
    Simulated,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    pub address: String,
    pub channel: usize,
    pub timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            kind: DeviceKind::Scpi,
            address: "192.168.1.50:5025".to_string(),
            channel: 0,
            timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub data_file: PathBuf,
    pub csv_log: Option<PathBuf>,
    pub manifest: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            data_file: PathBuf::from("data.csv"),
            csv_log: Some(PathBuf::from("sweep_log.csv")),
            manifest: Some(PathBuf::from("run.toml")),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Plant used when `thermostat.simulated` is set.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    pub ambient: f64,
    pub time_constant_secs: f64,
    pub period_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            ambient: 22.0,
            time_constant_secs: 2.0,
            period_ms: 50,
        }
    }
}

impl AppConfig {
    pub fn sweep_spec(&self) -> Result<SweepSpec, SweepSpecError> {
        SweepSpec::new(self.sweep.start, self.sweep.stop, self.sweep.step)
    }

    pub fn settle_config(&self) -> anyhow::Result<SettleConfig> {
        let settle = &self.settle;
        let max_wait = match settle.max_wait_secs {
            Some(secs) => {
                let wait = Duration::try_from_secs_f64(secs)
                    .with_context(|| format!("invalid settle.max_wait_secs {}", secs))?;
                if wait > MAX_WAIT_LIMIT {
                    anyhow::bail!(
                        "settle.max_wait_secs {} exceeds the limit of {} seconds",
                        secs,
                        MAX_WAIT_LIMIT.as_secs()
                    );
                }
                Some(wait)
            }
            None => None,
        };
        let config = SettleConfig::new(
            settle.tolerance,
            settle.required_in_band,
            settle.max_samples,
            settle.window,
        )
        .map_err(|e: SettleConfigError| anyhow::anyhow!("invalid [settle] section: {}", e))?;
        Ok(config.with_max_wait(max_wait))
    }

    pub fn thermal_model(&self) -> anyhow::Result<ThermalModel> {
        let sim = &self.simulation;
        let time_constant = Duration::try_from_secs_f64(sim.time_constant_secs)
            .with_context(|| format!("invalid simulation.time_constant_secs {}", sim.time_constant_secs))?;
        Ok(ThermalModel {
            ambient: sim.ambient,
            time_constant,
            period: Duration::from_millis(sim.period_ms.max(1)),
            ..ThermalModel::default()
        })
    }

    pub fn thermostat_settings(&self) -> ThermostatSettings {
        ThermostatSettings {
            prefix: self.thermostat.prefix.clone(),
            p_gain: self.thermostat.p_gain,
            i_gain: self.thermostat.i_gain,
            max_i_pos: self.thermostat.max_i_pos,
            max_i_neg: self.thermostat.max_i_neg,
        }
    }
}

/// Load `config/sweep.{toml,...}` (or the file named by `SWEEP_CONFIG`),
/// overlaid by `SWEEP__SECTION__KEY` environment variables.
pub fn load_app_config() -> anyhow::Result<AppConfig> {
    let path = std::env::var("SWEEP_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let settings = config::Config::builder()
        .add_source(config::File::with_name(&path).required(false))
        .add_source(
            config::Environment::with_prefix("SWEEP")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}

/// Snapshot of the settings a run used, stored next to its data.
pub fn write_manifest(path: &Path, config: &AppConfig) -> anyhow::Result<()> {
    let body = toml::to_string_pretty(config).context("Failed to serialize run manifest")?;
    let contents = format!(
        "# thermostat-sweep run started {}\n{}",
        chrono::Utc::now().to_rfc3339(),
        body
    );
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write run manifest {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> AppConfig {
        config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_empty_file_gives_rig_defaults() {
        let config = parse("");
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.sweep_spec().unwrap().len(), 40);
        assert_eq!(config.thermostat_settings().p_gain, 10.0);
        assert_eq!(config.broker.rpc_timeout(), Duration::from_secs(5));
        assert_eq!(config.thermal_model().unwrap(), ThermalModel::default());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = parse(
            r#"
            [thermostat]
            prefix = "dt/lab/thermostat-mqtt/00-11-22-33-44-55"
            simulated = true

            [settle]
            tolerance = 0.05
            max_wait_secs = 120.0

            [device]
            kind = "simulated"
            "#,
        );

        assert_eq!(config.thermostat.prefix, "dt/lab/thermostat-mqtt/00-11-22-33-44-55");
        assert!(config.thermostat.simulated);
        assert_eq!(config.thermostat.i_gain, 2.0);
        assert_eq!(config.device.kind, DeviceKind::Simulated);
        assert_eq!(config.device.channel, 0);

        let settle = config.settle_config().unwrap();
        assert_eq!(settle.tolerance, 0.05);
        assert_eq!(settle.window, 20);
        assert_eq!(settle.max_wait, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_invalid_values_are_rejected_at_conversion() {
        let config = parse(
            r#"
            [sweep]
            step = 0.0

            [settle]
            required_in_band = 25
            "#,
        );
        assert!(config.sweep_spec().is_err());
        let err = config.settle_config().unwrap_err();
        assert!(err.to_string().contains("[settle]"));
    }

    #[test]
    fn test_absurd_max_wait_is_rejected() {
        let mut config = AppConfig::default();
        config.settle.max_wait_secs = Some(1e19);
        let err = config.settle_config().unwrap_err();
        assert!(err.to_string().contains("max_wait_secs"));

        config.settle.max_wait_secs = Some(-1.0);
        assert!(config.settle_config().is_err());

        config.settle.max_wait_secs = Some(3600.0);
        assert_eq!(
            config.settle_config().unwrap().max_wait,
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn test_manifest_records_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs").join("2026-10-19").join("run.toml");
        let config = AppConfig::default();

        write_manifest(&path, &config).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("# thermostat-sweep run started"));
        assert!(written.contains("[settle]"));
        assert!(written.contains("tolerance = 0.001"));
        assert!(written.contains("kind = \"scpi\""));
    }
}
