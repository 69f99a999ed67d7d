// Main entry point - Dependency injection, optional status server and the sweep
mod domain;
mod application;
mod infrastructure;
mod presentation;

use std::{net::SocketAddr, sync::Arc, time::Duration};
use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::application::analog_input::AnalogInput;
use crate::application::config_rpc::ConfigRpc;
use crate::application::sweep_service::SweepController;
use crate::application::telemetry_feed::TelemetryFeed;
use crate::infrastructure::config::{load_app_config, write_manifest, DeviceKind};
use crate::infrastructure::file_sinks::{CsvLogSink, DataFileSink};
use crate::infrastructure::mqtt::{MiniconfClient, MqttTelemetryFeed};
use crate::infrastructure::plot_feed::{PlotFeed, PlotFeedSink};
use crate::infrastructure::scpi_input::ScpiAnalogInput;
use crate::infrastructure::simulator::SimulatedThermostat;
use crate::presentation::app_state::AppState;
use crate::presentation::handlers::{health_check, list_records, stream_records};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = load_app_config()?;
    let sweep = config.sweep_spec()?;
    let settle = config.settle_config()?;
    if sweep.is_empty() {
        tracing::warn!(
            "Sweep from {} to {} °C has no setpoints, nothing to do",
            config.sweep.start,
            config.sweep.stop
        );
        return Ok(());
    }
    if let Some(limit) = settle.max_wait {
        tracing::warn!("Each setpoint will also give up after {:?} without settling", limit);
    }

    if let Some(path) = &config.output.manifest {
        write_manifest(path, &config)?;
    }

    // Thermostat adapters: a simulated plant or the MQTT broker
    let plant = if config.thermostat.simulated {
        Some(SimulatedThermostat::new(config.thermal_model()?))
    } else {
        None
    };
    let (rpc, feed): (Arc<dyn ConfigRpc>, Arc<dyn TelemetryFeed>) = match &plant {
        Some(plant) => {
            tracing::info!("Using the simulated thermostat");
            (Arc::new(plant.clone()), Arc::new(plant.clone()))
        }
        None => {
            let client = MiniconfClient::connect(&config.broker, &config.thermostat.prefix).await?;
            (Arc::new(client), Arc::new(MqttTelemetryFeed::new(config.broker.clone())))
        }
    };

    let input: Box<dyn AnalogInput> = match (config.device.kind, &plant) {
        (DeviceKind::Scpi, _) => Box::new(
            ScpiAnalogInput::connect(
                &config.device.address,
                Duration::from_millis(config.device.timeout_ms),
            )
            .await?,
        ),
        (DeviceKind::Simulated, Some(plant)) => Box::new(plant.probe()),
        (DeviceKind::Simulated, None) => {
            anyhow::bail!("device.kind = \"simulated\" needs thermostat.simulated = true")
        }
    };

    // Sinks
    let plot_feed = PlotFeed::new();
    let mut controller = SweepController::new(
        config.thermostat_settings(),
        rpc,
        feed,
        input,
        config.device.channel,
    )
    .with_sink(Box::new(DataFileSink::create(&config.output.data_file)?))
    .with_sink(Box::new(PlotFeedSink::new(plot_feed.clone())));
    if let Some(path) = &config.output.csv_log {
        controller = controller.with_sink(Box::new(CsvLogSink::create(path)?));
    }

    let server = if config.server.enabled {
        let state = Arc::new(AppState {
            plot_feed,
            total_setpoints: sweep.len(),
        });
        // Compression is done per response, so no CompressionLayer here
        let router = Router::new()
            .route("/healthz", get(health_check))
            .route("/records", get(list_records))
            .route("/records/stream", get(stream_records))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let addr: SocketAddr = config.server.bind.parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Serving sweep progress on {}", addr);
        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!("Status server stopped: {}", e);
            }
        }))
    } else {
        None
    };

    tracing::info!(
        "Sweeping {} setpoints from {} °C in steps of {} °C",
        sweep.len(),
        sweep.start(),
        config.sweep.step
    );
    controller.prepare(sweep.start()).await?;

    let summary = tokio::select! {
        result = controller.run(&sweep, &settle) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, completed points are already on disk");
            return Ok(());
        }
    };

    for skipped in &summary.skipped {
        tracing::warn!(
            "Setpoint {} ({} °C) skipped: {}",
            skipped.index,
            skipped.setpoint,
            skipped.reason
        );
    }

    // Viewers keep the final plot until the operator exits.
    if let Some(server) = server {
        tracing::info!("Sweep done, status server still up. Press Ctrl-C to exit");
        tokio::signal::ctrl_c().await?;
        server.abort();
    }

    Ok(())
}
