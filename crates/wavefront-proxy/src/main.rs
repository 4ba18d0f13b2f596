// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod config;
mod identity;

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use points::{
    agent::AgentReporter,
    constants::{BUILD_VERSION, DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_RETRY_MAX_DELAY_MS},
    decoder::DecoderKind,
    listener::{ListenerConfig, PointListener},
    telemetry::{encode_version, TelemetryRegistry},
    wavefront::{PointSender, RetryStrategy, WavefrontApi, WavefrontApiConfig},
};

use crate::config::ProxyConfig;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const LISTEN_HOST: &str = "0.0.0.0";

#[tokio::main]
pub async fn main() -> ExitCode {
    let config = ProxyConfig::load();

    let log_level = match &config {
        Ok(config) => config.log_level.clone(),
        Err(_) => env::var("WF_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or("info".to_string()),
    };
    init_logging(&log_level);

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration, shutting down: {e}");
            return ExitCode::FAILURE;
        }
    };

    let agent_id = match identity::create_or_get(&config.id_file) {
        Ok(id) => id,
        Err(e) => {
            error!(
                "Unable to read or create agent id file {}: {e}",
                config.id_file.display()
            );
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Starting wavefront-proxy {} as agent {} on {}",
        VERSION, agent_id, config.hostname
    );

    let telemetry = Arc::new(TelemetryRegistry::new());
    telemetry
        .gauge(BUILD_VERSION)
        .set(encode_version(VERSION) as f64);

    let sender: Arc<dyn PointSender> = match WavefrontApi::new(
        WavefrontApiConfig {
            server: config.server.clone(),
            token: config.token.clone(),
            agent_id: agent_id.clone(),
            hostname: config.hostname.clone(),
            version: VERSION.to_string(),
            timeout: config.request_timeout,
            retry_strategy: RetryStrategy::ExponentialBackoff {
                attempts: config.retry_attempts,
                base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
                max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            },
            compression_level: None,
        },
        &telemetry,
    ) {
        Ok(api) => Arc::new(api),
        Err(e) => {
            error!("Failed to build HTTP client: {e}");
            return ExitCode::FAILURE;
        }
    };

    let reporter = AgentReporter::new(
        agent_id,
        config.hostname.clone(),
        Arc::clone(&sender),
        Arc::clone(&telemetry),
        config.agent_report_interval,
    );
    reporter.register().await;
    let reporter_cancel = CancellationToken::new();
    let reporter_handle = tokio::spawn(reporter.run(reporter_cancel.clone()));

    let mut listeners = Vec::new();
    let ports = config
        .push_listener_ports
        .iter()
        .map(|port| (*port, DecoderKind::Graphite))
        .chain(
            config
                .opentsdb_ports
                .iter()
                .map(|port| (*port, DecoderKind::OpenTsdb)),
        );
    for (port, decoder) in ports {
        let mut listener = PointListener::new(
            listener_config(&config, port, decoder),
            Arc::clone(&telemetry),
        );
        if let Err(e) = listener.start(Arc::clone(&sender)).await {
            error!("Unable to start {decoder} listener on port {port}: {e}");
            shutdown(listeners, reporter_cancel, reporter_handle).await;
            return ExitCode::FAILURE;
        }
        listeners.push(listener);
    }

    if listeners.is_empty() {
        error!("No listener ports configured, shutting down");
        shutdown(listeners, reporter_cancel, reporter_handle).await;
        return ExitCode::FAILURE;
    }

    wait_for_shutdown_signal().await;
    shutdown(listeners, reporter_cancel, reporter_handle).await;
    ExitCode::SUCCESS
}

fn init_logging(log_level: &str) {
    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");
    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| {
        EnvFilter::new("h2=off,hyper=off,rustls=off,info")
    });

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Setting default subscriber failed: {e}");
        return;
    }
    debug!("Logging subsystem enabled");
}

fn listener_config(config: &ProxyConfig, port: u16, decoder: DecoderKind) -> ListenerConfig {
    ListenerConfig {
        host: LISTEN_HOST.to_string(),
        flush_threads: config.flush_threads,
        flush_interval: config.push_flush_interval,
        max_buffer_size: config.push_memory_buffer_limit,
        max_points_per_flush: config.push_flush_max_points,
        max_connections: config.max_connections,
        shutdown_grace_period: config.shutdown_grace_period,
        ..ListenerConfig::new(port, decoder)
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => log_ctrl_c(result),
                    _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
                }
                return;
            }
            Err(e) => warn!("Failed to listen for SIGTERM: {}", e),
        }
    }
    log_ctrl_c(tokio::signal::ctrl_c().await);
}

fn log_ctrl_c(result: std::io::Result<()>) {
    match result {
        Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
        Err(e) => error!("Failed to listen for Ctrl+C, shutting down: {}", e),
    }
}

async fn shutdown(
    listeners: Vec<PointListener>,
    reporter_cancel: CancellationToken,
    reporter_handle: JoinHandle<()>,
) {
    info!("Stopping {} listeners", listeners.len());
    for mut listener in listeners {
        listener.stop().await;
    }
    reporter_cancel.cancel();
    if let Err(e) = reporter_handle.await {
        error!("Agent reporter task failed: {e}");
    }
    info!("Shutdown complete");
}
