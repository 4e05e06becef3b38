/*
 * 5D Labs Agent Platform - Event Remediation Controller
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Remediation Controller Service
//!
//! - Watches `RemediationPolicy` resources and cluster events
//! - Sends matching events to the remediation backend, rate limited per workload
//! - Persists cooldown state so restarts do not re-trigger remediations
//! - Serves health, readiness and metrics endpoints

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use clap::Parser;
use remediation_controller::tasks::{build_context, run_controllers, Context, ControllerConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "remediation-controller")]
#[command(about = "Event-driven remediation controller")]
#[command(version)]
struct Cli {
    /// Path to the controller config file (defaults to `CONTROLLER_CONFIG_PATH` or /config/config.yaml)
    #[arg(long)]
    config: Option<String>,

    /// Only watch events and policies in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Address for the health and metrics server
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!(
        "Starting 5D Labs Remediation Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = load_controller_config(&cli.config.unwrap_or_else(ControllerConfig::default_path));
    let grace = config.persistence.settings().shutdown_timeout;

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let context = build_context(client, config, cli.namespace)?;

    // Start the controllers in the background
    let controller_handle = tokio::spawn({
        let context = Arc::clone(&context);
        async move {
            if let Err(e) = run_controllers(context).await {
                tracing::error!("Controller error: {}", e);
            }
        }
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(Arc::clone(&context));

    let listener = tokio::net::TcpListener::bind(&cli.listen).await?;
    info!("Controller HTTP server listening on {}", cli.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Final cooldown snapshots before the process exits
    context.registry.shutdown(grace).await;
    controller_handle.abort();
    info!("Controller service stopped");

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,remediation_controller=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn load_controller_config(config_path: &str) -> ControllerConfig {
    match ControllerConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            info!("Loaded controller configuration from {}", config_path);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load configuration from {}: {}. Using defaults.",
                config_path, err
            );
            ControllerConfig::default()
        }
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "remediation-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(context): State<Arc<Context>>) -> (StatusCode, Json<Value>) {
    let ready = context.metrics.is_watch_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if ready { "ready" } else { "starting" },
            "service": "remediation-controller",
            "policies": context.registry.len(),
        })),
    )
}

async fn metrics(State(context): State<Arc<Context>>) -> Json<Value> {
    Json(json!({
        "service": "remediation-controller",
        "version": env!("CARGO_PKG_VERSION"),
        "counters": context.metrics.snapshot(),
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
