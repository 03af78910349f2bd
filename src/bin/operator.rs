use std::future::IntoFuture as _;

use anyhow::{anyhow, bail};
use network_operator::{
    operator::{Operator, State},
    provider, telemetry, OperatorConfig,
};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init().await?;

    let config = OperatorConfig::from_env()?;
    let provider = provider::by_name(&config.provider).ok_or_else(|| {
        anyhow!(
            "unknown provider {:?}, available: {}",
            config.provider,
            provider::PROVIDERS.join(", ")
        )
    })?;

    // Initialize Kubernetes controller state
    let state = State::new(&config);
    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "serving diagnostics");
    let operator = Operator::new(state.clone(), config, provider);

    // Start web server
    let router = handlers::router();
    let server = axum::serve(listener, router.with_state(state));

    // Run both the http server and the controllers
    tokio::select! {
        c = operator.run() => {
            c?;
            info!("controllers stopped");
        },
        s = server.into_future() => {
            s?;
            bail!("server exited early");
        }
    };

    Ok(())
}

/// Handlers for the web server portion of the operator
mod handlers {
    use axum::{extract::State, http::StatusCode, response::IntoResponse, routing, Json, Router};
    use prometheus::{Encoder, TextEncoder};

    use network_operator::operator::State as OperatorState;

    /// Construct the router for all the handlers
    pub fn router() -> Router<OperatorState> {
        Router::new()
            .route("/metrics", routing::get(metrics))
            .route("/health", routing::get(health))
            .route("/", routing::get(index))
    }

    /// Handler for exposing prometheus metrics
    async fn metrics(State(state): State<OperatorState>) -> impl IntoResponse {
        let metrics = state.metrics();
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        match encoder.encode(&metrics, &mut buffer) {
            Ok(()) => (StatusCode::OK, buffer),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string().into_bytes()),
        }
    }

    /// Handler for checking the health of the server
    async fn health() -> impl IntoResponse {
        (StatusCode::OK, Json("healthy"))
    }

    /// Handler for interacting with the operator
    async fn index(State(state): State<OperatorState>) -> impl IntoResponse {
        let diagnostics = state.diagnostics().await;

        (StatusCode::OK, Json(diagnostics))
    }
}
