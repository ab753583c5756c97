//! mesa gateway binary
//!
//! Wires configuration, the store, and the validator into the HTTP query
//! surface. Chain event intake runs out-of-process and feeds the library's
//! `EventProcessor`.

use std::sync::Arc;

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use mesa::config::Config;
use mesa::parsing::QueryValidator;
use mesa::service::{Service, ServiceError};
use mesa::store;
use mesa::tables::ChainId;

#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "mesa validator node gateway")]
struct Cli {
    #[arg(long, default_value = "mesa.toml", env = "MESA_CONFIG")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        tracing::info!(path = %cli.config.display(), "no config file, using defaults");
        Config::default()
    };

    let pool = store::connect(&config.db.path).await?;
    store::migrate(&pool).await?;
    tracing::info!(db = %config.db.path.display(), "store ready");

    let validator = match &config.validator.accepted_column_types {
        Some(types) => {
            QueryValidator::with_accepted_types(&config.validator.system_table_prefix, types)
        }
        None => QueryValidator::new(&config.validator.system_table_prefix),
    };

    let service = Arc::new(Service::new(pool, validator));
    let app = Router::new()
        .route("/query", post(run_read_query))
        .route("/schema/hash", post(validate_create_table))
        .route("/receipt/:chain_id/:txn_hash", get(receipt))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(service);

    let listener = tokio::net::TcpListener::bind(&config.http.bind).await?;
    tracing::info!(addr = %config.http.bind, "mesa gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Deserialize)]
struct StatementRequest {
    statement: String,
}

async fn run_read_query(
    State(service): State<Arc<Service>>,
    Json(req): Json<StatementRequest>,
) -> Response {
    match service.run_read_query(&req.statement).await {
        Ok(rows) => Json(json!({ "data": rows })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn validate_create_table(
    State(service): State<Arc<Service>>,
    Json(req): Json<StatementRequest>,
) -> Response {
    match service.validate_create_table(&req.statement).await {
        Ok(hash) => Json(json!({ "structure_hash": hash })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn receipt(
    State(service): State<Arc<Service>>,
    UrlPath((chain_id, txn_hash)): UrlPath<(ChainId, String)>,
) -> Response {
    match service.receipt(chain_id, &txn_hash).await {
        Ok(Some(receipt)) => Json(receipt).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "no receipt found").into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: ServiceError) -> Response {
    let status = if err.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        tracing::error!(error = %err, "request failed");
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
