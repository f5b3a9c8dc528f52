use axum::{
    Router,
    extract::Json,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use serde::Deserialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::core::tax::{self, SpouseIncome};
use crate::core::types::{EngineError, Province, Scenario};
use crate::core::{run_batch, run_single_simulation};

fn error_response(err: &EngineError) -> Response {
    let status = match err {
        EngineError::InvalidScenario { .. } => StatusCode::BAD_REQUEST,
        EngineError::RunFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

/// Single deterministic projection of the posted scenario.
async fn simulate_handler(Json(scenario): Json<Scenario>) -> Response {
    match run_single_simulation(&scenario, None) {
        Ok(result) => Json(result).into_response(),
        Err(err) => error_response(&err),
    }
}

/// Full Monte Carlo batch of the posted scenario.
async fn montecarlo_handler(Json(scenario): Json<Scenario>) -> Response {
    let outcome = run_batch(&scenario, |p| {
        log::info!("montecarlo progress {}/{}", p.completed_runs, p.total_runs);
    });
    match outcome {
        Ok(result) => Json(result).into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JointTaxRequest {
    year: i32,
    #[serde(default)]
    inflation_rate: f64,
    province: Province,
    primary: SpouseIncome,
    #[serde(default)]
    spouse: Option<SpouseIncome>,
}

/// Pension-income-split search for a couple's combined tax.
async fn joint_tax_handler(Json(request): Json<JointTaxRequest>) -> Response {
    let params = tax::tax_parameters(request.year, request.inflation_rate, request.province);
    let result = tax::optimize_joint_tax(&request.primary, request.spouse.as_ref(), &params);
    Json(result).into_response()
}

async fn not_found_handler() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route("/api/simulate", post(simulate_handler))
        .route("/api/montecarlo", post(montecarlo_handler))
        .route("/api/joint-tax", post(joint_tax_handler))
        .fallback(not_found_handler);

    let listener = TcpListener::bind(addr).await?;
    println!("drawdown HTTP API listening on http://{addr}");
    println!("Local access: http://127.0.0.1:{port}/");

    axum::serve(listener, app).await
}
