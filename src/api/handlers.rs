use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::engine::{Hub, NewAgent, StartOptimization, StateSnapshot, TaskInfo};
use crate::types::{Agent, Planet, TelemetryReport, Variant};

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct PositionRequest {
    #[serde(default)]
    pub position: Value,
}

#[derive(Debug, Deserialize)]
pub struct MetricMappingRequest {
    #[serde(default, alias = "metricMapping")]
    pub metric_mapping: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct PlanetStatusRequest {
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    #[serde(default, alias = "variantId")]
    pub variant_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    #[serde(default, alias = "galaxy_id", alias = "galaxyId", alias = "agentId")]
    pub agent_id: String,
    #[serde(default, alias = "planetId")]
    pub planet_id: String,
    #[serde(default)]
    pub optimizer: Option<String>,
    #[serde(default, alias = "scoreThreshold")]
    pub score_threshold: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    #[serde(default, alias = "galaxy_id", alias = "galaxyId", alias = "agentId")]
    pub agent_id: String,
    #[serde(default, alias = "planetId")]
    pub planet_id: String,
}

#[derive(Debug, Serialize)]
pub struct AgentResponse {
    pub status: &'static str,
    pub agent: Agent,
}

#[derive(Debug, Serialize)]
pub struct PlanetResponse {
    pub status: &'static str,
    pub planet: Planet,
}

#[derive(Debug, Serialize)]
pub struct VariantResponse {
    pub status: &'static str,
    pub variant: Variant,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub status: &'static str,
    pub agent_id: String,
    pub planet_id: String,
    pub task_id: String,
}

#[derive(Debug, Serialize)]
pub struct OptimizerStatus {
    pub active: Vec<TaskInfo>,
}

fn ok() -> Json<Value> {
    Json(json!({ "status": "success" }))
}

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn get_state(State(hub): State<Arc<Hub>>) -> Json<StateSnapshot> {
    Json(hub.snapshot().await)
}

pub async fn get_agent(
    State(hub): State<Arc<Hub>>,
    Path(agent_id): Path<String>,
) -> ApiResult<Agent> {
    Ok(Json(hub.get_agent(&agent_id).await?))
}

pub async fn onboard_agent(
    State(hub): State<Arc<Hub>>,
    Json(request): Json<NewAgent>,
) -> ApiResult<AgentResponse> {
    let agent = hub.onboard(request).await?;
    Ok(Json(AgentResponse {
        status: "success",
        agent,
    }))
}

pub async fn delete_agent(
    State(hub): State<Arc<Hub>>,
    Path(agent_id): Path<String>,
) -> ApiResult<Value> {
    hub.delete_agent(&agent_id).await?;
    Ok(ok())
}

pub async fn update_position(
    State(hub): State<Arc<Hub>>,
    Path(agent_id): Path<String>,
    Json(request): Json<PositionRequest>,
) -> ApiResult<Value> {
    hub.update_position(&agent_id, request.position).await?;
    Ok(ok())
}

pub async fn update_metric_mapping(
    State(hub): State<Arc<Hub>>,
    Path(agent_id): Path<String>,
    Json(request): Json<MetricMappingRequest>,
) -> ApiResult<AgentResponse> {
    let agent = hub
        .update_metric_mapping(&agent_id, request.metric_mapping)
        .await?;
    Ok(Json(AgentResponse {
        status: "success",
        agent,
    }))
}

pub async fn set_planet_status(
    State(hub): State<Arc<Hub>>,
    Path((agent_id, planet_id)): Path<(String, String)>,
    Json(request): Json<PlanetStatusRequest>,
) -> ApiResult<PlanetResponse> {
    let planet = hub
        .set_planet_status(&agent_id, &planet_id, &request.status)
        .await?;
    Ok(Json(PlanetResponse {
        status: "success",
        planet,
    }))
}

pub async fn generate_variant(
    State(hub): State<Arc<Hub>>,
    Path((agent_id, planet_id)): Path<(String, String)>,
) -> ApiResult<VariantResponse> {
    let variant = hub.generate_variant(&agent_id, &planet_id).await?;
    Ok(Json(VariantResponse {
        status: "success",
        variant,
    }))
}

pub async fn deploy_variant(
    State(hub): State<Arc<Hub>>,
    Path((agent_id, planet_id)): Path<(String, String)>,
    Json(request): Json<DeployRequest>,
) -> ApiResult<PlanetResponse> {
    let planet = hub
        .deploy_variant(&agent_id, &planet_id, &request.variant_id)
        .await?;
    Ok(Json(PlanetResponse {
        status: "success",
        planet,
    }))
}

pub async fn ingest_telemetry(
    State(hub): State<Arc<Hub>>,
    Json(report): Json<TelemetryReport>,
) -> ApiResult<AgentResponse> {
    let agent = hub.ingest_telemetry(report).await?;
    Ok(Json(AgentResponse {
        status: "success",
        agent,
    }))
}

pub async fn start_optimization(
    State(hub): State<Arc<Hub>>,
    Json(request): Json<StartRequest>,
) -> ApiResult<StartResponse> {
    let handle = hub
        .start_optimization(StartOptimization {
            agent_id: request.agent_id,
            planet_id: request.planet_id,
            optimizer: request.optimizer,
            score_threshold: request.score_threshold,
        })
        .await?;
    Ok(Json(StartResponse {
        status: "started",
        agent_id: handle.key.agent_id.clone(),
        planet_id: handle.key.planet_id.clone(),
        task_id: handle.task_id.to_string(),
    }))
}

pub async fn stop_optimization(
    State(hub): State<Arc<Hub>>,
    Json(request): Json<StopRequest>,
) -> ApiResult<Value> {
    hub.stop_optimization(&request.agent_id, &request.planet_id)
        .await?;
    Ok(Json(json!({ "status": "stopping" })))
}

pub async fn optimizer_status(State(hub): State<Arc<Hub>>) -> Json<OptimizerStatus> {
    Json(OptimizerStatus {
        active: hub.tasks().describe().await,
    })
}
