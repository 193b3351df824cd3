use gotcha::axum::extract::{Path, Query, State};
use gotcha::{Json, Schematic};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::event_bus::{EventBus, KindName};
use crate::models::{AgentReport, AgentResponse, AgentState, GpsData};
use crate::Db;

#[derive(Debug, Deserialize, Schematic)]
pub struct ListAgentsQuery {
    /// `ASSIGNED` or `UNASSIGNED`; empty lists every agent
    pub state: Option<String>,
}

pub(crate) fn parse_agent_state(raw: Option<&str>) -> Result<Option<AgentState>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => raw
            .parse::<AgentState>()
            .map(Some)
            .map_err(|_| ApiError::bad_request(format!("Unknown agent state: {}", raw))),
        None => Ok(None),
    }
}

/// GET /agent/ - List agents, optionally by assignment state
#[gotcha::api]
pub async fn list_agents(
    State(db): State<Db>,
    Query(query): Query<ListAgentsQuery>,
) -> Result<Json<Vec<AgentResponse>>, ApiError> {
    let state = parse_agent_state(query.state.as_deref())?;

    let agents = db.list_agents(state).await?;
    let responses: Vec<AgentResponse> = agents.into_iter().map(Into::into).collect();
    Ok(Json(responses))
}

/// POST /agent/:uuid/sync - Store an agent's position and announce it
#[gotcha::api]
pub async fn sync_agent(
    State(db): State<Db>,
    State(bus): State<EventBus>,
    Path(agent_uuid): Path<String>,
    Json(payload): Json<GpsData>,
) -> Result<Json<AgentResponse>, ApiError> {
    let uuid = Uuid::parse_str(&agent_uuid)
        .map_err(|_| ApiError::bad_request(format!("Invalid agent uuid: {}", agent_uuid)))?;

    let agent = db.sync_agent(uuid, &payload).await?;
    debug!(agent_uuid = %agent.uuid, lat = %agent.lat, lon = %agent.lon, "agent synced");

    bus.kind::<AgentReport>(KindName::NEW_AGENT)
        .emit(AgentReport::from(&agent));

    Ok(Json(agent.into()))
}
