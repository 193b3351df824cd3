use gotcha::axum::extract::{Path, Query, State};
use gotcha::axum::Extension;
use gotcha::{Json, Schematic};
use serde::Deserialize;

use crate::api::agents::parse_agent_state;
use crate::api::error::ApiError;
use crate::auth::AuthContext;
use crate::feed::VehicleFilter;
use crate::models::{
    GroupCreateRequest, GroupResponse, VehicleCreateRequest, VehicleGroupsRequest,
    VehicleResponse, VehicleSetAgentRequest, VehicleType,
};
use crate::Db;

/// Query string shared by `GET /vehicle/filter` and the live feed socket
#[derive(Debug, Default, Deserialize, Schematic)]
pub struct VehicleFilterQuery {
    pub vehicle_type: Option<String>,
    pub vehicle_group_id: Option<String>,
    /// Only honoured by the REST endpoint
    pub agent_state: Option<String>,
}

impl VehicleFilterQuery {
    pub fn to_filter(&self) -> Result<VehicleFilter, ApiError> {
        VehicleFilter::from_query(self.vehicle_type.as_deref(), self.vehicle_group_id.as_deref())
            .map_err(|raw| ApiError::bad_request(format!("Invalid vehicle_group_id: {}", raw)))
    }
}

/// GET /vehicle/ - List all vehicles
#[gotcha::api]
pub async fn list_vehicles(State(db): State<Db>) -> Result<Json<Vec<VehicleResponse>>, ApiError> {
    let vehicles = db.list_vehicles().await?;
    let responses: Vec<VehicleResponse> = vehicles.into_iter().map(Into::into).collect();
    Ok(Json(responses))
}

/// GET /vehicle/filter - Vehicles by type, group and agent state
#[gotcha::api]
pub async fn filter_vehicles(
    State(db): State<Db>,
    Query(query): Query<VehicleFilterQuery>,
) -> Result<Json<Vec<VehicleResponse>>, ApiError> {
    let filter = query.to_filter()?;
    let agent_state = parse_agent_state(query.agent_state.as_deref())?;

    let vehicles = db.filter_vehicles(&filter, agent_state).await?;
    let responses: Vec<VehicleResponse> = vehicles.into_iter().map(Into::into).collect();
    Ok(Json(responses))
}

/// GET /vehicle/type/ - Supported vehicle types
#[gotcha::api]
pub async fn list_vehicle_types() -> Json<Vec<String>> {
    Json(VehicleType::ALL.iter().map(|t| t.as_str().to_string()).collect())
}

/// GET /vehicle/:plate_id - Get vehicle by plate
#[gotcha::api]
pub async fn get_vehicle(
    State(db): State<Db>,
    Path(plate_id): Path<String>,
) -> Result<Json<VehicleResponse>, ApiError> {
    let vehicle = db
        .get_vehicle_by_plate(&plate_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Vehicle {} not found", plate_id)))?;

    Ok(Json(vehicle.into()))
}

/// POST /vehicle/ - Register a vehicle
#[gotcha::api]
pub async fn create_vehicle(
    Extension(auth): Extension<AuthContext>,
    State(db): State<Db>,
    Json(payload): Json<VehicleCreateRequest>,
) -> Result<Json<VehicleResponse>, ApiError> {
    auth.require_auth().map_err(|_| ApiError::unauthorized())?;

    let vehicle = db.create_vehicle(&payload).await?;
    Ok(Json(vehicle.into()))
}

/// DELETE /vehicle/:plate_id - Delete a vehicle
#[gotcha::api]
pub async fn delete_vehicle(
    Extension(auth): Extension<AuthContext>,
    State(db): State<Db>,
    Path(plate_id): Path<String>,
) -> Result<Json<VehicleResponse>, ApiError> {
    auth.require_auth().map_err(|_| ApiError::unauthorized())?;

    let vehicle = db.delete_vehicle(&plate_id).await?;
    Ok(Json(vehicle.into()))
}

/// POST /vehicle/:plate_id/agent - Attach an agent to a vehicle
#[gotcha::api]
pub async fn set_vehicle_agent(
    Extension(auth): Extension<AuthContext>,
    State(db): State<Db>,
    Path(plate_id): Path<String>,
    Json(payload): Json<VehicleSetAgentRequest>,
) -> Result<Json<VehicleResponse>, ApiError> {
    auth.require_auth().map_err(|_| ApiError::unauthorized())?;

    let vehicle = db.set_vehicle_agent(&plate_id, &payload.uuid).await?;
    Ok(Json(vehicle.into()))
}

/// DELETE /vehicle/:plate_id/agent - Detach the vehicle's agent
#[gotcha::api]
pub async fn unset_vehicle_agent(
    Extension(auth): Extension<AuthContext>,
    State(db): State<Db>,
    Path(plate_id): Path<String>,
) -> Result<Json<VehicleResponse>, ApiError> {
    auth.require_auth().map_err(|_| ApiError::unauthorized())?;

    let vehicle = db.unset_vehicle_agent(&plate_id).await?;
    Ok(Json(vehicle.into()))
}

/// PUT /vehicle/:plate_id/groups - Replace the vehicle's groups
#[gotcha::api]
pub async fn set_vehicle_groups(
    Extension(auth): Extension<AuthContext>,
    State(db): State<Db>,
    Path(plate_id): Path<String>,
    Json(payload): Json<VehicleGroupsRequest>,
) -> Result<Json<Vec<GroupResponse>>, ApiError> {
    auth.require_auth().map_err(|_| ApiError::unauthorized())?;

    let groups = db.set_vehicle_groups(&plate_id, &payload.groups).await?;
    Ok(Json(groups.into_iter().map(Into::into).collect()))
}

// ============================================================================
// Groups
// ============================================================================

/// GET /vehicle/group/ - List vehicle groups
#[gotcha::api]
pub async fn list_groups(State(db): State<Db>) -> Result<Json<Vec<GroupResponse>>, ApiError> {
    let groups = db.list_groups().await?;
    Ok(Json(groups.into_iter().map(Into::into).collect()))
}

/// POST /vehicle/group/ - Create a vehicle group
#[gotcha::api]
pub async fn create_group(
    Extension(auth): Extension<AuthContext>,
    State(db): State<Db>,
    Json(payload): Json<GroupCreateRequest>,
) -> Result<Json<GroupResponse>, ApiError> {
    auth.require_auth().map_err(|_| ApiError::unauthorized())?;

    let group = db.create_group(&payload.name).await?;
    Ok(Json(group.into()))
}

/// DELETE /vehicle/group/:group_id - Delete a vehicle group
#[gotcha::api]
pub async fn delete_group(
    Extension(auth): Extension<AuthContext>,
    State(db): State<Db>,
    Path(group_id): Path<i64>,
) -> Result<Json<GroupResponse>, ApiError> {
    auth.require_auth().map_err(|_| ApiError::unauthorized())?;

    let group = db.delete_group(group_id).await?;
    Ok(Json(group.into()))
}
