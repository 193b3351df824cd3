use chrono::{DateTime, Utc};
use gotcha::Schematic;
use serde::{Deserialize, Serialize};

use super::agent::{Agent, AgentResponse};

// ============================================================================
// Vehicle Type
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VehicleType {
    #[serde(rename = "SCHOOL-BUS")]
    SchoolBus,
    #[serde(rename = "SOLAR-CAR")]
    SolarCar,
}

impl VehicleType {
    pub const ALL: [VehicleType; 2] = [VehicleType::SchoolBus, VehicleType::SolarCar];

    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleType::SchoolBus => "SCHOOL-BUS",
            VehicleType::SolarCar => "SOLAR-CAR",
        }
    }
}

impl std::str::FromStr for VehicleType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHOOL-BUS" => Ok(VehicleType::SchoolBus),
            "SOLAR-CAR" => Ok(VehicleType::SolarCar),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for VehicleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Group (Database Model)
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub id: i64,
    pub name: String,
}

// ============================================================================
// Vehicle (Database Model)
// ============================================================================

/// A vehicle with its tracking agent and group memberships loaded
#[derive(Debug, Clone, PartialEq)]
pub struct Vehicle {
    pub id: i64,
    pub plate_id: String,
    pub vehicle_type: VehicleType,
    pub agent: Option<Agent>,
    pub groups: Vec<Group>,
    pub updated_at: DateTime<Utc>,
}

impl Vehicle {
    pub fn in_group(&self, group_id: i64) -> bool {
        self.groups.iter().any(|g| g.id == group_id)
    }
}

// ============================================================================
// API Request/Response Types
// ============================================================================

#[derive(Debug, Clone, Deserialize, Schematic)]
pub struct VehicleCreateRequest {
    pub plate_id: String,
    #[serde(rename = "type")]
    pub vehicle_type: String,
    pub agent_uuid: Option<String>,
    #[serde(default)]
    pub groups: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize, Schematic)]
pub struct VehicleSetAgentRequest {
    pub uuid: String,
}

#[derive(Debug, Clone, Deserialize, Schematic)]
pub struct VehicleGroupsRequest {
    pub groups: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize, Schematic)]
pub struct GroupCreateRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Schematic)]
pub struct GroupResponse {
    pub id: i64,
    pub name: String,
}

impl From<Group> for GroupResponse {
    fn from(group: Group) -> Self {
        Self {
            id: group.id,
            name: group.name,
        }
    }
}

/// Wire shape of a vehicle, shared by REST responses and the live feed
#[derive(Debug, Clone, Serialize, Deserialize, Schematic)]
pub struct VehicleResponse {
    pub plate_id: String,
    #[serde(rename = "type")]
    pub vehicle_type: String,
    pub agent: Option<AgentResponse>,
    pub groups: Vec<GroupResponse>,
    pub updated_at: DateTime<Utc>,
}

impl From<Vehicle> for VehicleResponse {
    fn from(vehicle: Vehicle) -> Self {
        Self {
            plate_id: vehicle.plate_id,
            vehicle_type: vehicle.vehicle_type.to_string(),
            agent: vehicle.agent.map(Into::into),
            groups: vehicle.groups.into_iter().map(Into::into).collect(),
            updated_at: vehicle.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vehicle_type_round_trip() {
        for vehicle_type in VehicleType::ALL {
            assert_eq!(vehicle_type.as_str().parse::<VehicleType>(), Ok(vehicle_type));
        }
        assert!("TRAIN".parse::<VehicleType>().is_err());
    }

    #[test]
    fn test_vehicle_response_shape() {
        let vehicle = Vehicle {
            id: 10,
            plate_id: "34 ABC 123".to_string(),
            vehicle_type: VehicleType::SchoolBus,
            agent: None,
            groups: vec![Group {
                id: 3,
                name: "north".to_string(),
            }],
            updated_at: Utc::now(),
        };
        assert!(vehicle.in_group(3));
        assert!(!vehicle.in_group(5));

        let json = serde_json::to_value(VehicleResponse::from(vehicle)).unwrap();
        assert_eq!(json["plate_id"], "34 ABC 123");
        assert_eq!(json["type"], "SCHOOL-BUS");
        assert!(json["agent"].is_null());
        assert_eq!(json["groups"][0]["id"], 3);
        assert!(json.get("id").is_none());
    }
}
