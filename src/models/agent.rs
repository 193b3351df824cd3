use chrono::{DateTime, Utc};
use gotcha::Schematic;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Agent State
// ============================================================================

/// Whether an agent is currently attached to a vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Assigned,
    Unassigned,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Assigned => "ASSIGNED",
            AgentState::Unassigned => "UNASSIGNED",
        }
    }
}

impl std::str::FromStr for AgentState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ASSIGNED" => Ok(AgentState::Assigned),
            "UNASSIGNED" => Ok(AgentState::Unassigned),
            _ => Err(()),
        }
    }
}

// ============================================================================
// Agent (Database Model)
// ============================================================================

/// A GPS reporting device. Created on its first sync.
#[derive(Debug, Clone, PartialEq)]
pub struct Agent {
    pub id: i64,
    pub uuid: Uuid,
    pub label: String,
    pub lat: String,
    pub lon: String,
    pub gps_ts: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Agent Report (NEW-AGENT payload)
// ============================================================================

/// Position update emitted on `NEW-AGENT` after an agent syncs
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReport {
    pub agent_uuid: Uuid,
    pub lat: String,
    pub lon: String,
    pub gps_ts: String,
    pub reported_at: DateTime<Utc>,
}

impl From<&Agent> for AgentReport {
    fn from(agent: &Agent) -> Self {
        Self {
            agent_uuid: agent.uuid,
            lat: agent.lat.clone(),
            lon: agent.lon.clone(),
            gps_ts: agent.gps_ts.clone(),
            reported_at: agent.updated_at,
        }
    }
}

// ============================================================================
// API Request/Response Types
// ============================================================================

/// Body of `POST /agent/:uuid/sync`
#[derive(Debug, Clone, Deserialize, Schematic)]
pub struct GpsData {
    pub lat: String,
    pub lon: String,
    pub ts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Schematic)]
pub struct AgentResponse {
    pub uuid: String,
    pub label: String,
    pub lat: String,
    pub lon: String,
    pub gps_ts: String,
    pub updated_at: DateTime<Utc>,
}

impl From<Agent> for AgentResponse {
    fn from(agent: Agent) -> Self {
        Self {
            uuid: agent.uuid.to_string(),
            label: agent.label,
            lat: agent.lat,
            lon: agent.lon,
            gps_ts: agent.gps_ts,
            updated_at: agent.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_state_parsing() {
        assert_eq!("ASSIGNED".parse::<AgentState>(), Ok(AgentState::Assigned));
        assert_eq!("UNASSIGNED".parse::<AgentState>(), Ok(AgentState::Unassigned));
        assert!("assigned".parse::<AgentState>().is_err());
        assert_eq!(AgentState::Unassigned.as_str(), "UNASSIGNED");
    }

    #[test]
    fn test_report_from_agent() {
        let now = Utc::now();
        let agent = Agent {
            id: 1,
            uuid: Uuid::new_v4(),
            label: "bus tracker".to_string(),
            lat: "35.2".to_string(),
            lon: "33.3".to_string(),
            gps_ts: "1500000000".to_string(),
            created_at: now,
            updated_at: now,
        };

        let report = AgentReport::from(&agent);
        assert_eq!(report.agent_uuid, agent.uuid);
        assert_eq!(report.lat, "35.2");
        assert_eq!(report.gps_ts, "1500000000");
        assert_eq!(report.reported_at, now);
    }
}
