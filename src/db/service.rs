use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use conservator::{Migrator, PooledConnection};
use tokio_postgres::Row;
use tokio_postgres::types::ToSql;
use uuid::Uuid;

use crate::TrackerError;
use crate::auth::{UserTokens, hash_password, verify_password};
use crate::feed::{VehicleFilter, VehicleLookup};
use crate::models::{
    Agent, AgentState, Credentials, GpsData, Group, User, Vehicle, VehicleCreateRequest,
    VehicleType,
};

const VEHICLE_SELECT: &str = r#"
    SELECT v.id, v.plate_id, v.vehicle_type, v.updated_at,
           a.id AS a_id, a.uuid AS a_uuid, a.label AS a_label,
           a.lat AS a_lat, a.lon AS a_lon, a.gps_ts AS a_gps_ts,
           a.created_at AS a_created_at, a.updated_at AS a_updated_at
    FROM vehicles v
    LEFT JOIN agents a ON a.id = v.agent_id
"#;

const AGENT_COLUMNS: &str = "id, uuid, label, lat, lon, gps_ts, created_at, updated_at";

const USER_COLUMNS: &str = "id, uuid, email, password_hash, token, created_at, updated_at";

/// Database service for agents, vehicles, vehicle groups and users
pub struct DatabaseService {
    pool: Arc<PooledConnection>,
}

impl DatabaseService {
    /// Create a new database service
    pub fn new(database_url: &str) -> crate::Result<Self> {
        let pool = PooledConnection::from_url(database_url).map_err(TrackerError::Database)?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> crate::Result<()> {
        let migrator = Migrator::from_path("./migrations")?;

        let mut conn = self.pool.get().await.map_err(TrackerError::Database)?;

        migrator.run(&mut conn).await?;

        tracing::info!("Migrations completed successfully");
        Ok(())
    }

    // ========================================================================
    // Agent operations
    // ========================================================================

    /// List agents, optionally only those (not) attached to a vehicle
    pub async fn list_agents(&self, state: Option<AgentState>) -> crate::Result<Vec<Agent>> {
        let conn = self.pool.get().await.map_err(TrackerError::Database)?;

        let condition = match state {
            None => "",
            Some(AgentState::Assigned) => {
                "WHERE EXISTS (SELECT 1 FROM vehicles v WHERE v.agent_id = agents.id)"
            }
            Some(AgentState::Unassigned) => {
                "WHERE NOT EXISTS (SELECT 1 FROM vehicles v WHERE v.agent_id = agents.id)"
            }
        };
        let query = format!("SELECT {} FROM agents {} ORDER BY id", AGENT_COLUMNS, condition);

        let rows = conn
            .query(&query, &[])
            .await
            .map_err(TrackerError::Database)?;

        Ok(rows.iter().map(agent_from_row).collect())
    }

    pub async fn get_agent_by_uuid(&self, uuid: Uuid) -> crate::Result<Option<Agent>> {
        let conn = self.pool.get().await.map_err(TrackerError::Database)?;

        let query = format!("SELECT {} FROM agents WHERE uuid = $1", AGENT_COLUMNS);
        let row = conn
            .query_opt(&query, &[&uuid])
            .await
            .map_err(TrackerError::Database)?;

        Ok(row.as_ref().map(agent_from_row))
    }

    /// Store a new position for `uuid`, creating the agent on first contact
    pub async fn sync_agent(&self, uuid: Uuid, data: &GpsData) -> crate::Result<Agent> {
        let conn = self.pool.get().await.map_err(TrackerError::Database)?;

        let query = format!(
            r#"
            INSERT INTO agents (uuid, lat, lon, gps_ts)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (uuid) DO UPDATE
            SET lat = EXCLUDED.lat, lon = EXCLUDED.lon, gps_ts = EXCLUDED.gps_ts, updated_at = NOW()
            RETURNING {}
            "#,
            AGENT_COLUMNS
        );

        let row = conn
            .query_one(&query, &[&uuid, &data.lat, &data.lon, &data.ts])
            .await
            .map_err(TrackerError::Database)?;

        Ok(agent_from_row(&row))
    }

    // ========================================================================
    // Vehicle operations
    // ========================================================================

    async fn query_vehicles(
        &self,
        condition: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> crate::Result<Vec<Vehicle>> {
        let conn = self.pool.get().await.map_err(TrackerError::Database)?;

        let query = format!("{} {} ORDER BY v.id", VEHICLE_SELECT, condition);
        let rows = conn
            .query(&query, params)
            .await
            .map_err(TrackerError::Database)?;

        let mut vehicles = rows
            .iter()
            .map(vehicle_from_row)
            .collect::<crate::Result<Vec<Vehicle>>>()?;
        if vehicles.is_empty() {
            return Ok(vehicles);
        }

        let vehicle_ids: Vec<i64> = vehicles.iter().map(|v| v.id).collect();
        let rows = conn
            .query(
                r#"
                SELECT m.vehicle_id, g.id, g.name
                FROM vehicle_group_members m
                JOIN vehicle_groups g ON g.id = m.group_id
                WHERE m.vehicle_id = ANY($1)
                ORDER BY g.id
                "#,
                &[&vehicle_ids],
            )
            .await
            .map_err(TrackerError::Database)?;

        let mut groups: HashMap<i64, Vec<Group>> = HashMap::new();
        for row in rows.iter() {
            groups.entry(row.get("vehicle_id")).or_default().push(Group {
                id: row.get("id"),
                name: row.get("name"),
            });
        }

        for vehicle in vehicles.iter_mut() {
            vehicle.groups = groups.remove(&vehicle.id).unwrap_or_default();
        }

        Ok(vehicles)
    }

    pub async fn list_vehicles(&self) -> crate::Result<Vec<Vehicle>> {
        self.query_vehicles("", &[]).await
    }

    /// Vehicles matching `filter` and, when given, the agent assignment state
    pub async fn filter_vehicles(
        &self,
        filter: &VehicleFilter,
        agent_state: Option<AgentState>,
    ) -> crate::Result<Vec<Vehicle>> {
        let vehicles = self.list_vehicles().await?;

        Ok(vehicles
            .into_iter()
            .filter(|v| filter.matches(v))
            .filter(|v| match agent_state {
                None => true,
                Some(AgentState::Assigned) => v.agent.is_some(),
                Some(AgentState::Unassigned) => v.agent.is_none(),
            })
            .collect())
    }

    pub async fn get_vehicle_by_plate(&self, plate_id: &str) -> crate::Result<Option<Vehicle>> {
        let mut vehicles = self.query_vehicles("WHERE v.plate_id = $1", &[&plate_id]).await?;
        Ok(vehicles.pop())
    }

    pub async fn get_vehicle_by_agent_uuid(&self, agent_uuid: Uuid) -> crate::Result<Option<Vehicle>> {
        let mut vehicles = self.query_vehicles("WHERE a.uuid = $1", &[&agent_uuid]).await?;
        Ok(vehicles.pop())
    }

    async fn require_vehicle(&self, plate_id: &str) -> crate::Result<Vehicle> {
        self.get_vehicle_by_plate(plate_id)
            .await?
            .ok_or_else(|| TrackerError::NotFound(format!("Vehicle {}", plate_id)))
    }

    async fn require_agent(&self, uuid: &str) -> crate::Result<Agent> {
        let parsed = Uuid::parse_str(uuid)
            .map_err(|_| TrackerError::InvalidInput(format!("Invalid agent uuid: {}", uuid)))?;

        self.get_agent_by_uuid(parsed)
            .await?
            .ok_or_else(|| TrackerError::InvalidInput(format!("Agent not found: {}", uuid)))
    }

    /// An agent drives at most one vehicle
    async fn require_free_agent(&self, uuid: &str, plate_id: &str) -> crate::Result<Agent> {
        let agent = self.require_agent(uuid).await?;

        match self.get_vehicle_by_agent_uuid(agent.uuid).await? {
            Some(other) if other.plate_id != plate_id => Err(TrackerError::InvalidInput(format!(
                "Agent {} is already assigned to {}",
                agent.uuid, other.plate_id
            ))),
            _ => Ok(agent),
        }
    }

    /// Check that every id names an existing group
    async fn require_groups(&self, group_ids: &[i64]) -> crate::Result<()> {
        if group_ids.is_empty() {
            return Ok(());
        }

        let conn = self.pool.get().await.map_err(TrackerError::Database)?;
        let ids = group_ids.to_vec();
        let rows = conn
            .query("SELECT id FROM vehicle_groups WHERE id = ANY($1)", &[&ids])
            .await
            .map_err(TrackerError::Database)?;

        let existing: Vec<i64> = rows.iter().map(|r| r.get("id")).collect();
        match group_ids.iter().find(|id| !existing.contains(id)) {
            Some(missing) => Err(TrackerError::InvalidInput(format!("Group not found: {}", missing))),
            None => Ok(()),
        }
    }

    pub async fn create_vehicle(&self, request: &VehicleCreateRequest) -> crate::Result<Vehicle> {
        let plate_id = request.plate_id.trim();
        if plate_id.is_empty() {
            return Err(TrackerError::InvalidInput("plate_id is required".to_string()));
        }

        let vehicle_type: VehicleType = request.vehicle_type.parse().map_err(|_| {
            TrackerError::InvalidInput(format!("Unknown vehicle type: {}", request.vehicle_type))
        })?;

        let group_ids = distinct_group_ids(&request.groups);
        self.require_groups(&group_ids).await?;

        let agent_uuid = request.agent_uuid.as_deref().filter(|s| !s.is_empty());
        let agent_id = match agent_uuid {
            Some(uuid) => Some(self.require_free_agent(uuid, plate_id).await?.id),
            None => None,
        };

        if self.get_vehicle_by_plate(plate_id).await?.is_some() {
            return Err(TrackerError::InvalidInput(format!("Vehicle already exists: {}", plate_id)));
        }

        // One statement, so the vehicle and its memberships land together.
        // A concurrent insert of the same plate or agent yields no row.
        let conn = self.pool.get().await.map_err(TrackerError::Database)?;
        let row = conn
            .query_opt(
                r#"
                WITH created AS (
                    INSERT INTO vehicles (plate_id, vehicle_type, agent_id)
                    VALUES ($1, $2, $3)
                    ON CONFLICT DO NOTHING
                    RETURNING id
                ), members AS (
                    INSERT INTO vehicle_group_members (vehicle_id, group_id)
                    SELECT created.id, g FROM created, unnest($4::BIGINT[]) AS g
                    ON CONFLICT DO NOTHING
                )
                SELECT id FROM created
                "#,
                &[&plate_id, &vehicle_type.as_str(), &agent_id, &group_ids],
            )
            .await
            .map_err(TrackerError::Database)?;
        drop(conn);

        if row.is_none() {
            return Err(self.vehicle_conflict(plate_id, agent_uuid).await);
        }

        tracing::info!(plate_id, vehicle_type = %vehicle_type, "vehicle created");
        self.require_vehicle(plate_id).await
    }

    /// Explain a write that lost a race on the plate or agent unique index
    async fn vehicle_conflict(&self, plate_id: &str, agent_uuid: Option<&str>) -> TrackerError {
        match self.get_vehicle_by_plate(plate_id).await {
            Ok(Some(_)) => {
                return TrackerError::InvalidInput(format!("Vehicle already exists: {}", plate_id));
            }
            Ok(None) => {}
            Err(e) => return e,
        }

        if let Some(uuid) = agent_uuid {
            if let Err(e) = self.require_free_agent(uuid, plate_id).await {
                return e;
            }
        }

        TrackerError::InvalidInput(format!("Vehicle {} conflicts with an existing vehicle", plate_id))
    }

    /// Delete a vehicle, returning it as it was
    pub async fn delete_vehicle(&self, plate_id: &str) -> crate::Result<Vehicle> {
        let vehicle = self.require_vehicle(plate_id).await?;

        let conn = self.pool.get().await.map_err(TrackerError::Database)?;
        conn.execute("DELETE FROM vehicles WHERE id = $1", &[&vehicle.id])
            .await
            .map_err(TrackerError::Database)?;

        Ok(vehicle)
    }

    pub async fn set_vehicle_agent(&self, plate_id: &str, agent_uuid: &str) -> crate::Result<Vehicle> {
        let vehicle = self.require_vehicle(plate_id).await?;
        let agent = self.require_free_agent(agent_uuid, plate_id).await?;

        let conn = self.pool.get().await.map_err(TrackerError::Database)?;
        let updated = conn
            .execute(
                "UPDATE vehicles SET agent_id = $1, updated_at = NOW() WHERE id = $2",
                &[&agent.id, &vehicle.id],
            )
            .await;
        drop(conn);

        if let Err(e) = updated {
            // The agent may have been assigned elsewhere since the check
            self.require_free_agent(agent_uuid, plate_id).await?;
            return Err(TrackerError::Database(e));
        }

        self.require_vehicle(plate_id).await
    }

    pub async fn unset_vehicle_agent(&self, plate_id: &str) -> crate::Result<Vehicle> {
        let vehicle = self.require_vehicle(plate_id).await?;

        let conn = self.pool.get().await.map_err(TrackerError::Database)?;
        conn.execute(
            "UPDATE vehicles SET agent_id = NULL, updated_at = NOW() WHERE id = $1",
            &[&vehicle.id],
        )
        .await
        .map_err(TrackerError::Database)?;

        self.require_vehicle(plate_id).await
    }

    /// Replace the vehicle's group memberships
    pub async fn set_vehicle_groups(&self, plate_id: &str, group_ids: &[i64]) -> crate::Result<Vec<Group>> {
        let vehicle = self.require_vehicle(plate_id).await?;
        let group_ids = distinct_group_ids(group_ids);
        self.require_groups(&group_ids).await?;

        // Removal, insertion and the timestamp bump commit or fail as one
        // statement. The delete and insert touch disjoint rows.
        let conn = self.pool.get().await.map_err(TrackerError::Database)?;
        conn.execute(
            r#"
            WITH removed AS (
                DELETE FROM vehicle_group_members
                WHERE vehicle_id = $1 AND NOT (group_id = ANY($2::BIGINT[]))
            ), added AS (
                INSERT INTO vehicle_group_members (vehicle_id, group_id)
                SELECT $1, g FROM unnest($2::BIGINT[]) AS g
                ON CONFLICT DO NOTHING
            )
            UPDATE vehicles SET updated_at = NOW() WHERE id = $1
            "#,
            &[&vehicle.id, &group_ids],
        )
        .await
        .map_err(TrackerError::Database)?;
        drop(conn);

        Ok(self.require_vehicle(plate_id).await?.groups)
    }

    // ========================================================================
    // Group operations
    // ========================================================================

    pub async fn list_groups(&self) -> crate::Result<Vec<Group>> {
        let conn = self.pool.get().await.map_err(TrackerError::Database)?;

        let rows = conn
            .query("SELECT id, name FROM vehicle_groups ORDER BY id", &[])
            .await
            .map_err(TrackerError::Database)?;

        Ok(rows
            .iter()
            .map(|row| Group {
                id: row.get("id"),
                name: row.get("name"),
            })
            .collect())
    }

    pub async fn get_group(&self, group_id: i64) -> crate::Result<Option<Group>> {
        let conn = self.pool.get().await.map_err(TrackerError::Database)?;

        let row = conn
            .query_opt("SELECT id, name FROM vehicle_groups WHERE id = $1", &[&group_id])
            .await
            .map_err(TrackerError::Database)?;

        Ok(row.map(|r| Group {
            id: r.get("id"),
            name: r.get("name"),
        }))
    }

    pub async fn create_group(&self, name: &str) -> crate::Result<Group> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TrackerError::InvalidInput("name is required".to_string()));
        }

        let conn = self.pool.get().await.map_err(TrackerError::Database)?;
        let row = conn
            .query_opt(
                r#"
                INSERT INTO vehicle_groups (name)
                VALUES ($1)
                ON CONFLICT (name) DO NOTHING
                RETURNING id, name
                "#,
                &[&name],
            )
            .await
            .map_err(TrackerError::Database)?;

        row.map(|r| Group {
            id: r.get("id"),
            name: r.get("name"),
        })
        .ok_or_else(|| TrackerError::InvalidInput(format!("Group already exists: {}", name)))
    }

    /// Delete a group (memberships go with it), returning it as it was
    pub async fn delete_group(&self, group_id: i64) -> crate::Result<Group> {
        let group = self
            .get_group(group_id)
            .await?
            .ok_or_else(|| TrackerError::NotFound(format!("Group {}", group_id)))?;

        let conn = self.pool.get().await.map_err(TrackerError::Database)?;
        conn.execute("DELETE FROM vehicle_groups WHERE id = $1", &[&group_id])
            .await
            .map_err(TrackerError::Database)?;

        Ok(group)
    }

    // ========================================================================
    // User operations
    // ========================================================================

    pub async fn list_users(&self) -> crate::Result<Vec<User>> {
        let conn = self.pool.get().await.map_err(TrackerError::Database)?;

        let query = format!("SELECT {} FROM users ORDER BY id", USER_COLUMNS);
        let rows = conn
            .query(&query, &[])
            .await
            .map_err(TrackerError::Database)?;

        Ok(rows.iter().map(user_from_row).collect())
    }

    pub async fn get_user_by_uuid(&self, uuid: Uuid) -> crate::Result<Option<User>> {
        self.find_user("uuid = $1", &[&uuid]).await
    }

    pub async fn get_user_by_email(&self, email: &str) -> crate::Result<Option<User>> {
        self.find_user("email = $1", &[&email]).await
    }

    pub async fn get_user_by_token(&self, token: &str) -> crate::Result<Option<User>> {
        self.find_user("token = $1", &[&token]).await
    }

    async fn find_user(
        &self,
        condition: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> crate::Result<Option<User>> {
        let conn = self.pool.get().await.map_err(TrackerError::Database)?;

        let query = format!("SELECT {} FROM users WHERE {}", USER_COLUMNS, condition);
        let row = conn
            .query_opt(&query, params)
            .await
            .map_err(TrackerError::Database)?;

        Ok(row.as_ref().map(user_from_row))
    }

    /// Create an account; emails are unique case-insensitively
    pub async fn create_user(&self, credentials: &Credentials) -> crate::Result<User> {
        let email = credentials
            .normalized_email()
            .ok_or_else(|| TrackerError::InvalidInput("a valid email is required".to_string()))?;
        if credentials.password.is_empty() {
            return Err(TrackerError::InvalidInput("password is required".to_string()));
        }

        let password_hash = hash_password(credentials.password.clone()).await?;

        let conn = self.pool.get().await.map_err(TrackerError::Database)?;
        let query = format!(
            r#"
            INSERT INTO users (uuid, email, password_hash)
            VALUES ($1, $2, $3)
            ON CONFLICT (email) DO NOTHING
            RETURNING {}
            "#,
            USER_COLUMNS
        );
        let row = conn
            .query_opt(&query, &[&Uuid::new_v4(), &email, &password_hash])
            .await
            .map_err(TrackerError::Database)?;

        row.as_ref()
            .map(user_from_row)
            .ok_or_else(|| TrackerError::InvalidInput(format!("User already exists: {}", email)))
    }

    /// Delete an account, returning it as it was
    pub async fn delete_user(&self, uuid: Uuid) -> crate::Result<User> {
        let conn = self.pool.get().await.map_err(TrackerError::Database)?;

        let query = format!("DELETE FROM users WHERE uuid = $1 RETURNING {}", USER_COLUMNS);
        let row = conn
            .query_opt(&query, &[&uuid])
            .await
            .map_err(TrackerError::Database)?;

        row.as_ref()
            .map(user_from_row)
            .ok_or_else(|| TrackerError::NotFound(format!("User {}", uuid)))
    }

    /// Check credentials and issue a fresh token, revoking the previous one
    pub async fn authorize(&self, credentials: &Credentials) -> crate::Result<String> {
        let invalid = || TrackerError::Auth("Invalid credentials".to_string());

        let email = credentials.normalized_email().ok_or_else(invalid)?;
        let user = self.get_user_by_email(&email).await?.ok_or_else(invalid)?;

        if !verify_password(credentials.password.clone(), user.password_hash.clone()).await {
            tracing::warn!(user = %user.uuid, "password rejected");
            return Err(invalid());
        }

        let token = Uuid::new_v4().simple().to_string();
        let conn = self.pool.get().await.map_err(TrackerError::Database)?;
        conn.execute(
            "UPDATE users SET token = $2, updated_at = NOW() WHERE id = $1",
            &[&user.id, &token],
        )
        .await
        .map_err(TrackerError::Database)?;

        tracing::info!(user = %user.uuid, "user logged in");
        Ok(token)
    }
}

#[async_trait]
impl UserTokens for DatabaseService {
    async fn user_by_token(&self, token: &str) -> crate::Result<Option<User>> {
        self.get_user_by_token(token).await
    }
}

#[async_trait]
impl VehicleLookup for DatabaseService {
    async fn resolve_vehicle_for_agent(&self, agent_uuid: Uuid) -> crate::Result<Option<Vehicle>> {
        self.get_vehicle_by_agent_uuid(agent_uuid).await
    }
}

/// Requested group ids in first-seen order without repeats
fn distinct_group_ids(group_ids: &[i64]) -> Vec<i64> {
    let mut seen = Vec::with_capacity(group_ids.len());
    for id in group_ids {
        if !seen.contains(id) {
            seen.push(*id);
        }
    }
    seen
}

fn agent_from_row(row: &Row) -> Agent {
    Agent {
        id: row.get("id"),
        uuid: row.get("uuid"),
        label: row.get("label"),
        lat: row.get("lat"),
        lon: row.get("lon"),
        gps_ts: row.get("gps_ts"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn user_from_row(row: &Row) -> User {
    User {
        id: row.get("id"),
        uuid: row.get("uuid"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        token: row.get("token"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn vehicle_from_row(row: &Row) -> crate::Result<Vehicle> {
    let raw_type: String = row.get("vehicle_type");
    let vehicle_type = raw_type.parse::<VehicleType>().map_err(|_| {
        tracing::error!(vehicle_type = %raw_type, "unknown vehicle type stored in database");
        TrackerError::Internal
    })?;

    let agent = row.get::<_, Option<i64>>("a_id").map(|id| Agent {
        id,
        uuid: row.get("a_uuid"),
        label: row.get("a_label"),
        lat: row.get("a_lat"),
        lon: row.get("a_lon"),
        gps_ts: row.get("a_gps_ts"),
        created_at: row.get("a_created_at"),
        updated_at: row.get("a_updated_at"),
    });

    Ok(Vehicle {
        id: row.get("id"),
        plate_id: row.get("plate_id"),
        vehicle_type,
        agent,
        groups: Vec::new(),
        updated_at: row.get("updated_at"),
    })
}
