//! Live vehicle feed and HTTP API integration tests
//!
//! Run against a server started with a migrated database:
//! `USER_TOKEN=... cargo test --test live_feed_integration -- --ignored`

use futures_util::StreamExt;
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const WS_URL: &str = "ws://localhost:3000/ws/vehicle/filter";
const HTTP_URL: &str = "http://localhost:3000";

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_feed(params: &str) -> Result<WsStream, Box<dyn std::error::Error>> {
    let url = if params.is_empty() {
        WS_URL.to_string()
    } else {
        format!("{}?{}", WS_URL, params)
    };

    let (ws_stream, _) = connect_async(&url).await?;
    Ok(ws_stream)
}

async fn read_json_message(ws_stream: &mut WsStream) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    if let Some(Ok(Message::Text(text))) = ws_stream.next().await {
        let msg: serde_json::Value = serde_json::from_str(&text)?;
        Ok(msg)
    } else {
        Err("No message received".into())
    }
}

async fn sync_agent(agent_uuid: &str, lat: &str, lon: &str) -> Result<(), Box<dyn std::error::Error>> {
    let response = reqwest::Client::new()
        .post(format!("{}/agent/{}/sync", HTTP_URL, agent_uuid))
        .json(&json!({"lat": lat, "lon": lon, "ts": "1500000000"}))
        .send()
        .await?;

    assert!(response.status().is_success(), "sync failed: {}", response.status());
    Ok(())
}

/// Create a group, an agent and a vehicle of `vehicle_type` driven by it
async fn seed_vehicle(
    token: &str,
    vehicle_type: &str,
) -> Result<(String, String, i64), Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let agent_uuid = uuid::Uuid::new_v4().to_string();
    let plate_id = format!("IT {}", &suffix[..8]);

    sync_agent(&agent_uuid, "35.0", "33.0").await?;

    let group: serde_json::Value = client
        .post(format!("{}/vehicle/group/", HTTP_URL))
        .bearer_auth(token)
        .json(&json!({"name": format!("it-{}", suffix)}))
        .send()
        .await?
        .json()
        .await?;
    let group_id = group["id"].as_i64().ok_or("group id missing")?;

    let response = client
        .post(format!("{}/vehicle/", HTTP_URL))
        .bearer_auth(token)
        .json(&json!({
            "plate_id": plate_id,
            "type": vehicle_type,
            "agent_uuid": agent_uuid,
            "groups": [group_id],
        }))
        .send()
        .await?;
    assert!(response.status().is_success(), "create vehicle failed: {}", response.status());

    Ok((agent_uuid, plate_id, group_id))
}

#[tokio::test]
#[ignore] // Run manually: cargo test --test live_feed_integration -- --ignored
async fn test_feed_rejects_non_integer_group() -> Result<(), Box<dyn std::error::Error>> {
    let result = connect_feed("vehicle_group_id=north").await;
    assert!(result.is_err(), "upgrade should be refused with 400");

    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_feed_delivers_matching_vehicle() -> Result<(), Box<dyn std::error::Error>> {
    let token = std::env::var("USER_TOKEN").expect("USER_TOKEN not set");
    let (agent_uuid, plate_id, group_id) = seed_vehicle(&token, "SCHOOL-BUS").await?;

    let mut ws_stream =
        connect_feed(&format!("vehicle_type=SCHOOL-BUS&vehicle_group_id={}", group_id)).await?;

    sync_agent(&agent_uuid, "35.1", "33.2").await?;

    let msg = timeout(Duration::from_secs(5), read_json_message(&mut ws_stream)).await??;
    assert_eq!(msg["plate_id"], plate_id.as_str());
    assert_eq!(msg["type"], "SCHOOL-BUS");
    assert_eq!(msg["agent"]["lat"], "35.1");
    assert_eq!(msg["groups"][0]["id"], group_id);

    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_feed_skips_other_vehicle_types() -> Result<(), Box<dyn std::error::Error>> {
    let token = std::env::var("USER_TOKEN").expect("USER_TOKEN not set");
    let (agent_uuid, _plate_id, group_id) = seed_vehicle(&token, "SCHOOL-BUS").await?;

    let mut ws_stream =
        connect_feed(&format!("vehicle_type=SOLAR-CAR&vehicle_group_id={}", group_id)).await?;

    sync_agent(&agent_uuid, "35.3", "33.4").await?;

    let result = timeout(Duration::from_secs(2), read_json_message(&mut ws_stream)).await;
    assert!(result.is_err(), "no vehicle should match, got {:?}", result);

    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_mutations_require_token() -> Result<(), Box<dyn std::error::Error>> {
    let response = reqwest::Client::new()
        .post(format!("{}/vehicle/group/", HTTP_URL))
        .json(&json!({"name": "unauthorized"}))
        .send()
        .await?;

    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = response.json().await?;
    assert!(body["error"].is_string());

    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_login_issues_working_token() -> Result<(), Box<dyn std::error::Error>> {
    let service_token = std::env::var("USER_TOKEN").expect("USER_TOKEN not set");
    let client = reqwest::Client::new();
    let email = format!("it-{}@example.org", uuid::Uuid::new_v4().simple());

    let created = client
        .post(format!("{}/user/", HTTP_URL))
        .bearer_auth(&service_token)
        .json(&json!({"email": email, "password": "correct horse"}))
        .send()
        .await?;
    assert!(created.status().is_success(), "create user failed: {}", created.status());
    let user: serde_json::Value = created.json().await?;
    assert!(user.get("password_hash").is_none());

    let rejected = client
        .post(format!("{}/auth/", HTTP_URL))
        .json(&json!({"email": email, "password": "battery staple"}))
        .send()
        .await?;
    assert_eq!(rejected.status(), reqwest::StatusCode::UNAUTHORIZED);

    let login: serde_json::Value = client
        .post(format!("{}/auth/", HTTP_URL))
        .json(&json!({"email": email, "password": "correct horse"}))
        .send()
        .await?
        .json()
        .await?;
    let token = login["authorization_token"].as_str().ok_or("token missing")?;

    let check: serde_json::Value = client
        .get(format!("{}/auth/", HTTP_URL))
        .bearer_auth(token)
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(check["authorized"], true);
    assert_eq!(check["user"]["uuid"], user["uuid"]);

    // A user token unlocks mutations like the service token does
    let group = client
        .post(format!("{}/vehicle/group/", HTTP_URL))
        .bearer_auth(token)
        .json(&json!({"name": format!("it-{}", uuid::Uuid::new_v4().simple())}))
        .send()
        .await?;
    assert!(group.status().is_success(), "create group failed: {}", group.status());

    let deleted = client
        .delete(format!("{}/user/{}", HTTP_URL, user["uuid"].as_str().ok_or("uuid missing")?))
        .bearer_auth(&service_token)
        .send()
        .await?;
    assert!(deleted.status().is_success());

    let stale = client
        .get(format!("{}/auth/", HTTP_URL))
        .bearer_auth(token)
        .send()
        .await?;
    assert_eq!(stale.status(), reqwest::StatusCode::UNAUTHORIZED);

    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_group_replacement_is_all_or_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let token = std::env::var("USER_TOKEN").expect("USER_TOKEN not set");
    let (_agent_uuid, plate_id, group_id) = seed_vehicle(&token, "SOLAR-CAR").await?;
    let client = reqwest::Client::new();

    let response = client
        .put(format!("{}/vehicle/{}/groups", HTTP_URL, plate_id))
        .bearer_auth(&token)
        .json(&json!({"groups": [i64::MAX]}))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let vehicle: serde_json::Value = client
        .get(format!("{}/vehicle/{}", HTTP_URL, plate_id))
        .send()
        .await?
        .json()
        .await?;
    let groups = vehicle["groups"].as_array().ok_or("groups missing")?;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["id"], group_id);

    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_concurrent_duplicate_creates_are_client_errors() -> Result<(), Box<dyn std::error::Error>> {
    let token = std::env::var("USER_TOKEN").expect("USER_TOKEN not set");
    let plate_id = format!("RACE {}", &uuid::Uuid::new_v4().simple().to_string()[..8]);

    let attempts = (0..8).map(|_| {
        let token = token.clone();
        let plate_id = plate_id.clone();
        tokio::spawn(async move {
            reqwest::Client::new()
                .post(format!("{}/vehicle/", HTTP_URL))
                .bearer_auth(token)
                .json(&json!({"plate_id": plate_id, "type": "SCHOOL-BUS"}))
                .send()
                .await
                .map(|r| r.status())
        })
    });

    let mut created = 0;
    for attempt in attempts.collect::<Vec<_>>() {
        let status = attempt.await??;
        if status.is_success() {
            created += 1;
        } else {
            assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
        }
    }
    assert_eq!(created, 1);

    Ok(())
}
