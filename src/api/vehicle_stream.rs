use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info};

use crate::api::vehicles::VehicleFilterQuery;
use crate::config::Settings;
use crate::event_bus::EventBus;
use crate::feed::{FeedError, FeedWriter, LiveFeed, VehicleFilter, VehicleLookup};
use crate::models::{Vehicle, VehicleResponse};
use crate::Db;

/// Sends each vehicle as one JSON text frame
struct WsFeedWriter {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FeedWriter for WsFeedWriter {
    async fn write_vehicle(&mut self, vehicle: &Vehicle) -> Result<(), FeedError> {
        let json = serde_json::to_string(&VehicleResponse::from(vehicle.clone()))?;

        self.sink
            .send(Message::Text(json))
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.send(Message::Close(None)).await {
            debug!(error = %e, "close frame not delivered");
        }
    }
}

/// GET /ws/vehicle/filter - Live positions of vehicles matching the filter
pub async fn ws_vehicle_filter(
    ws: WebSocketUpgrade,
    State(db): State<Db>,
    State(bus): State<EventBus>,
    State(settings): State<Settings>,
    Query(query): Query<VehicleFilterQuery>,
) -> Response {
    let filter = match query.to_filter() {
        Ok(filter) => filter,
        Err(e) => return e.into_response(),
    };

    let lookup: Arc<dyn VehicleLookup> = db.0.clone();
    let write_timeout = settings.live_feed.write_timeout();

    ws.on_upgrade(move |socket| handle_vehicle_stream(socket, bus, lookup, filter, write_timeout))
        .into_response()
}

async fn handle_vehicle_stream(
    socket: WebSocket,
    bus: EventBus,
    lookup: Arc<dyn VehicleLookup>,
    filter: VehicleFilter,
    write_timeout: std::time::Duration,
) {
    let (sink, stream) = socket.split();

    info!(
        vehicle_type = ?filter.vehicle_type,
        group_id = ?filter.group_id,
        "client connected to vehicle stream"
    );

    let exit = LiveFeed::new(&bus, lookup, filter)
        .with_write_timeout(write_timeout)
        .run(WsFeedWriter { sink }, stream)
        .await;

    info!(?exit, "client disconnected from vehicle stream");
}
