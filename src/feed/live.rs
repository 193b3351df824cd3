//! Live vehicle feed for one client connection
//!
//! A feed subscribes to `NEW-AGENT`, resolves each reporting agent to its
//! vehicle, applies the client's [`VehicleFilter`] and writes matching
//! vehicles to the connection. It ends when the peer disconnects or a write
//! fails; both paths share one cleanup that unregisters the handler once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::Message;
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::filter::VehicleFilter;
use crate::event_bus::{EventBus, EventKind, KindName, SubscriptionHandle};
use crate::models::{AgentReport, Vehicle};

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Write timed out after {0:?}")]
    Timeout(Duration),
}

/// Resolves a reporting agent to the vehicle it is attached to
#[async_trait]
pub trait VehicleLookup: Send + Sync {
    /// `Ok(None)` when the agent is not assigned to any vehicle
    async fn resolve_vehicle_for_agent(&self, agent_uuid: Uuid) -> crate::Result<Option<Vehicle>>;
}

/// Outbound half of a client connection
#[async_trait]
pub trait FeedWriter: Send {
    async fn write_vehicle(&mut self, vehicle: &Vehicle) -> Result<(), FeedError>;

    async fn close(&mut self) {}
}

/// Why a feed terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedExit {
    PeerClosed,
    WriteFailed,
}

pub struct LiveFeed {
    kind: EventKind<AgentReport>,
    lookup: Arc<dyn VehicleLookup>,
    filter: VehicleFilter,
    write_timeout: Duration,
}

impl LiveFeed {
    pub fn new(bus: &EventBus, lookup: Arc<dyn VehicleLookup>, filter: VehicleFilter) -> Self {
        Self {
            kind: bus.kind::<AgentReport>(KindName::NEW_AGENT),
            lookup,
            filter,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Upper bound for one vehicle lookup, one write and the final close.
    /// A slower peer is treated as gone.
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Stream matching vehicles to `writer` until the connection ends
    ///
    /// `reader` is only watched for disconnects; client messages are ignored.
    pub async fn run<W, R, E>(self, writer: W, mut reader: R) -> FeedExit
    where
        W: FeedWriter + 'static,
        R: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: std::fmt::Display,
    {
        let state = Arc::new(FeedState {
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            write_failed: Notify::new(),
            lookup: self.lookup,
            filter: self.filter,
            write_timeout: self.write_timeout,
        });

        let handler_state = state.clone();
        let handle = self.kind.register(move |report: Arc<AgentReport>| {
            let state = handler_state.clone();
            async move {
                state.deliver(&report).await;
                Ok(())
            }
        });

        info!(
            subscription = %handle.id(),
            vehicle_type = ?state.filter.vehicle_type,
            group_id = ?state.filter.group_id,
            "live feed subscribed"
        );

        let mut registration = Registration {
            kind: self.kind,
            handle: Some(handle),
        };

        let exit = tokio::select! {
            exit = watch_peer(&mut reader) => exit,
            _ = state.write_failed.notified() => FeedExit::WriteFailed,
        };

        state.closed.store(true, Ordering::Release);
        registration.release();

        // A stuck peer must not keep the feed alive after a failed write
        let close = async { state.writer.lock().await.close().await };
        if tokio::time::timeout(state.write_timeout, close).await.is_err() {
            warn!(timeout = ?state.write_timeout, "live feed close timed out, dropping connection");
        }

        info!(?exit, "live feed closed");
        exit
    }
}

struct FeedState<W> {
    writer: Mutex<W>,
    closed: AtomicBool,
    write_failed: Notify,
    lookup: Arc<dyn VehicleLookup>,
    filter: VehicleFilter,
    write_timeout: Duration,
}

impl<W: FeedWriter> FeedState<W> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn deliver(&self, report: &AgentReport) {
        if self.is_closed() {
            return;
        }

        let lookup = self.lookup.resolve_vehicle_for_agent(report.agent_uuid);
        let vehicle = match tokio::time::timeout(self.write_timeout, lookup).await {
            Ok(Ok(Some(vehicle))) => vehicle,
            Ok(Ok(None)) => {
                debug!(agent_uuid = %report.agent_uuid, "no vehicle assigned to agent, skipping");
                return;
            }
            Ok(Err(e)) => {
                warn!(agent_uuid = %report.agent_uuid, error = %e, "vehicle lookup failed, skipping");
                return;
            }
            Err(_) => {
                warn!(agent_uuid = %report.agent_uuid, timeout = ?self.write_timeout, "vehicle lookup timed out, skipping");
                return;
            }
        };

        if !self.filter.matches(&vehicle) {
            trace!(plate_id = %vehicle.plate_id, "vehicle filtered out");
            return;
        }

        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return;
        }

        let result = match tokio::time::timeout(self.write_timeout, writer.write_vehicle(&vehicle)).await {
            Ok(result) => result,
            Err(_) => Err(FeedError::Timeout(self.write_timeout)),
        };

        if let Err(e) = result {
            warn!(plate_id = %vehicle.plate_id, error = %e, "live feed write failed, closing");
            self.closed.store(true, Ordering::Release);
            self.write_failed.notify_one();
        }
    }
}

/// Owns the feed's subscription; unregisters at most once, including when
/// the feed future is dropped early.
struct Registration {
    kind: EventKind<AgentReport>,
    handle: Option<SubscriptionHandle>,
}

impl Registration {
    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.kind.unregister(&handle);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}

async fn watch_peer<R, E>(reader: &mut R) -> FeedExit
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Close(_)) => {
                debug!("Client sent close frame");
                break;
            }
            Ok(Message::Text(text)) => {
                debug!(message = %text, "Ignoring text message from client");
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Client connection error");
                break;
            }
        }
    }

    FeedExit::PeerClosed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Group, VehicleType};
    use chrono::Utc;
    use futures_util::stream::{self, BoxStream};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    #[derive(Default)]
    struct FakeLookup {
        vehicles: HashMap<Uuid, Vehicle>,
        broken: Option<Uuid>,
        hanging: Option<Uuid>,
    }

    #[async_trait]
    impl VehicleLookup for FakeLookup {
        async fn resolve_vehicle_for_agent(&self, agent_uuid: Uuid) -> crate::Result<Option<Vehicle>> {
            if self.broken == Some(agent_uuid) {
                return Err(crate::TrackerError::Internal);
            }
            if self.hanging == Some(agent_uuid) {
                std::future::pending::<()>().await;
            }
            Ok(self.vehicles.get(&agent_uuid).cloned())
        }
    }

    /// Fails every write and never finishes sending the close frame
    struct StuckCloseWriter;

    #[async_trait]
    impl FeedWriter for StuckCloseWriter {
        async fn write_vehicle(&mut self, _vehicle: &Vehicle) -> Result<(), FeedError> {
            Err(FeedError::Transport("send buffer full".to_string()))
        }

        async fn close(&mut self) {
            std::future::pending::<()>().await;
        }
    }

    #[derive(Clone, Default)]
    struct RecordingWriter {
        written: Arc<StdMutex<Vec<String>>>,
        fail: Arc<AtomicBool>,
        stall: Option<Duration>,
        closes: Arc<AtomicUsize>,
    }

    impl RecordingWriter {
        fn plates(&self) -> Vec<String> {
            self.written.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FeedWriter for RecordingWriter {
        async fn write_vehicle(&mut self, vehicle: &Vehicle) -> Result<(), FeedError> {
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(FeedError::Transport("connection reset".to_string()));
            }
            self.written.lock().unwrap().push(vehicle.plate_id.clone());
            Ok(())
        }

        async fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    type ClientStream = BoxStream<'static, Result<Message, std::io::Error>>;

    /// Client side of a fake connection; dropping the sender is a disconnect
    fn client() -> (mpsc::UnboundedSender<Message>, ClientStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (Ok(msg), rx))
        })
        .boxed();
        (tx, stream)
    }

    fn vehicle(plate: &str, vehicle_type: VehicleType, groups: &[i64]) -> Vehicle {
        Vehicle {
            id: 1,
            plate_id: plate.to_string(),
            vehicle_type,
            agent: None,
            groups: groups
                .iter()
                .map(|&id| Group {
                    id,
                    name: format!("group-{}", id),
                })
                .collect(),
            updated_at: Utc::now(),
        }
    }

    fn report(agent_uuid: Uuid) -> AgentReport {
        AgentReport {
            agent_uuid,
            lat: "35.14".to_string(),
            lon: "33.91".to_string(),
            gps_ts: "1700000000".to_string(),
            reported_at: Utc::now(),
        }
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Handler registered after the feeds; once it has seen `n` events,
    /// every feed has finished handling them too.
    fn barrier(bus: &EventBus) -> Arc<AtomicUsize> {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        bus.register(KindName::NEW_AGENT, move |_: Arc<AgentReport>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        seen
    }

    fn spawn_feed(
        bus: &EventBus,
        lookup: Arc<dyn VehicleLookup>,
        filter: VehicleFilter,
        writer: RecordingWriter,
    ) -> (mpsc::UnboundedSender<Message>, JoinHandle<FeedExit>) {
        let (tx, stream) = client();
        let feed = LiveFeed::new(bus, lookup, filter);
        (tx, tokio::spawn(feed.run(writer, stream)))
    }

    fn subscribers(bus: &EventBus) -> usize {
        bus.kind::<AgentReport>(KindName::NEW_AGENT).subscriber_count()
    }

    #[tokio::test]
    async fn test_feed_filters_by_type_and_group() {
        let bus = EventBus::new();
        bus.run().unwrap();

        let assigned = Uuid::new_v4();
        let unassigned = Uuid::new_v4();
        let mut lookup = FakeLookup::default();
        lookup
            .vehicles
            .insert(assigned, vehicle("V-1", VehicleType::SchoolBus, &[3]));
        let lookup: Arc<dyn VehicleLookup> = Arc::new(lookup);

        let school_bus = RecordingWriter::default();
        let solar_car = RecordingWriter::default();
        let group_5 = RecordingWriter::default();
        let everything = RecordingWriter::default();

        let (_c1, _) = spawn_feed(&bus, lookup.clone(), VehicleFilter::new(Some("SCHOOL-BUS".into()), None), school_bus.clone());
        let (_c2, _) = spawn_feed(&bus, lookup.clone(), VehicleFilter::new(Some("SOLAR-CAR".into()), None), solar_car.clone());
        let (_c3, _) = spawn_feed(&bus, lookup.clone(), VehicleFilter::new(None, Some(5)), group_5.clone());
        let (_c4, _) = spawn_feed(&bus, lookup.clone(), VehicleFilter::default(), everything.clone());
        wait_until(|| subscribers(&bus) == 4).await;
        let done = barrier(&bus);

        let kind = bus.kind::<AgentReport>(KindName::NEW_AGENT);
        kind.emit(report(assigned));
        kind.emit(report(unassigned));
        kind.emit(report(assigned));

        wait_until(|| done.load(Ordering::SeqCst) == 3).await;
        assert_eq!(school_bus.plates(), vec!["V-1", "V-1"]);
        assert!(solar_car.plates().is_empty());
        assert!(group_5.plates().is_empty());
        assert_eq!(everything.plates(), vec!["V-1", "V-1"]);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_unresolvable_and_foreign_payloads_are_skipped() {
        let bus = EventBus::new();
        bus.run().unwrap();

        let assigned = Uuid::new_v4();
        let broken = Uuid::new_v4();
        let mut lookup = FakeLookup::default();
        lookup
            .vehicles
            .insert(assigned, vehicle("V-2", VehicleType::SolarCar, &[]));
        lookup.broken = Some(broken);

        let writer = RecordingWriter::default();
        let (_client, _) = spawn_feed(&bus, Arc::new(lookup), VehicleFilter::default(), writer.clone());
        wait_until(|| subscribers(&bus) == 1).await;
        let done = barrier(&bus);

        bus.emit(KindName::NEW_AGENT, "not an agent report".to_string());
        bus.emit(KindName::NEW_AGENT, report(Uuid::new_v4()));
        bus.emit(KindName::NEW_AGENT, report(broken));
        bus.emit(KindName::NEW_AGENT, report(assigned));

        // The barrier only counts AgentReport payloads
        wait_until(|| done.load(Ordering::SeqCst) == 3).await;
        assert_eq!(writer.plates(), vec!["V-2"]);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_peer_disconnect_unregisters_once() {
        let bus = EventBus::new();
        bus.run().unwrap();

        let agent = Uuid::new_v4();
        let mut lookup = FakeLookup::default();
        lookup
            .vehicles
            .insert(agent, vehicle("V-3", VehicleType::SchoolBus, &[1]));

        let writer = RecordingWriter::default();
        let (client, feed) = spawn_feed(&bus, Arc::new(lookup), VehicleFilter::default(), writer.clone());
        wait_until(|| subscribers(&bus) == 1).await;

        client.send(Message::Text("hello".to_string())).unwrap();
        client.send(Message::Close(None)).unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), feed).await.unwrap().unwrap();
        assert_eq!(exit, FeedExit::PeerClosed);
        assert_eq!(subscribers(&bus), 0);
        assert_eq!(writer.closes.load(Ordering::SeqCst), 1);

        let done = barrier(&bus);
        bus.emit(KindName::NEW_AGENT, report(agent));
        wait_until(|| done.load(Ordering::SeqCst) == 1).await;
        assert!(writer.plates().is_empty());

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_connection_ends_feed() {
        let bus = EventBus::new();
        bus.run().unwrap();

        let writer = RecordingWriter::default();
        let (client, feed) = spawn_feed(&bus, Arc::new(FakeLookup::default()), VehicleFilter::default(), writer);
        wait_until(|| subscribers(&bus) == 1).await;

        drop(client);

        let exit = tokio::time::timeout(Duration::from_secs(5), feed).await.unwrap().unwrap();
        assert_eq!(exit, FeedExit::PeerClosed);
        assert_eq!(subscribers(&bus), 0);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_failure_terminates_feed() {
        let bus = EventBus::new();
        bus.run().unwrap();

        let agent = Uuid::new_v4();
        let mut lookup = FakeLookup::default();
        lookup
            .vehicles
            .insert(agent, vehicle("V-4", VehicleType::SchoolBus, &[]));

        let writer = RecordingWriter::default();
        writer.fail.store(true, Ordering::SeqCst);
        let (_client, feed) = spawn_feed(&bus, Arc::new(lookup), VehicleFilter::default(), writer.clone());
        wait_until(|| subscribers(&bus) == 1).await;

        bus.emit(KindName::NEW_AGENT, report(agent));

        let exit = tokio::time::timeout(Duration::from_secs(5), feed).await.unwrap().unwrap();
        assert_eq!(exit, FeedExit::WriteFailed);
        assert_eq!(subscribers(&bus), 0);
        assert_eq!(writer.closes.load(Ordering::SeqCst), 1);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_slow_writer_does_not_stall_dispatcher() {
        let bus = EventBus::new();
        bus.run().unwrap();

        let agent = Uuid::new_v4();
        let mut lookup = FakeLookup::default();
        lookup
            .vehicles
            .insert(agent, vehicle("V-5", VehicleType::SchoolBus, &[]));

        let writer = RecordingWriter {
            stall: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let (client, stream) = client();
        let feed = LiveFeed::new(&bus, Arc::new(lookup), VehicleFilter::default())
            .with_write_timeout(Duration::from_millis(20));
        let feed = tokio::spawn(feed.run(writer, stream));
        wait_until(|| subscribers(&bus) == 1).await;
        let done = barrier(&bus);

        bus.emit(KindName::NEW_AGENT, report(agent));
        bus.emit(KindName::NEW_AGENT, report(agent));

        wait_until(|| done.load(Ordering::SeqCst) == 2).await;
        let exit = tokio::time::timeout(Duration::from_secs(5), feed).await.unwrap().unwrap();
        assert_eq!(exit, FeedExit::WriteFailed);
        assert_eq!(subscribers(&bus), 1);

        drop(client);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_stuck_close_does_not_hang_feed() {
        let bus = EventBus::new();
        bus.run().unwrap();

        let agent = Uuid::new_v4();
        let mut lookup = FakeLookup::default();
        lookup
            .vehicles
            .insert(agent, vehicle("V-6", VehicleType::SolarCar, &[]));

        let (_client, stream) = client();
        let feed = LiveFeed::new(&bus, Arc::new(lookup), VehicleFilter::default())
            .with_write_timeout(Duration::from_millis(50));
        let feed = tokio::spawn(feed.run(StuckCloseWriter, stream));
        wait_until(|| subscribers(&bus) == 1).await;

        bus.emit(KindName::NEW_AGENT, report(agent));

        let exit = tokio::time::timeout(Duration::from_secs(2), feed)
            .await
            .expect("feed should return despite a stuck close")
            .unwrap();
        assert_eq!(exit, FeedExit::WriteFailed);
        assert_eq!(subscribers(&bus), 0);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_hanging_lookup_does_not_stall_dispatcher() {
        let bus = EventBus::new();
        bus.run().unwrap();

        let hanging = Uuid::new_v4();
        let assigned = Uuid::new_v4();
        let mut lookup = FakeLookup::default();
        lookup
            .vehicles
            .insert(assigned, vehicle("V-7", VehicleType::SchoolBus, &[]));
        lookup.hanging = Some(hanging);

        let writer = RecordingWriter::default();
        let (_client, stream) = client();
        let feed = LiveFeed::new(&bus, Arc::new(lookup), VehicleFilter::default())
            .with_write_timeout(Duration::from_millis(20));
        let _feed = tokio::spawn(feed.run(writer.clone(), stream));
        wait_until(|| subscribers(&bus) == 1).await;
        let done = barrier(&bus);

        bus.emit(KindName::NEW_AGENT, report(hanging));
        bus.emit(KindName::NEW_AGENT, report(assigned));

        wait_until(|| done.load(Ordering::SeqCst) == 2).await;
        assert_eq!(writer.plates(), vec!["V-7"]);
        assert_eq!(subscribers(&bus), 2);

        bus.shutdown().await;
    }
}
