use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use enav_core::{
    service_fn, Area, ConnectionConfig, MaritimeConnection, MemoryNetwork, MemorySpatialStore,
    NetworkError, ParticipantId, Position, PositionTime, Result, ServiceDescriptor, SpatialStore,
};

fn connect_with(
    network: &Arc<MemoryNetwork>,
    id: &str,
    store: Arc<dyn SpatialStore>,
    config: ConnectionConfig,
) -> Result<MaritimeConnection> {
    MaritimeConnection::builder(id)
        .transport(network.transport())
        .spatial_store(store)
        .config(config)
        .connect()
}

fn pilotage(version: u32) -> ServiceDescriptor {
    ServiceDescriptor::new("pilotage", version)
}

// Copenhagen approach
fn center() -> Result<Position> {
    Position::new(55.68, 12.57)
}

#[tokio::test]
async fn find_all_returns_exactly_the_participants_inside_a_circle() -> Result<()> {
    let store = Arc::new(MemorySpatialStore::new());
    let observed = [
        ("mmsi:1", 55.68, 12.57),  // at the center
        ("mmsi:2", 55.71, 12.57),  // ~3.3 km north
        ("mmsi:3", 55.68, 12.62),  // ~3.1 km east
        ("mmsi:4", 55.73, 12.57),  // ~5.6 km north
        ("mmsi:5", 57.70, 11.97),  // Gothenburg
    ];
    for (id, lat, lon) in observed {
        store.report(id.into(), PositionTime::now(Position::new(lat, lon)?));
    }

    let network = MemoryNetwork::new();
    let shore = connect_with(&network, "shore:dk", store.clone(), ConnectionConfig::default())?;

    let radius_m = 5_000.0;
    let found = shore.find_all(Area::circle(center()?, radius_m)?)?.await?;

    let mut ids: Vec<&str> = found.keys().map(ParticipantId::as_str).collect();
    ids.sort();
    assert_eq!(ids, vec!["mmsi:1", "mmsi:2", "mmsi:3"]);

    for (id, lat, lon) in observed {
        let inside = center()?.distance_to(&Position::new(lat, lon)?) <= radius_m;
        assert_eq!(found.contains_key(&ParticipantId::from(id)), inside, "{id}");
    }
    Ok(())
}

#[tokio::test]
async fn find_all_reports_the_latest_observation() -> Result<()> {
    let store = Arc::new(MemorySpatialStore::new());
    let earlier = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
    let later = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();

    let vessel = ParticipantId::mmsi(219_000_123);
    store.report(vessel.clone(), PositionTime::new(Position::new(55.70, 12.60)?, later));
    // Out-of-order report of an older fix is ignored
    store.report(vessel.clone(), PositionTime::new(Position::new(57.70, 11.97)?, earlier));

    let network = MemoryNetwork::new();
    let shore = connect_with(&network, "shore:dk", store.clone(), ConnectionConfig::default())?;
    let found = shore
        .find_all(Area::bounding_box(55.5, 12.3, 55.9, 12.9)?)?
        .await?;

    assert_eq!(found.get(&vessel).map(|p| p.time), Some(later));
    assert_eq!(store.last_position(&vessel).map(|p| p.time), Some(later));
    Ok(())
}

#[tokio::test]
async fn find_all_with_polygon_area() -> Result<()> {
    let store = Arc::new(MemorySpatialStore::new());
    store.report("mmsi:1".into(), PositionTime::now(Position::new(55.60, 12.70)?));
    store.report("mmsi:2".into(), PositionTime::now(Position::new(55.95, 12.70)?));

    let sound = Area::polygon(vec![
        Position::new(55.50, 12.50)?,
        Position::new(55.50, 12.90)?,
        Position::new(55.80, 12.90)?,
        Position::new(55.80, 12.50)?,
    ])?;

    let network = MemoryNetwork::new();
    let shore = connect_with(&network, "shore:dk", store, ConnectionConfig::default())?;
    let found = shore.find_all(sound)?.await?;

    assert_eq!(found.len(), 1);
    assert!(found.contains_key(&ParticipantId::from("mmsi:1")));
    Ok(())
}

#[tokio::test]
async fn find_services_follows_registrations() -> Result<()> {
    let store = Arc::new(MemorySpatialStore::new());
    let network = MemoryNetwork::new();
    let shore = connect_with(&network, "shore:dk", store.clone(), ConnectionConfig::default())?;

    let registration = shore.register_service(pilotage(2), service_fn(|_, request| Ok(request.reply(Vec::new()))))?;
    // A second provider known to the index with an older version
    store.advertise(&"shore:se".into(), &pilotage(1));

    let any = shore.find_services(pilotage(1))?.await?;
    assert_eq!(any.len(), 2);
    assert_eq!(any.get(shore.local_id()), Some(&pilotage(2)));
    assert_eq!(any.get(&ParticipantId::from("shore:se")), Some(&pilotage(1)));

    let recent = shore.find_services(pilotage(2))?.await?;
    assert_eq!(recent.keys().collect::<Vec<_>>(), vec![shore.local_id()]);

    assert!(registration.cancel());
    assert!(store.advertised_by(shore.local_id()).is_empty());
    let after = shore.find_services(pilotage(2))?.await?;
    assert!(after.is_empty());
    Ok(())
}

#[tokio::test]
async fn highest_compatible_version_wins_per_participant() -> Result<()> {
    let store = Arc::new(MemorySpatialStore::new());
    let provider = ParticipantId::from("shore:no");
    store.advertise(&provider, &pilotage(1));
    store.advertise(&provider, &pilotage(3));
    store.advertise(&provider, &ServiceDescriptor::new("ice-routing", 5));

    let network = MemoryNetwork::new();
    let shore = connect_with(&network, "shore:dk", store, ConnectionConfig::default())?;
    let found = shore.find_services(pilotage(1))?.await?;

    assert_eq!(found.get(&provider), Some(&pilotage(3)));
    assert_eq!(found.len(), 1);
    Ok(())
}

#[tokio::test]
async fn close_withdraws_advertised_services() -> Result<()> {
    let store = Arc::new(MemorySpatialStore::new());
    let network = MemoryNetwork::new();
    let shore = connect_with(&network, "shore:dk", store.clone(), ConnectionConfig::default())?;
    shore.register_service(pilotage(1), service_fn(|_, request| Ok(request.reply(Vec::new()))))?;
    assert_eq!(store.advertised_by(shore.local_id()), vec![pilotage(1)]);

    shore.close();
    shore.fully_closed().await?;

    assert!(store.advertised_by(shore.local_id()).is_empty());
    assert_eq!(
        shore.find_services(pilotage(1)).unwrap_err(),
        NetworkError::ConnectionClosed
    );
    assert_eq!(
        shore.find_all(Area::circle(center()?, 1_000.0)?).unwrap_err(),
        NetworkError::ConnectionClosed
    );
    Ok(())
}

struct OfflineIndex;

#[async_trait]
impl SpatialStore for OfflineIndex {
    async fn query(&self, _area: &Area) -> Result<Vec<(ParticipantId, PositionTime)>> {
        Err(NetworkError::Transport("index offline".into()))
    }

    async fn services(&self) -> Result<Vec<(ParticipantId, ServiceDescriptor)>> {
        Err(NetworkError::Transport("index offline".into()))
    }
}

struct SlowIndex;

#[async_trait]
impl SpatialStore for SlowIndex {
    async fn query(&self, _area: &Area) -> Result<Vec<(ParticipantId, PositionTime)>> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Vec::new())
    }

    async fn services(&self) -> Result<Vec<(ParticipantId, ServiceDescriptor)>> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn store_failure_fails_the_lookup() -> Result<()> {
    let network = MemoryNetwork::new();
    let shore = connect_with(&network, "shore:dk", Arc::new(OfflineIndex), ConnectionConfig::default())?;

    let err = shore.find_services(pilotage(1))?.await.unwrap_err();
    assert_eq!(err, NetworkError::Transport("index offline".into()));
    let err = shore.find_all(Area::circle(center()?, 1_000.0)?)?.await.unwrap_err();
    assert_eq!(err, NetworkError::Transport("index offline".into()));
    Ok(())
}

#[tokio::test]
async fn discovery_deadline_bounds_slow_lookups() -> Result<()> {
    let network = MemoryNetwork::new();
    let deadline = Duration::from_millis(20);
    let shore = connect_with(
        &network,
        "shore:dk",
        Arc::new(SlowIndex),
        ConnectionConfig::default().with_discovery_timeout(Some(deadline)),
    )?;

    let err = shore.find_all(Area::circle(center()?, 1_000.0)?)?.await.unwrap_err();
    assert_eq!(err, NetworkError::Timeout(deadline));
    Ok(())
}
