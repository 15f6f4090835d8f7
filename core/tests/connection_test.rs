use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use enav_core::{
    service_fn, Area, ConnectionConfig, ConnectionState, MaritimeConnection, MemoryNetwork,
    NetworkError, ParticipantId, Position, Result, ServiceCallback, ServiceDescriptor,
    ServiceMessage,
};
use tokio::sync::Semaphore;

fn connect(
    network: &Arc<MemoryNetwork>,
    id: &str,
    drain_timeout: Duration,
) -> Result<MaritimeConnection> {
    MaritimeConnection::builder(id)
        .transport(network.transport())
        .config(
            ConnectionConfig::default()
                .with_drain_timeout(drain_timeout)
                .with_invoke_timeout(None),
        )
        .connect()
}

fn tide_tables() -> ServiceDescriptor {
    ServiceDescriptor::new("tide-tables", 1)
}

fn request(payload: &str) -> ServiceMessage {
    ServiceMessage::initiating(tide_tables(), payload.as_bytes().to_vec())
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

// Answers once a permit is available
struct MeteredService {
    permits: Arc<Semaphore>,
}

#[async_trait]
impl ServiceCallback for MeteredService {
    async fn call(&self, _sender: ParticipantId, request: ServiceMessage) -> Result<ServiceMessage> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| NetworkError::Cancelled)?;
        permit.forget();
        Ok(request.reply(b"high water 14:32".to_vec()))
    }
}

#[tokio::test]
async fn new_connection_is_open() -> Result<()> {
    let network = MemoryNetwork::new();
    let vessel = connect(&network, "mmsi:219000123", Duration::from_secs(1))?;

    assert_eq!(vessel.state(), ConnectionState::Open);
    assert!(!vessel.is_closed());
    assert!(!vessel.is_fully_closed());
    assert_eq!(network.participants(), vec![ParticipantId::from("mmsi:219000123")]);
    Ok(())
}

#[tokio::test]
async fn connect_requires_a_transport() {
    let err = MaritimeConnection::builder("mmsi:219000123")
        .connect()
        .unwrap_err();
    assert!(matches!(err, NetworkError::Config(_)));
}

#[tokio::test]
async fn close_waits_for_outstanding_invocations() -> Result<()> {
    let network = MemoryNetwork::new();
    let shore = connect(&network, "shore:dk", Duration::from_secs(5))?;
    let vessel = connect(&network, "mmsi:219000123", Duration::from_secs(5))?;
    let permits = Arc::new(Semaphore::new(0));
    shore.register_service(
        tide_tables(),
        Arc::new(MeteredService {
            permits: Arc::clone(&permits),
        }),
    )?;

    let futures = vec![
        vessel.invoke_service(shore.local_id().clone(), request("a"))?,
        vessel.invoke_service(shore.local_id().clone(), request("b"))?,
        vessel.invoke_service(shore.local_id().clone(), request("c"))?,
    ];
    assert!(eventually(|| shore.stats().inbound_requests == 3).await);

    vessel.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(vessel.state(), ConnectionState::Closing);
    assert!(!vessel.is_fully_closed());
    assert_eq!(vessel.stats().pending_requests, 3);

    permits.add_permits(3);
    for future in futures {
        assert_eq!(future.await?.payload, b"high water 14:32".to_vec());
    }
    vessel.fully_closed().await?;
    assert!(vessel.is_fully_closed());
    assert_eq!(vessel.stats().pending_requests, 0);
    Ok(())
}

#[tokio::test]
async fn close_resolves_every_outstanding_invocation() -> Result<()> {
    let network = MemoryNetwork::new();
    let shore = connect(&network, "shore:dk", Duration::from_secs(5))?;
    let silent = connect(&network, "mmsi:265000777", Duration::from_secs(5))?;
    let vessel = connect(&network, "mmsi:219000123", Duration::from_millis(200))?;
    network.mute(silent.local_id());
    shore.register_service(
        tide_tables(),
        service_fn(|_, request| match request.payload.as_slice() {
            b"ok" => Ok(request.reply(b"slack water".to_vec())),
            _ => Err(NetworkError::InvalidArgument("unknown station".into())),
        }),
    )?;

    let answered = vessel.invoke_service(shore.local_id().clone(), request("ok"))?;
    let refused = vessel.invoke_service(shore.local_id().clone(), request("bad"))?;
    let unanswered = vessel.invoke_service(silent.local_id().clone(), request("ok"))?;
    vessel.close();

    vessel.fully_closed().await?;
    assert!(vessel.is_fully_closed());
    assert!(answered.is_done() && refused.is_done() && unanswered.is_done());

    assert_eq!(answered.await?.payload, b"slack water".to_vec());
    assert!(matches!(refused.await, Err(NetworkError::Remote(_))));
    assert_eq!(unanswered.await.unwrap_err(), NetworkError::ConnectionClosed);
    Ok(())
}

#[tokio::test]
async fn operations_are_rejected_once_closing() -> Result<()> {
    let network = MemoryNetwork::new();
    let vessel = connect(&network, "mmsi:219000123", Duration::from_secs(1))?;
    let target = ParticipantId::from("shore:dk");

    vessel.close();
    assert_eq!(vessel.state(), ConnectionState::Closing);
    assert!(vessel.is_closed());

    assert_eq!(
        vessel.invoke_service(target.clone(), request("a")).unwrap_err(),
        NetworkError::ConnectionClosing
    );
    assert_eq!(
        vessel
            .register_service(tide_tables(), service_fn(|_, r| Ok(r.reply(Vec::new()))))
            .unwrap_err(),
        NetworkError::ConnectionClosing
    );
    assert_eq!(
        vessel
            .send_message(target.clone(), ServiceMessage::information(tide_tables(), Vec::new()))
            .unwrap_err(),
        NetworkError::ConnectionClosing
    );
    // Lookups still work while draining
    let area = Area::circle(Position::new(55.68, 12.57)?, 1_000.0)?;
    assert!(vessel.find_all(area.clone()).is_ok());

    vessel.fully_closed().await?;
    assert_eq!(vessel.state(), ConnectionState::FullyClosed);
    assert_eq!(
        vessel.invoke_service(target, request("a")).unwrap_err(),
        NetworkError::ConnectionClosed
    );
    assert_eq!(vessel.find_all(area).unwrap_err(), NetworkError::ConnectionClosed);
    assert!(network.participants().is_empty());

    // Idempotent
    vessel.close();
    assert_eq!(vessel.state(), ConnectionState::FullyClosed);
    Ok(())
}

#[tokio::test]
async fn closing_connection_still_serves_inbound_requests() -> Result<()> {
    let network = MemoryNetwork::new();
    let shore = connect(&network, "shore:dk", Duration::from_millis(500))?;
    let silent = connect(&network, "mmsi:265000777", Duration::from_secs(5))?;
    let vessel = connect(&network, "mmsi:219000123", Duration::from_secs(5))?;
    network.mute(silent.local_id());
    shore.register_service(
        tide_tables(),
        service_fn(|_, request| Ok(request.reply(b"ebb".to_vec()))),
    )?;

    // Keeps the shore draining until the deadline
    let stuck = shore.invoke_service(silent.local_id().clone(), request("x"))?;
    shore.close();

    let reply = vessel
        .invoke_service(shore.local_id().clone(), request("y"))?
        .await?;
    assert_eq!(reply.payload, b"ebb".to_vec());
    assert_eq!(shore.state(), ConnectionState::Closing);

    assert_eq!(stuck.await.unwrap_err(), NetworkError::ConnectionClosed);
    shore.fully_closed().await?;

    let err = vessel
        .invoke_service(shore.local_id().clone(), request("z"))?
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::Transport(_)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unbounded_drain_and_wait_reach_fully_closed() -> Result<()> {
    let network = MemoryNetwork::new();
    let shore = connect(&network, "shore:dk", Duration::MAX)?;
    let vessel = connect(&network, "mmsi:219000123", Duration::MAX)?;
    shore.register_service(
        tide_tables(),
        service_fn(|_, request| Ok(request.reply(b"flood".to_vec()))),
    )?;

    let answered = vessel.invoke_service(shore.local_id().clone(), request("ok"))?;
    vessel.close();

    let waiter = vessel.clone();
    let closed = tokio::task::spawn_blocking(move || waiter.await_fully_closed(Duration::MAX))
        .await
        .expect("waiter panicked")?;
    assert!(closed);
    assert!(vessel.is_fully_closed());
    assert_eq!(answered.await?.payload, b"flood".to_vec());

    // Already closed: returns at once
    assert_eq!(vessel.await_fully_closed(Duration::MAX), Ok(true));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn await_fully_closed_blocks_until_released() -> Result<()> {
    let network = MemoryNetwork::new();
    let silent = connect(&network, "mmsi:265000777", Duration::from_secs(5))?;
    let vessel = connect(&network, "mmsi:219000123", Duration::from_millis(500))?;
    network.mute(silent.local_id());
    let stuck = vessel.invoke_service(silent.local_id().clone(), request("x"))?;

    vessel.close();

    let waiter = vessel.clone();
    let early = tokio::task::spawn_blocking(move || waiter.await_fully_closed(Duration::from_millis(10)))
        .await
        .expect("waiter panicked")?;
    assert!(!early);

    let waiter = vessel.clone();
    let done = tokio::task::spawn_blocking(move || waiter.await_fully_closed(Duration::from_secs(5)))
        .await
        .expect("waiter panicked")?;
    assert!(done);
    assert!(vessel.is_fully_closed());
    assert_eq!(stuck.try_get(), Some(Err(NetworkError::ConnectionClosed)));
    Ok(())
}

#[test]
fn runtime_teardown_interrupts_close() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .expect("runtime");
    let network = MemoryNetwork::new();
    let open = |id: &str| {
        MaritimeConnection::builder(id)
            .transport(network.transport())
            .runtime(runtime.handle().clone())
            .config(ConnectionConfig::default().with_drain_timeout(Duration::from_secs(30)))
            .connect()
    };
    let silent = open("mmsi:265000777")?;
    let vessel = open("mmsi:219000123")?;
    network.mute(silent.local_id());

    let _stuck = vessel.invoke_with_deadline(silent.local_id().clone(), request("x"), None)?;
    vessel.close();
    runtime.shutdown_timeout(Duration::from_secs(1));

    assert_eq!(
        vessel.await_fully_closed(Duration::from_secs(1)),
        Err(NetworkError::Interrupted)
    );
    assert!(!vessel.is_fully_closed());
    Ok(())
}
