mod config;

use std::sync::Arc;
use std::time::Duration;

use config::HarborConfig;
use enav_core::{
    init_tracing, service_fn, Area, ConnectionConfig, MaritimeConnection, MemoryNetwork,
    MemorySpatialStore, MessageKind, ParticipantId, Position, PositionTime, ServiceDescriptor,
    ServiceMessage,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct BerthRequest {
    vessel: String,
    length_m: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct BerthAssignment {
    berth: String,
    pilot_required: bool,
}

fn berth_allocation() -> ServiceDescriptor {
    ServiceDescriptor::new("berth-allocation", 1)
}

fn navigational_warning() -> ServiceDescriptor {
    ServiceDescriptor::new("navigational-warning", 1)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    info!(target: "harbor_link", "Starting harbor link demo");

    let cfg = HarborConfig::load();
    let connection_cfg = ConnectionConfig::load();

    let network = MemoryNetwork::new();
    let store = Arc::new(MemorySpatialStore::new());
    let open = |id: ParticipantId| {
        MaritimeConnection::builder(id)
            .transport(network.transport())
            .spatial_store(store.clone())
            .config(connection_cfg.clone())
            .connect()
    };

    // Shore station offering berth allocation
    let shore = open(ParticipantId::new(cfg.station.clone()))?;
    let _berths = shore.register_service(
        berth_allocation(),
        service_fn(|sender, request| {
            let ask: BerthRequest = request.decode()?;
            let assignment = BerthAssignment {
                berth: if ask.length_m > 100.0 { "Nordhavn 3".into() } else { "Inderhavn 1".into() },
                pilot_required: ask.length_m > 90.0,
            };
            info!(target: "harbor_link", from = %sender, vessel = %ask.vessel, berth = %assignment.berth, "Berth assigned");
            ServiceMessage::json(request.descriptor.clone(), MessageKind::Response, &assignment)
        }),
    )?;

    // Vessels report their positions and listen for warnings
    let mut vessels = Vec::new();
    for vessel in &cfg.vessels {
        let id = ParticipantId::mmsi(vessel.mmsi);
        store.report(id.clone(), PositionTime::now(Position::new(vessel.lat, vessel.lon)?));
        let connection = open(id)?;
        let name = vessel.name.clone();
        connection.subscribe_information(
            navigational_warning(),
            Arc::new(move |sender: &ParticipantId, message: &ServiceMessage| {
                info!(target: "harbor_link", vessel = %name, from = %sender, warning = %String::from_utf8_lossy(&message.payload), "Warning received");
            }),
        )?;
        vessels.push((vessel.clone(), connection));
    }

    // Who is in the traffic area?
    let harbor = Position::new(cfg.harbor_lat, cfg.harbor_lon)?;
    let nearby = shore
        .find_all(Area::circle(harbor, cfg.area_radius_m)?)?
        .await?;
    for (id, fix) in &nearby {
        info!(target: "harbor_link", participant = %id, distance_m = harbor.distance_to(&fix.position).round(), "In traffic area");
    }

    let providers = shore.find_services(berth_allocation())?.await?;
    info!(target: "harbor_link", providers = providers.len(), "Berth allocation providers found");

    // Vessels inside the area ask every provider for a berth
    for (vessel, connection) in &vessels {
        if !nearby.contains_key(connection.local_id()) {
            info!(target: "harbor_link", vessel = %vessel.name, "Outside traffic area; skipping berth request");
            continue;
        }
        for provider in providers.keys() {
            let request = ServiceMessage::json(
                berth_allocation(),
                MessageKind::Initiating,
                &BerthRequest {
                    vessel: vessel.name.clone(),
                    length_m: vessel.length_m,
                },
            )?;
            match connection
                .invoke_with_deadline(provider.clone(), request, Some(Duration::from_secs(2)))?
                .await
            {
                Ok(reply) => {
                    let assignment: BerthAssignment = reply.decode()?;
                    info!(target: "harbor_link", vessel = %vessel.name, berth = %assignment.berth, pilot = assignment.pilot_required, "Berth confirmed");
                }
                Err(e) => warn!(target: "harbor_link", vessel = %vessel.name, error = %e, "Berth request failed"),
            }
        }
    }

    shore
        .broadcast_message(ServiceMessage::information(
            navigational_warning(),
            b"Dredging in Kronlob channel, keep clear".to_vec(),
        ))?
        .await?;

    info!(target: "harbor_link", stats = %serde_json::to_string(&shore.stats())?, "Shore station statistics");

    // Graceful shutdown
    for (_, connection) in &vessels {
        connection.close();
    }
    shore.close();
    for connection in vessels.iter().map(|(_, c)| c).chain(std::iter::once(&shore)) {
        if let Err(e) = connection.fully_closed().await {
            error!(target: "harbor_link", participant = %connection.local_id(), error = %e, "Connection did not close cleanly");
        }
    }
    info!(target: "harbor_link", "Harbor link demo finished");
    Ok(())
}
