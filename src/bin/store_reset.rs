//! Document store reset tool
//!
//! Removes everything the service publishes and seeds room metadata from
//! the `[[rooms]]` section of the configuration. Use before a deployment
//! or a fresh data collection run.
//!
//! Usage:
//!   store-reset --config config/dev.toml
//!   store-reset --config config/dev.toml --keep-data   # only reseed rooms

use anyhow::Context;
use clap::Parser;
use doorway_occupancy::infra::config::RoomConfig;
use doorway_occupancy::infra::Config;
use doorway_occupancy::io::store::{create_store, join_path, DocumentStore};
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Top-level collections written by the service
const COLLECTIONS: [&str; 4] = ["rooms", "sessions", "live_data", "logs"];

#[derive(Parser, Debug)]
#[command(name = "store-reset")]
#[command(about = "Wipe published occupancy data and seed room metadata")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Skip the wipe and only write room metadata
    #[arg(long)]
    keep_data: bool,
}

fn room_document(room: &RoomConfig) -> Value {
    let location = match (room.lat, room.lng) {
        (Some(lat), Some(lng)) => json!({ "lat": lat, "lng": lng }),
        _ => Value::Null,
    };
    json!({
        "room_name": room.name,
        "building": room.building,
        "capacity": room.capacity,
        "floor": room.floor,
        "type": room.room_type,
        "location": location,
    })
}

async fn wipe(store: &dyn DocumentStore) -> anyhow::Result<()> {
    for collection in COLLECTIONS {
        store.delete(collection).await.with_context(|| format!("deleting {collection}"))?;
        info!(collection = %collection, "collection_deleted");
    }
    Ok(())
}

async fn seed_rooms(store: &dyn DocumentStore, rooms: &[RoomConfig]) -> anyhow::Result<usize> {
    for room in rooms {
        let path = join_path("rooms", &room.id);
        store
            .set(&path, &room_document(room))
            .await
            .with_context(|| format!("writing {path}"))?;
        info!(room = %room.id, name = %room.name, "room_seeded");
    }
    Ok(rooms.len())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path)
        .with_context(|| format!("loading configuration from {config_path}"))?;

    let store = create_store(&config).context("creating document store")?;
    info!(backend = %store.name(), config_file = %config.config_file(), "store_reset_starting");

    if !args.keep_data {
        wipe(store.as_ref()).await?;
    }

    if config.rooms().is_empty() {
        warn!("no [[rooms]] configured, nothing to seed");
    }
    let seeded = seed_rooms(store.as_ref(), config.rooms()).await?;

    let wiped = !args.keep_data;
    info!(rooms = %seeded, wiped = %wiped, "store_reset_complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use doorway_occupancy::io::store::MemoryStore;

    fn room(id: &str) -> RoomConfig {
        RoomConfig {
            id: id.to_string(),
            name: "Lecture Hall 1".to_string(),
            building: "Engineering".to_string(),
            capacity: 120,
            floor: 2,
            room_type: "lecture".to_string(),
            lat: Some(35.15),
            lng: Some(33.91),
        }
    }

    #[test]
    fn test_room_document_shape() {
        let doc = room_document(&room("room01"));
        assert_eq!(doc["room_name"], "Lecture Hall 1");
        assert_eq!(doc["capacity"], 120);
        assert_eq!(doc["type"], "lecture");
        assert_eq!(doc["location"]["lat"], 35.15);
    }

    #[test]
    fn test_room_without_coordinates_has_null_location() {
        let mut r = room("room02");
        r.lng = None;
        assert!(room_document(&r)["location"].is_null());
    }

    #[tokio::test]
    async fn test_wipe_then_seed() {
        let store = MemoryStore::new();
        store.set("sessions/room01/s1/metadata", &json!({"room_id": "room01"})).await.unwrap();
        store.set("live_data/room01", &json!({"crowdiness_index": 0.4})).await.unwrap();
        store.set("rooms/old", &json!({"count": 3})).await.unwrap();

        wipe(&store).await.unwrap();
        let seeded = seed_rooms(&store, &[room("room01")]).await.unwrap();

        assert_eq!(seeded, 1);
        assert!(store.get("sessions").await.unwrap().is_none());
        assert!(store.get("live_data").await.unwrap().is_none());
        assert!(store.get("rooms/old").await.unwrap().is_none());
        let seeded_room = store.get("rooms/room01").await.unwrap().unwrap();
        assert_eq!(seeded_room["building"], "Engineering");
    }
}
