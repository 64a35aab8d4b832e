use crate::{
    bus::Bus,
    error::{FleetError, Result},
    geodesy::GeoPoint,
    map_context::{MapHandle, MapSettings},
    vehicle::{GoalCommand, GoalState, SessionSettings, VehicleId, VehicleSession, POSE_TOPIC},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;
use tracing::*;

/// Wildcard over the ros2 bridge admin space for every kinematics endpoint
pub const DISCOVERY_SELECTOR: &str = "@/**/ros2/**/api/vehicle/kinematics";
const PUBLISHER_MARKER: &str = "pub";
const RAW_TOPIC_SEGMENT: &str = "/rt";

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FleetSettings {
    pub bridge_ros2dds: bool,
    pub discovery_attempts: u32,
    pub query_timeout_ms: u64,
    pub engage_settle_delay_ms: u64,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            bridge_ros2dds: true,
            discovery_attempts: 10,
            query_timeout_ms: 10_000,
            engage_settle_delay_ms: 1_000,
        }
    }
}

impl FleetSettings {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            bridge_ros2dds: self.bridge_ros2dds,
            engage_settle_delay: Duration::from_millis(self.engage_settle_delay_ms),
        }
    }
}

/// Vehicle id of a discovery reply key, if the key belongs to a pose publisher.
///
/// Discovery always goes through the ros2dds admin space. `bridge_ros2dds` only changes the
/// topic prefix, so a namespace exposed as `<id>/rt` still yields `<id>`.
pub fn vehicle_id_from_key(key: &str) -> Option<&str> {
    if !key.contains(PUBLISHER_MARKER) {
        return None;
    }
    let end = key.find(POSE_TOPIC)?;
    let namespace = &key[..end];
    namespace
        .strip_suffix(RAW_TOPIC_SEGMENT)
        .unwrap_or(namespace)
        .rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehiclePose {
    pub id: VehicleId,
    pub lat: f64,
    pub lon: f64,
    pub heading: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pose_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleGoal {
    pub id: VehicleId,
    pub lat: f64,
    pub lon: f64,
}

enum VehicleSlot {
    Active(VehicleSession),
    /// session construction failed, kept so the id stays visible
    Failed(String),
}

/// Every vehicle the coordinator currently knows about.
///
/// Foreground operations hold the read lock for their whole duration, `reconcile` takes the
/// write lock, so no session is torn down while a goal or engage is in flight on it.
pub struct FleetRegistry {
    bus: Arc<dyn Bus>,
    map: MapHandle,
    settings: FleetSettings,
    vehicles: RwLock<BTreeMap<VehicleId, VehicleSlot>>,
}

impl FleetRegistry {
    pub fn new(bus: Arc<dyn Bus>, map: MapHandle, settings: FleetSettings) -> Self {
        Self {
            bus,
            map,
            settings,
            vehicles: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn map(&self) -> &MapHandle {
        &self.map
    }

    /// Best effort presence probe. Each attempt waits out a full query window.
    pub async fn discover(&self, attempts: u32) -> BTreeSet<VehicleId> {
        let mut discovered = BTreeSet::new();
        for attempt in 0..attempts {
            let replies = match self.bus.query(DISCOVERY_SELECTOR, None).await {
                Ok(replies) => replies,
                Err(err) => {
                    warn!(attempt, "Discovery query failed: {}", err);
                    continue;
                }
            };
            for reply in replies {
                if let Err(err) = &reply.payload {
                    trace!(key = %reply.key, "Skipping discovery error reply: {}", err);
                    continue;
                }
                if let Some(id) = vehicle_id_from_key(&reply.key) {
                    if discovered.insert(id.to_owned()) {
                        debug!(vehicle = id, attempt, "Found vehicle");
                    }
                }
            }
        }
        info!(count = discovered.len(), ?discovered, "Discovery finished");
        discovered
    }

    /// Replaces every session with fresh ones for `discovered`, carrying valid goals over.
    pub async fn reconcile(&self, discovered: BTreeSet<VehicleId>) {
        let mut vehicles = self.vehicles.write().await;

        let mut goal_backup: HashMap<VehicleId, GoalState> = HashMap::new();
        for (id, slot) in std::mem::take(&mut *vehicles) {
            if let VehicleSlot::Active(session) = slot {
                if let Some(goal) = session.state().valid_goal() {
                    goal_backup.insert(id, goal);
                }
                session.shutdown().await;
            }
        }

        let settings = self.settings.session_settings();
        let started = futures::future::join_all(discovered.into_iter().map(|id| {
            let bus = self.bus.clone();
            let map = self.map.clone();
            let settings = &settings;
            async move {
                let result = VehicleSession::start(&id, bus, map, settings).await;
                (id, result)
            }
        }))
        .await;

        for (id, result) in started {
            let slot = match result {
                Ok(session) => {
                    if let Some(goal) = goal_backup.remove(&id) {
                        info!(vehicle = %id, lat = goal.lat, lon = goal.lon, "Goal restored");
                        session.restore_goal(goal);
                    }
                    VehicleSlot::Active(session)
                }
                Err(err) => {
                    error!(vehicle = %id, "Failed to start vehicle session: {}", err);
                    VehicleSlot::Failed(err.to_string())
                }
            };
            vehicles.insert(id, slot);
        }

        let failed = vehicles
            .values()
            .filter(|slot| matches!(slot, VehicleSlot::Failed(_)))
            .count();
        info!(known = vehicles.len(), failed, "Fleet reconciled");
    }

    /// Discovery with the configured attempts followed by reconcile
    pub async fn rediscover(&self) -> Vec<VehicleId> {
        let discovered = self.discover(self.settings.discovery_attempts).await;
        self.reconcile(discovered).await;
        self.vehicle_ids().await
    }

    /// Known ids, including vehicles whose session failed to start
    pub async fn vehicle_ids(&self) -> Vec<VehicleId> {
        self.vehicles.read().await.keys().cloned().collect()
    }

    pub async fn poses(&self) -> Vec<VehiclePose> {
        self.vehicles
            .read()
            .await
            .iter()
            .filter_map(|(id, slot)| match slot {
                VehicleSlot::Active(session) => {
                    let state = session.state();
                    Some(VehiclePose {
                        id: id.clone(),
                        lat: state.geodetic_position.lat,
                        lon: state.geodetic_position.lon,
                        heading: state.heading,
                        last_pose_at: state.last_pose_at,
                    })
                }
                VehicleSlot::Failed(_) => None,
            })
            .collect()
    }

    /// Only vehicles with a valid goal
    pub async fn goals(&self) -> Vec<VehicleGoal> {
        self.vehicles
            .read()
            .await
            .iter()
            .filter_map(|(id, slot)| match slot {
                VehicleSlot::Active(session) => {
                    session.state().valid_goal().map(|goal| VehicleGoal {
                        id: id.clone(),
                        lat: goal.lat,
                        lon: goal.lon,
                    })
                }
                VehicleSlot::Failed(_) => None,
            })
            .collect()
    }

    pub async fn set_goal(&self, id: &str, lat: f64, lon: f64) -> Result<GoalCommand> {
        let vehicles = self.vehicles.read().await;
        let session = active_session(&vehicles, id).map_err(|err| {
            error!(vehicle = id, lat, lon, "Can't set goal: {}", err);
            err
        })?;
        session.set_goal(GeoPoint::new(lat, lon)).await
    }

    pub async fn engage(&self, id: &str) -> Result<()> {
        let vehicles = self.vehicles.read().await;
        let session = active_session(&vehicles, id).map_err(|err| {
            error!(vehicle = id, "Can't engage: {}", err);
            err
        })?;
        session.engage().await
    }

    /// Moves every session to a new map and origin. Goals are kept as they are.
    pub async fn switch_map(&self, settings: MapSettings) -> Result<()> {
        let map = self.map.clone();
        tokio::task::spawn_blocking(move || map.switch_map(settings)).await?
    }

    /// Undeclares every subscription and forgets all vehicles
    pub async fn shutdown(&self) {
        let mut vehicles = self.vehicles.write().await;
        for (_, slot) in std::mem::take(&mut *vehicles) {
            if let VehicleSlot::Active(session) = slot {
                session.shutdown().await;
            }
        }
    }
}

fn active_session<'a>(
    vehicles: &'a BTreeMap<VehicleId, VehicleSlot>,
    id: &str,
) -> Result<&'a VehicleSession> {
    match vehicles.get(id) {
        Some(VehicleSlot::Active(session)) => Ok(session),
        Some(VehicleSlot::Failed(reason)) => Err(FleetError::VehicleUnavailable {
            id: id.to_owned(),
            reason: reason.clone(),
        }),
        None => Err(FleetError::VehicleNotFound(id.to_owned())),
    }
}
