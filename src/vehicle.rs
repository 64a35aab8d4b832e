use crate::{
    bus::{
        rpc::{self, Decoded},
        Bus, BusSample, Subscription,
    },
    error::{FleetError, Result},
    geodesy::{GeoPoint, UtmProjector},
    lane_map::HeadingResolution,
    map_context::MapHandle,
    messages::{
        ChangeOperationModeResponse, ClearRouteResponse, GateMode, Header, Point, Pose, Route,
        RouteOption, Schema, ServiceResponse, SetRoutePointsRequest, SetRoutePointsResponse,
        VehicleKinematics,
    },
};
use chrono::{DateTime, Utc};
use nalgebra as na;
use serde::Serialize;
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::*;

pub type VehicleId = String;

pub const POSE_TOPIC: &str = "/api/vehicle/kinematics";
pub const ROUTE_TOPIC: &str = "/api/routing/route";
pub const CLEAR_ROUTE_TOPIC: &str = "/api/routing/clear_route";
pub const SET_ROUTE_POINTS_TOPIC: &str = "/api/routing/set_route_points";
pub const CHANGE_TO_AUTONOMOUS_TOPIC: &str = "/api/operation_mode/change_to_autonomous";
pub const GATE_MODE_TOPIC: &str = "/control/gate_mode_cmd";

/// Key expressions of one vehicle's namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleTopics {
    prefix: String,
}

impl VehicleTopics {
    /// Without the ros2dds bridge the namespace is exposed under `<id>/rt`
    pub fn new(id: &str, bridge_ros2dds: bool) -> Self {
        let prefix = if bridge_ros2dds {
            id.to_owned()
        } else {
            format!("{id}/rt")
        };
        Self { prefix }
    }

    fn topic(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    pub fn pose(&self) -> String {
        self.topic(POSE_TOPIC)
    }

    pub fn route(&self) -> String {
        self.topic(ROUTE_TOPIC)
    }

    pub fn clear_route(&self) -> String {
        self.topic(CLEAR_ROUTE_TOPIC)
    }

    pub fn set_route_points(&self) -> String {
        self.topic(SET_ROUTE_POINTS_TOPIC)
    }

    pub fn change_to_autonomous(&self) -> String {
        self.topic(CHANGE_TO_AUTONOMOUS_TOPIC)
    }

    pub fn gate_mode(&self) -> String {
        self.topic(GATE_MODE_TOPIC)
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub bridge_ros2dds: bool,
    /// wait between the gate mode command and the operation mode change
    pub engage_settle_delay: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            bridge_ros2dds: true,
            engage_settle_delay: Duration::from_secs(1),
        }
    }
}

/// Goal last echoed by the vehicle. `valid == false` means no single goal is known.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct GoalState {
    pub local_x: f64,
    pub local_y: f64,
    pub lat: f64,
    pub lon: f64,
    pub valid: bool,
}

impl GoalState {
    fn from_local(local: na::Point2<f64>, projector: &UtmProjector) -> Self {
        let geo = projector.reverse(local);
        Self {
            local_x: local.x,
            local_y: local.y,
            lat: geo.lat,
            lon: geo.lon,
            valid: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VehicleState {
    pub local_position: na::Point2<f64>,
    pub geodetic_position: GeoPoint,
    /// degrees, counter clockwise from the local x axis
    pub heading: f64,
    pub goal: GoalState,
    pub last_pose_at: Option<DateTime<Utc>>,
}

impl VehicleState {
    pub fn valid_goal(&self) -> Option<GoalState> {
        Some(self.goal).filter(|goal| goal.valid)
    }
}

/// Derived pose of one kinematics message
#[derive(Debug, Clone, Copy, PartialEq)]
struct PoseUpdate {
    local: na::Point2<f64>,
    geodetic: GeoPoint,
    heading: f64,
}

impl PoseUpdate {
    fn from_kinematics(kinematics: &VehicleKinematics, projector: &UtmProjector) -> Self {
        let pose = &kinematics.pose.pose.pose;
        let local = na::Point2::new(pose.position.x, pose.position.y);

        // the pose source uses the opposite quaternion sign convention
        let qx = -pose.orientation.x;
        let qy = -pose.orientation.y;
        let qz = -pose.orientation.z;
        let qw = -pose.orientation.w;
        let siny_cosp = 2.0 * (qw * qz + qx * qy);
        let cosy_cosp = 1.0 - 2.0 * (qy * qy + qz * qz);

        Self {
            local,
            geodetic: projector.reverse(local),
            heading: siny_cosp.atan2(cosy_cosp).to_degrees(),
        }
    }
}

/// Goal implied by a route echo. Only single entry routes carry a goal.
fn goal_from_route(route: &Route, projector: &UtmProjector) -> Option<GoalState> {
    match route.data.as_slice() {
        [single] => {
            let position = single.goal.position;
            Some(GoalState::from_local(
                na::Point2::new(position.x, position.y),
                projector,
            ))
        }
        _ => None,
    }
}

/// What a successful `set_goal` sent to the vehicle
#[derive(Debug, Clone, Copy)]
pub struct GoalCommand {
    pub local: na::Point2<f64>,
    pub heading: HeadingResolution,
}

/// Live connection to one vehicle.
///
/// Pose and route subscriptions update the shared state from bus threads. Each update
/// replaces the derived fields under one lock so readers never see a half applied pose.
pub struct VehicleSession {
    id: VehicleId,
    topics: VehicleTopics,
    bus: Arc<dyn Bus>,
    map: MapHandle,
    state: Arc<Mutex<VehicleState>>,
    subscriptions: AsyncMutex<Vec<Box<dyn Subscription>>>,
    engage_settle_delay: Duration,
}

impl VehicleSession {
    pub async fn start(
        id: &str,
        bus: Arc<dyn Bus>,
        map: MapHandle,
        settings: &SessionSettings,
    ) -> Result<Self> {
        let topics = VehicleTopics::new(id, settings.bridge_ros2dds);
        let state = Arc::new(Mutex::new(VehicleState::default()));

        let pose_subscription = bus
            .subscribe(&topics.pose(), {
                let state = state.clone();
                let map = map.clone();
                let vehicle = id.to_owned();
                Box::new(move |sample: BusSample| on_pose(&vehicle, &state, &map, sample))
            })
            .await?;

        let route_subscription = bus
            .subscribe(&topics.route(), {
                let state = state.clone();
                let map = map.clone();
                let vehicle = id.to_owned();
                Box::new(move |sample: BusSample| on_route(&vehicle, &state, &map, sample))
            })
            .await;
        let route_subscription = match route_subscription {
            Ok(subscription) => subscription,
            Err(err) => {
                if let Err(undeclare_err) = pose_subscription.undeclare().await {
                    warn!(vehicle = id, "Failed to undeclare pose subscription: {}", undeclare_err);
                }
                return Err(err.into());
            }
        };

        info!(vehicle = id, "Vehicle session started");
        Ok(Self {
            id: id.to_owned(),
            topics,
            bus,
            map,
            state,
            subscriptions: AsyncMutex::new(vec![pose_subscription, route_subscription]),
            engage_settle_delay: settings.engage_settle_delay,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> VehicleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Puts back a goal carried over from a previous session
    pub fn restore_goal(&self, goal: GoalState) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).goal = goal;
    }

    /// Undeclares all subscriptions. State updates stop once this returns.
    pub async fn shutdown(&self) {
        let subscriptions: Vec<_> = self.subscriptions.lock().await.drain(..).collect();
        for subscription in subscriptions {
            let key = subscription.key().to_owned();
            if let Err(err) = subscription.undeclare().await {
                warn!(vehicle = %self.id, key, "Failed to undeclare subscription: {}", err);
            }
        }
        debug!(vehicle = %self.id, "Vehicle session shut down");
    }

    /// Clears the current route and routes to `target`, oriented along the nearest lane.
    ///
    /// Not atomic: a failure after the clear leaves the vehicle without a route.
    pub async fn set_goal(&self, target: GeoPoint) -> Result<GoalCommand> {
        match self.route_to(target).await {
            Ok(command) => {
                info!(
                    vehicle = %self.id,
                    lat = target.lat,
                    lon = target.lon,
                    "Goal set successfully"
                );
                Ok(command)
            }
            Err(err) => {
                error!(
                    vehicle = %self.id,
                    lat = target.lat,
                    lon = target.lon,
                    "Error setting goal: {}",
                    err
                );
                Err(FleetError::Goal {
                    vehicle: self.id.clone(),
                    lat: target.lat,
                    lon: target.lon,
                    source: Box::new(err),
                })
            }
        }
    }

    async fn route_to(&self, target: GeoPoint) -> Result<GoalCommand> {
        let map = self.map.clone();
        let loaded = tokio::task::spawn_blocking(move || map.ensure_lane_index()).await??;
        if !loaded.lane_index.has_usable_lanes() {
            return Err(FleetError::EmptyLaneMap {
                path: self.map.settings().path,
            });
        }

        rpc::call::<ClearRouteResponse>(&*self.bus, &self.topics.clear_route(), None)
            .await?;

        let local = loaded.projector.forward(target);
        let heading = loaded.lane_index.heading_at(local.x, local.y);
        let request = SetRoutePointsRequest {
            header: Header::map_frame(),
            option: RouteOption {
                allow_goal_modification: false,
            },
            goal: Pose {
                position: Point {
                    x: local.x,
                    y: local.y,
                    z: 0.0,
                },
                orientation: heading.orientation().into(),
            },
            waypoints: vec![],
        };

        let key = self.topics.set_route_points();
        let responses = rpc::call::<SetRoutePointsResponse>(
            &*self.bus,
            &key,
            Some(request.encode()?),
        )
        .await?;
        accepted(&key, &responses)?;
        Ok(GoalCommand { local, heading })
    }

    /// Switches the vehicle gate to autonomous, then requests autonomous operation mode.
    pub async fn engage(&self) -> Result<()> {
        match self.engage_sequence().await {
            Ok(()) => {
                info!(vehicle = %self.id, "Vehicle engaged");
                Ok(())
            }
            Err(err) => {
                error!(vehicle = %self.id, "Error engaging: {}", err);
                Err(FleetError::Engage {
                    vehicle: self.id.clone(),
                    source: Box::new(err),
                })
            }
        }
    }

    async fn engage_sequence(&self) -> Result<()> {
        self.bus
            .publish(&self.topics.gate_mode(), GateMode::auto().encode()?)
            .await?;

        // give the gate mode time to reach the vehicle before the mode change
        tokio::time::sleep(self.engage_settle_delay).await;

        let key = self.topics.change_to_autonomous();
        let responses =
            rpc::call::<ChangeOperationModeResponse>(&*self.bus, &key, None).await?;
        accepted(&key, &responses)
    }
}

/// Fails when nobody answered or every responder refused
fn accepted<T: ServiceResponse>(key: &str, responses: &[Decoded<T>]) -> Result<()> {
    if responses.is_empty() {
        return Err(FleetError::NoResponder {
            key: key.to_owned(),
        });
    }
    if responses.iter().any(|response| response.message.status().success) {
        return Ok(());
    }
    let status = responses[0].message.status();
    Err(FleetError::Rejected {
        key: key.to_owned(),
        code: status.code,
        message: status.message.clone(),
    })
}

fn on_pose(vehicle: &str, state: &Mutex<VehicleState>, map: &MapHandle, sample: BusSample) {
    let kinematics = match VehicleKinematics::decode(&sample.key, &sample.payload) {
        Ok(kinematics) => kinematics,
        Err(err) => {
            warn!(vehicle, "Dropping pose update: {}", err);
            return;
        }
    };
    let update = PoseUpdate::from_kinematics(&kinematics, &map.projector());
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    state.local_position = update.local;
    state.geodetic_position = update.geodetic;
    state.heading = update.heading;
    state.last_pose_at = Some(Utc::now());
}

fn on_route(vehicle: &str, state: &Mutex<VehicleState>, map: &MapHandle, sample: BusSample) {
    let route = match Route::decode(&sample.key, &sample.payload) {
        Ok(route) => route,
        Err(err) => {
            warn!(vehicle, "Dropping route update: {}", err);
            return;
        }
    };
    let goal = goal_from_route(&route, &map.projector());
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    match goal {
        Some(goal) => {
            info!(vehicle, lat = goal.lat, lon = goal.lon, "Echo back goal pose");
            state.goal = goal;
        }
        None => {
            debug!(vehicle, entries = route.data.len(), "Route without a single goal");
            state.goal.valid = false;
        }
    }
}
