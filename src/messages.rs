//! Autoware AD API message schemas as they travel over the ros2dds bridge (CDR, little endian).

use crate::error::{FleetError, Result};
use cdr::{CdrLe, Infinite};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Row major 6x6 covariance. Nested fixed arrays keep the CDR layout of `float64[36]`.
pub type Covariance = [[f64; 6]; 6];

/// A message with a fixed CDR schema
pub trait Schema: Serialize + DeserializeOwned {
    const NAME: &'static str;

    fn encode(&self) -> Result<Vec<u8>> {
        cdr::serialize::<_, _, CdrLe>(self, Infinite).map_err(|source| FleetError::Encode {
            schema: Self::NAME,
            source,
        })
    }

    fn decode(key: &str, payload: &[u8]) -> Result<Self> {
        cdr::deserialize::<Self>(payload).map_err(|source| FleetError::Decode {
            schema: Self::NAME,
            key: key.to_owned(),
            source,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Time {
    pub sec: i32,
    pub nanosec: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Header {
    pub stamp: Time,
    pub frame_id: String,
}

impl Header {
    pub fn map_frame() -> Self {
        Self {
            stamp: Time::default(),
            frame_id: "map".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        }
    }
}

impl From<nalgebra::UnitQuaternion<f64>> for Quaternion {
    fn from(rotation: nalgebra::UnitQuaternion<f64>) -> Self {
        Self {
            x: rotation.i,
            y: rotation.j,
            z: rotation.k,
            w: rotation.w,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub position: Point,
    pub orientation: Quaternion,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PoseWithCovariance {
    pub pose: Pose,
    pub covariance: Covariance,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PoseWithCovarianceStamped {
    pub header: Header,
    pub pose: PoseWithCovariance,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Twist {
    pub linear: Vector3,
    pub angular: Vector3,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TwistWithCovariance {
    pub twist: Twist,
    pub covariance: Covariance,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TwistWithCovarianceStamped {
    pub header: Header,
    pub twist: TwistWithCovariance,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Accel {
    pub linear: Vector3,
    pub angular: Vector3,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AccelWithCovariance {
    pub accel: Accel,
    pub covariance: Covariance,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AccelWithCovarianceStamped {
    pub header: Header,
    pub accel: AccelWithCovariance,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoPointMsg {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoPointStamped {
    pub header: Header,
    pub position: GeoPointMsg,
}

/// `autoware_adapi_v1_msgs/msg/VehicleKinematics`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VehicleKinematics {
    pub geographic_pose: GeoPointStamped,
    pub pose: PoseWithCovarianceStamped,
    pub twist: TwistWithCovarianceStamped,
    pub accel: AccelWithCovarianceStamped,
}

impl Schema for VehicleKinematics {
    const NAME: &'static str = "VehicleKinematics";
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RoutePrimitive {
    pub id: i64,
    #[serde(rename = "type")]
    pub primitive_type: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RouteSegment {
    pub preferred: RoutePrimitive,
    pub alternatives: Vec<RoutePrimitive>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RouteData {
    pub start: Pose,
    pub goal: Pose,
    pub segments: Vec<RouteSegment>,
}

/// `autoware_adapi_v1_msgs/msg/Route`. Autoware publishes at most one entry, an empty
/// sequence means no route.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Route {
    pub header: Header,
    pub data: Vec<RouteData>,
}

impl Schema for Route {
    const NAME: &'static str = "Route";
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RouteOption {
    pub allow_goal_modification: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SetRoutePointsRequest {
    pub header: Header,
    pub option: RouteOption,
    pub goal: Pose,
    pub waypoints: Vec<Pose>,
}

impl Schema for SetRoutePointsRequest {
    const NAME: &'static str = "SetRoutePointsRequest";
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResponseStatus {
    pub success: bool,
    pub code: u16,
    pub message: String,
}

/// Implemented by every service response that carries a `ResponseStatus`
pub trait ServiceResponse: Schema {
    fn status(&self) -> &ResponseStatus;
}

macro_rules! service_response {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
        pub struct $name {
            pub status: ResponseStatus,
        }

        impl Schema for $name {
            const NAME: &'static str = stringify!($name);
        }

        impl ServiceResponse for $name {
            fn status(&self) -> &ResponseStatus {
                &self.status
            }
        }
    };
}

service_response!(ClearRouteResponse);
service_response!(SetRoutePointsResponse);
service_response!(ChangeOperationModeResponse);

/// `tier4_control_msgs/msg/GateMode`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateMode {
    pub data: u8,
}

impl GateMode {
    pub const AUTO: u8 = 0;
    pub const EXTERNAL: u8 = 1;

    pub fn auto() -> Self {
        Self { data: Self::AUTO }
    }
}

impl Schema for GateMode {
    const NAME: &'static str = "GateMode";
}
