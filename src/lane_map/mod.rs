mod index;
mod lanelet2;

pub use index::{HeadingResolution, LaneIndex};
pub use lanelet2::Lanelet2Loader;

use crate::{error::Result, geodesy::UtmProjector};
use nalgebra as na;
use std::{collections::HashMap, path::Path};

pub type PointId = i64;
pub type LineId = i64;
pub type LaneId = i64;

/// Lane corridor reduced to what heading resolution needs
#[derive(Debug, Clone)]
pub struct Lane {
    pub id: LaneId,
    pub centerline: Vec<na::Point2<f64>>,
}

/// Lane level map geometry in the local frame
#[derive(Debug, Clone, Default)]
pub struct LaneMap {
    pub points: HashMap<PointId, na::Point2<f64>>,
    pub line_strings: HashMap<LineId, Vec<na::Point2<f64>>>,
    pub lanes: Vec<Lane>,
}

impl LaneMap {
    /// Map with only lanes, used when geometry doesn't come from a file
    pub fn from_lanes(lanes: Vec<Lane>) -> Self {
        Self {
            lanes,
            ..Default::default()
        }
    }
}

/// Source of lane level geometry
pub trait LaneMapLoader: Send + Sync {
    fn load(&self, path: &Path, projector: &UtmProjector) -> Result<LaneMap>;
}
