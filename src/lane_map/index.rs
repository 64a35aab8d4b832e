use super::{Lane, LaneId, LaneMap};
use nalgebra as na;
use std::f64::consts::{FRAC_PI_2, PI};
use tracing::*;

/// Outcome of a heading lookup
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeadingResolution {
    Lane {
        lane_id: LaneId,
        /// index of the first centerline point of the winning segment
        segment: usize,
        /// radians
        yaw: f64,
        /// distance from the query point to the lane centerline
        distance: f64,
    },
    NoHeading,
}

impl HeadingResolution {
    pub fn yaw(&self) -> Option<f64> {
        match self {
            HeadingResolution::Lane { yaw, .. } => Some(*yaw),
            HeadingResolution::NoHeading => None,
        }
    }

    /// Rotation about the vertical axis, identity when no lane was found
    pub fn orientation(&self) -> na::UnitQuaternion<f64> {
        match self.yaw() {
            Some(yaw) => na::UnitQuaternion::from_axis_angle(&na::Vector3::z_axis(), yaw),
            None => na::UnitQuaternion::identity(),
        }
    }
}

/// In-memory lane geometry answering nearest lane heading queries.
///
/// Lookups are a linear scan over all lanes.
#[derive(Debug, Default)]
pub struct LaneIndex {
    lanes: Vec<Lane>,
}

impl LaneIndex {
    pub fn new(map: LaneMap) -> Self {
        Self { lanes: map.lanes }
    }

    /// True if at least one lane can produce a heading
    pub fn has_usable_lanes(&self) -> bool {
        self.lanes.iter().any(|lane| lane.centerline.len() >= 2)
    }

    /// Heading of the lane closest to the local point `(x, y)`
    pub fn heading_at(&self, x: f64, y: f64) -> HeadingResolution {
        let query = na::Point2::new(x, y);
        let mut closest_distance = f64::INFINITY;
        let mut resolution = HeadingResolution::NoHeading;

        for lane in &self.lanes {
            let distance = polyline_distance(&lane.centerline, &query);
            if distance >= closest_distance || lane.centerline.len() < 2 {
                continue;
            }
            if let Some((segment, yaw)) = closest_segment(&lane.centerline, &query) {
                closest_distance = distance;
                resolution = HeadingResolution::Lane {
                    lane_id: lane.id,
                    segment,
                    yaw,
                    distance,
                };
            }
        }

        match resolution {
            HeadingResolution::Lane {
                lane_id,
                yaw,
                distance,
                ..
            } => debug!(lane_id, yaw, distance, "Resolved lane heading"),
            HeadingResolution::NoHeading => warn!(x, y, "No lane found for heading"),
        }
        resolution
    }
}

/// Picks the segment nearest to `query` and returns its index and direction.
///
/// Segments whose endpoints enclose the query (`(q - p1) . (q - p2) < 0`) score with the
/// squared perpendicular distance, all others with the nearer endpoint distance.
fn closest_segment(centerline: &[na::Point2<f64>], query: &na::Point2<f64>) -> Option<(usize, f64)> {
    let mut best_distance = f64::INFINITY;
    let mut best = None;
    for (index, pair) in centerline.windows(2).enumerate() {
        let (from, to) = (pair[0], pair[1]);
        let direction = to - from;
        let length = direction.norm();
        if length == 0.0 {
            continue;
        }
        let distance = if (query - from).dot(&(query - to)) < 0.0 {
            let cross = direction.perp(&(query - from)) / length;
            cross * cross
        } else {
            na::distance(query, &from).min(na::distance(query, &to))
        };
        if distance < best_distance {
            best_distance = distance;
            best = Some((index, segment_yaw(&from, &to)));
        }
    }
    best
}

/// Direction of `from -> to` as `atan(dy / dx)` moved into the left half plane when `dx < 0`.
/// The result lies in `(-pi/2, 3pi/2]`.
fn segment_yaw(from: &na::Point2<f64>, to: &na::Point2<f64>) -> f64 {
    let dx = to.x - from.x;
    let dy = to.y - from.y;
    if dx == 0.0 {
        return FRAC_PI_2.copysign(dy);
    }
    let angle = (dy / dx).atan();
    if dx < 0.0 {
        angle + PI
    } else {
        angle
    }
}

fn polyline_distance(polyline: &[na::Point2<f64>], query: &na::Point2<f64>) -> f64 {
    match polyline {
        [] => f64::INFINITY,
        [single] => na::distance(single, query),
        _ => polyline
            .windows(2)
            .map(|pair| segment_distance(&pair[0], &pair[1], query))
            .fold(f64::INFINITY, f64::min),
    }
}

fn segment_distance(from: &na::Point2<f64>, to: &na::Point2<f64>, query: &na::Point2<f64>) -> f64 {
    let direction = to - from;
    let length_squared = direction.norm_squared();
    if length_squared == 0.0 {
        return na::distance(from, query);
    }
    let t = ((query - from).dot(&direction) / length_squared).clamp(0.0, 1.0);
    na::distance(&(from + direction * t), query)
}
