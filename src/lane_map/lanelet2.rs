use super::{Lane, LaneMap, LaneMapLoader};
use crate::{
    error::{FleetError, Result},
    geodesy::{GeoPoint, UtmProjector},
};
use nalgebra as na;
use std::{collections::HashMap, path::Path};
use tracing::*;

/// Reads lanelet2 maps stored as OSM XML.
///
/// Nodes are projected with the supplied projector, ways become line strings and relations
/// tagged `type=lanelet` become lanes. A lane uses its `centerline` member when the map has one,
/// otherwise the centerline is interpolated between the `left` and `right` bounds.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lanelet2Loader;

impl LaneMapLoader for Lanelet2Loader {
    fn load(&self, path: &Path, projector: &UtmProjector) -> Result<LaneMap> {
        let text = std::fs::read_to_string(path).map_err(|error| FleetError::MapLoad {
            path: path.to_owned(),
            reason: error.to_string(),
        })?;
        let map = parse_osm(&text, projector).map_err(|reason| FleetError::MapLoad {
            path: path.to_owned(),
            reason,
        })?;
        info!(
            ?path,
            points = map.points.len(),
            line_strings = map.line_strings.len(),
            lanes = map.lanes.len(),
            "Loaded lanelet2 map"
        );
        Ok(map)
    }
}

fn parse_osm(text: &str, projector: &UtmProjector) -> std::result::Result<LaneMap, String> {
    let document = roxmltree::Document::parse(text).map_err(|error| error.to_string())?;
    let root = document.root_element();
    let mut map = LaneMap::default();

    for node in root.children().filter(|n| n.has_tag_name("node")) {
        let id = parse_attribute::<i64>(&node, "id")?;
        let lat = parse_attribute::<f64>(&node, "lat")?;
        let lon = parse_attribute::<f64>(&node, "lon")?;
        map.points
            .insert(id, projector.forward(GeoPoint::new(lat, lon)));
    }

    for way in root.children().filter(|n| n.has_tag_name("way")) {
        let id = parse_attribute::<i64>(&way, "id")?;
        let points = way
            .children()
            .filter(|n| n.has_tag_name("nd"))
            .map(|nd| {
                let reference = parse_attribute::<i64>(&nd, "ref")?;
                map.points
                    .get(&reference)
                    .copied()
                    .ok_or_else(|| format!("way {id} references unknown node {reference}"))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        map.line_strings.insert(id, points);
    }

    for relation in root.children().filter(|n| n.has_tag_name("relation")) {
        let is_lanelet = relation
            .children()
            .filter(|n| n.has_tag_name("tag"))
            .any(|tag| tag.attribute("k") == Some("type") && tag.attribute("v") == Some("lanelet"));
        if !is_lanelet {
            continue;
        }
        let id = parse_attribute::<i64>(&relation, "id")?;
        let mut members: HashMap<&str, i64> = HashMap::new();
        for member in relation.children().filter(|n| n.has_tag_name("member")) {
            if member.attribute("type") != Some("way") {
                continue;
            }
            if let Some(role) = member.attribute("role") {
                members.insert(role, parse_attribute::<i64>(&member, "ref")?);
            }
        }

        let lines = &map.line_strings;
        let centerline = match (
            member_line(lines, &members, "centerline", id)?,
            member_line(lines, &members, "left", id)?,
            member_line(lines, &members, "right", id)?,
        ) {
            (Some(centerline), _, _) => centerline.to_vec(),
            (None, Some(left), Some(right)) => interpolate_centerline(left, right),
            _ => {
                warn!(id, "Lanelet without bounds, skipping");
                continue;
            }
        };
        map.lanes.push(Lane { id, centerline });
    }

    Ok(map)
}

fn member_line<'m>(
    lines: &'m HashMap<i64, Vec<na::Point2<f64>>>,
    members: &HashMap<&str, i64>,
    role: &str,
    lanelet: i64,
) -> std::result::Result<Option<&'m [na::Point2<f64>]>, String> {
    match members.get(role) {
        Some(way) => lines
            .get(way)
            .map(|line| Some(line.as_slice()))
            .ok_or_else(|| format!("lanelet {lanelet} references unknown way {way}")),
        None => Ok(None),
    }
}

fn parse_attribute<T: std::str::FromStr>(
    node: &roxmltree::Node,
    name: &str,
) -> std::result::Result<T, String> {
    let value = node
        .attribute(name)
        .ok_or_else(|| format!("<{}> is missing attribute {name:?}", node.tag_name().name()))?;
    value
        .parse()
        .map_err(|_| format!("invalid {name:?} value {value:?}"))
}

/// Average of both bounds sampled at equal arc length fractions
fn interpolate_centerline(
    left: &[na::Point2<f64>],
    right: &[na::Point2<f64>],
) -> Vec<na::Point2<f64>> {
    if left.is_empty() || right.is_empty() {
        return vec![];
    }
    let samples = left.len().max(right.len()).max(2);
    (0..samples)
        .map(|i| {
            let fraction = i as f64 / (samples - 1) as f64;
            na::center(
                &sample_polyline(left, fraction),
                &sample_polyline(right, fraction),
            )
        })
        .collect()
}

fn sample_polyline(polyline: &[na::Point2<f64>], fraction: f64) -> na::Point2<f64> {
    let total: f64 = polyline
        .windows(2)
        .map(|pair| na::distance(&pair[0], &pair[1]))
        .sum();
    if total == 0.0 {
        return polyline[0];
    }
    let mut remaining = fraction * total;
    for pair in polyline.windows(2) {
        let length = na::distance(&pair[0], &pair[1]);
        if remaining <= length && length > 0.0 {
            return pair[0] + (pair[1] - pair[0]) * (remaining / length);
        }
        remaining -= length;
    }
    polyline[polyline.len() - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lane_map::{HeadingResolution, LaneIndex};
    use approx::assert_relative_eq;
    use std::io::Write;

    fn projector() -> UtmProjector {
        UtmProjector::new(GeoPoint::new(35.0, 139.0)).unwrap()
    }

    fn osm_node(projector: &UtmProjector, id: i64, x: f64, y: f64) -> String {
        let geo = projector.reverse(na::Point2::new(x, y));
        format!(
            r#"<node id="{id}" lat="{:.12}" lon="{:.12}"><tag k="ele" v="0"/></node>"#,
            geo.lat, geo.lon
        )
    }

    fn two_lane_osm(projector: &UtmProjector) -> String {
        let nodes = [
            osm_node(projector, 1, 0.0, 1.5),
            osm_node(projector, 2, 20.0, 1.5),
            osm_node(projector, 3, 0.0, -1.5),
            osm_node(projector, 4, 10.0, -1.5),
            osm_node(projector, 5, 20.0, -1.5),
            osm_node(projector, 6, 0.0, 10.0),
            osm_node(projector, 7, -20.0, 10.0),
        ]
        .join("\n");
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<osm generator="test" version="0.6">
{nodes}
<way id="10"><nd ref="1"/><nd ref="2"/><tag k="type" v="line_thin"/></way>
<way id="11"><nd ref="3"/><nd ref="4"/><nd ref="5"/><tag k="type" v="line_thin"/></way>
<way id="12"><nd ref="6"/><nd ref="7"/></way>
<relation id="100">
  <member type="way" role="left" ref="10"/>
  <member type="way" role="right" ref="11"/>
  <tag k="type" v="lanelet"/>
  <tag k="subtype" v="road"/>
</relation>
<relation id="101">
  <member type="way" role="left" ref="10"/>
  <member type="way" role="right" ref="11"/>
  <member type="way" role="centerline" ref="12"/>
  <tag k="type" v="lanelet"/>
</relation>
<relation id="200">
  <member type="way" role="refers" ref="10"/>
  <tag k="type" v="regulatory_element"/>
</relation>
</osm>"#
        )
    }

    #[test]
    fn parses_points_ways_and_lanelets() {
        let projector = projector();
        let map = parse_osm(&two_lane_osm(&projector), &projector).unwrap();
        assert_eq!(map.points.len(), 7);
        assert_eq!(map.line_strings.len(), 3);
        assert_eq!(map.lanes.len(), 2);

        let point = map.points[&4];
        assert_relative_eq!(point.x, 10.0, epsilon = 1e-3);
        assert_relative_eq!(point.y, -1.5, epsilon = 1e-3);
    }

    #[test]
    fn centerline_between_bounds() {
        let projector = projector();
        let map = parse_osm(&two_lane_osm(&projector), &projector).unwrap();
        let lane = map.lanes.iter().find(|lane| lane.id == 100).unwrap();
        assert_eq!(lane.centerline.len(), 3);
        assert_relative_eq!(lane.centerline[0].x, 0.0, epsilon = 1e-3);
        assert_relative_eq!(lane.centerline[1].x, 10.0, epsilon = 1e-3);
        assert_relative_eq!(lane.centerline[2].x, 20.0, epsilon = 1e-3);
        for point in &lane.centerline {
            assert_relative_eq!(point.y, 0.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn explicit_centerline_is_preferred() {
        let projector = projector();
        let map = parse_osm(&two_lane_osm(&projector), &projector).unwrap();
        let lane = map.lanes.iter().find(|lane| lane.id == 101).unwrap();
        assert_eq!(lane.centerline.len(), 2);
        assert_relative_eq!(lane.centerline[1].x, -20.0, epsilon = 1e-3);
    }

    #[test]
    fn loaded_map_resolves_heading() {
        let projector = projector();
        let mut file = std::env::temp_dir();
        file.push(format!("fleet_pose_lanelet2_{}.osm", std::process::id()));
        std::fs::File::create(&file)
            .unwrap()
            .write_all(two_lane_osm(&projector).as_bytes())
            .unwrap();

        let map = Lanelet2Loader.load(&file, &projector).unwrap();
        std::fs::remove_file(&file).unwrap();
        let index = LaneIndex::new(map);
        match index.heading_at(12.0, 0.3) {
            HeadingResolution::Lane { lane_id, yaw, .. } => {
                assert_eq!(lane_id, 100);
                assert_relative_eq!(yaw, 0.0, epsilon = 1e-3);
            }
            HeadingResolution::NoHeading => panic!("expected a lane"),
        }
        match index.heading_at(-15.0, 9.0) {
            HeadingResolution::Lane { lane_id, yaw, .. } => {
                assert_eq!(lane_id, 101);
                assert_relative_eq!(yaw, std::f64::consts::PI, epsilon = 1e-3);
            }
            HeadingResolution::NoHeading => panic!("expected a lane"),
        }
    }

    #[test]
    fn missing_file_is_a_map_error() {
        let error = Lanelet2Loader
            .load(Path::new("/nonexistent/lanelet2_map.osm"), &projector())
            .unwrap_err();
        assert!(matches!(error, FleetError::MapLoad { .. }));
    }

    #[test]
    fn dangling_node_reference_fails() {
        let text = r#"<osm><way id="1"><nd ref="99"/></way></osm>"#;
        let error = parse_osm(text, &projector()).unwrap_err();
        assert!(error.contains("unknown node 99"));
    }
}
