use crate::{
    error::Result,
    geodesy::{GeoPoint, UtmProjector},
    lane_map::{LaneIndex, LaneMapLoader},
};
use serde::Deserialize;
use std::{
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::*;

/// Which lane map is active and where its local frame is anchored
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct MapSettings {
    pub path: PathBuf,
    pub origin_lat: f64,
    pub origin_lon: f64,
}

impl MapSettings {
    pub fn new(path: impl Into<PathBuf>, origin_lat: f64, origin_lon: f64) -> Self {
        Self {
            path: path.into(),
            origin_lat,
            origin_lon,
        }
    }

    pub fn origin(&self) -> GeoPoint {
        GeoPoint::new(self.origin_lat, self.origin_lon)
    }
}

struct MapContext {
    settings: MapSettings,
    projector: UtmProjector,
    lane_index: Option<Arc<LaneIndex>>,
    /// bumped on every map switch so a load started before the switch is discarded
    version: u64,
}

/// Lane index together with the projector of the map it was built from
#[derive(Debug, Clone)]
pub struct LoadedMap {
    pub lane_index: Arc<LaneIndex>,
    pub projector: UtmProjector,
}

/// Map state shared by every vehicle session.
///
/// The projector is always available. The lane index is built on first use and rebuilt on
/// map switch. Goals held by vehicles are never touched by a switch.
#[derive(Clone)]
pub struct MapHandle {
    context: Arc<RwLock<MapContext>>,
    loader: Arc<dyn LaneMapLoader>,
}

impl MapHandle {
    pub fn new(settings: MapSettings, loader: Arc<dyn LaneMapLoader>) -> Result<Self> {
        let projector = UtmProjector::new(settings.origin())?;
        Ok(Self {
            context: Arc::new(RwLock::new(MapContext {
                settings,
                projector,
                lane_index: None,
                version: 0,
            })),
            loader,
        })
    }

    pub fn projector(&self) -> UtmProjector {
        self.context
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .projector
    }

    pub fn settings(&self) -> MapSettings {
        self.context
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .settings
            .clone()
    }

    pub fn lane_index_ready(&self) -> bool {
        self.context
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lane_index
            .is_some()
    }

    /// Returns the lane index of the active map, loading it if needed.
    ///
    /// Cheap once loaded. A failed load leaves the index empty so the next call retries. The
    /// returned projector is always the one the index was built with.
    pub fn ensure_lane_index(&self) -> Result<LoadedMap> {
        loop {
            let (version, settings, projector) = {
                let context = self.context.read().unwrap_or_else(PoisonError::into_inner);
                if let Some(lane_index) = &context.lane_index {
                    return Ok(LoadedMap {
                        lane_index: lane_index.clone(),
                        projector: context.projector,
                    });
                }
                (context.version, context.settings.clone(), context.projector)
            };

            // loading happens outside the lock so pose updates keep flowing
            let map = self.loader.load(&settings.path, &projector)?;
            let index = Arc::new(LaneIndex::new(map));

            let mut context = self.context.write().unwrap_or_else(PoisonError::into_inner);
            if context.version == version {
                let lane_index = context
                    .lane_index
                    .get_or_insert_with(|| {
                        info!(path = ?settings.path, "Lane index ready");
                        index
                    })
                    .clone();
                return Ok(LoadedMap {
                    lane_index,
                    projector,
                });
            }
            warn!(path = ?settings.path, "Map switched while loading, reloading");
        }
    }

    /// Moves to a new map and origin, then eagerly builds its lane index.
    ///
    /// An invalid origin leaves the current map untouched. A lane map that fails to load still
    /// switches the origin and is retried lazily.
    pub fn switch_map(&self, settings: MapSettings) -> Result<()> {
        let projector = UtmProjector::new(settings.origin())?;
        {
            let mut context = self.context.write().unwrap_or_else(PoisonError::into_inner);
            info!(
                from = ?context.settings.path,
                to = ?settings.path,
                origin_lat = settings.origin_lat,
                origin_lon = settings.origin_lon,
                "Switching map"
            );
            context.settings = settings;
            context.projector = projector;
            context.lane_index = None;
            context.version += 1;
        }
        if let Err(err) = self.ensure_lane_index() {
            error!("Failed to build lane index after map switch: {}", err);
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        error::FleetError,
        lane_map::{Lane, LaneMap},
    };
    use nalgebra as na;
    use std::{
        path::Path,
        sync::atomic::{AtomicUsize, Ordering},
    };

    /// Serves a fixed set of lanes, fails for paths containing "missing"
    #[derive(Default)]
    pub(crate) struct StaticLoader {
        pub lanes: Vec<Lane>,
        pub loads: AtomicUsize,
    }

    impl StaticLoader {
        pub fn straight_lane() -> Self {
            Self {
                lanes: vec![Lane {
                    id: 1,
                    centerline: vec![na::Point2::new(0.0, 0.0), na::Point2::new(10.0, 0.0)],
                }],
                loads: AtomicUsize::new(0),
            }
        }
    }

    impl LaneMapLoader for StaticLoader {
        fn load(&self, path: &Path, _projector: &UtmProjector) -> Result<LaneMap> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if path.to_string_lossy().contains("missing") {
                return Err(FleetError::MapLoad {
                    path: path.to_owned(),
                    reason: "not found".to_owned(),
                });
            }
            Ok(LaneMap::from_lanes(self.lanes.clone()))
        }
    }

    fn handle(path: &str) -> (MapHandle, Arc<StaticLoader>) {
        let loader = Arc::new(StaticLoader::straight_lane());
        let handle = MapHandle::new(MapSettings::new(path, 35.0, 139.0), loader.clone()).unwrap();
        (handle, loader)
    }

    #[test]
    fn lane_index_is_built_once() {
        let (handle, loader) = handle("map.osm");
        assert!(!handle.lane_index_ready());
        let first = handle.ensure_lane_index().unwrap();
        let second = handle.ensure_lane_index().unwrap();
        assert!(Arc::ptr_eq(&first.lane_index, &second.lane_index));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert!(handle.lane_index_ready());
    }

    #[test]
    fn failed_load_is_retried() {
        let (handle, loader) = handle("missing.osm");
        assert!(handle.ensure_lane_index().is_err());
        assert!(handle.ensure_lane_index().is_err());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
        assert!(!handle.lane_index_ready());
    }

    #[test]
    fn switch_rebuilds_index_and_projector() {
        let (handle, loader) = handle("map.osm");
        let before = handle.ensure_lane_index().unwrap();
        handle
            .switch_map(MapSettings::new("other.osm", 36.0, 140.0))
            .unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
        let after = handle.ensure_lane_index().unwrap();
        assert!(!Arc::ptr_eq(&before.lane_index, &after.lane_index));
        assert_eq!(after.projector.origin(), GeoPoint::new(36.0, 140.0));
        assert_eq!(handle.projector().origin(), GeoPoint::new(36.0, 140.0));
        assert_eq!(handle.settings().path, PathBuf::from("other.osm"));
    }

    #[test]
    fn invalid_origin_keeps_current_map() {
        let (handle, _loader) = handle("map.osm");
        handle.ensure_lane_index().unwrap();
        let result = handle.switch_map(MapSettings::new("other.osm", 95.0, 140.0));
        assert!(matches!(result, Err(FleetError::InvalidOrigin { .. })));
        assert!(handle.lane_index_ready());
        assert_eq!(handle.settings().path, PathBuf::from("map.osm"));
    }

    #[test]
    fn switch_to_unloadable_map_moves_origin() {
        let (handle, _loader) = handle("map.osm");
        let result = handle.switch_map(MapSettings::new("missing.osm", 36.0, 140.0));
        assert!(result.is_err());
        assert!(!handle.lane_index_ready());
        assert_eq!(handle.projector().origin(), GeoPoint::new(36.0, 140.0));
    }

    /// Switches the map from inside its first load, the way a concurrent switch would land
    #[derive(Default)]
    struct SwitchingLoader {
        handle: std::sync::Mutex<Option<MapHandle>>,
        loads: AtomicUsize,
    }

    impl LaneMapLoader for SwitchingLoader {
        fn load(&self, path: &Path, _projector: &UtmProjector) -> Result<LaneMap> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let handle = self.handle.lock().unwrap().take();
            if let Some(handle) = handle {
                handle
                    .switch_map(MapSettings::new("other.osm", 36.0, 140.0))
                    .unwrap();
            }
            let end = if path.to_string_lossy().contains("other") {
                na::Point2::new(0.0, 10.0)
            } else {
                na::Point2::new(10.0, 0.0)
            };
            Ok(LaneMap::from_lanes(vec![Lane {
                id: 1,
                centerline: vec![na::Point2::origin(), end],
            }]))
        }
    }

    #[test]
    fn switch_during_load_returns_index_of_new_map() {
        let loader = Arc::new(SwitchingLoader::default());
        let handle =
            MapHandle::new(MapSettings::new("map.osm", 35.0, 139.0), loader.clone()).unwrap();
        *loader.handle.lock().unwrap() = Some(handle.clone());

        let loaded = handle.ensure_lane_index().unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
        assert_eq!(loaded.projector.origin(), GeoPoint::new(36.0, 140.0));
        assert_eq!(
            loaded.lane_index.heading_at(0.0, 5.0).yaw(),
            Some(std::f64::consts::FRAC_PI_2)
        );
        assert!(Arc::ptr_eq(
            &loaded.lane_index,
            &handle.ensure_lane_index().unwrap().lane_index
        ));
    }
}
