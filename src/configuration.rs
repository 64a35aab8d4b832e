use config::Config;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::*;

use crate::{error::ErrorWrapper, fleet::FleetSettings, map_context::MapSettings};

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub zenoh: ZenohConfig,
    #[serde(default)]
    pub fleet: FleetSettings,
    pub map: MapSettings,
}

impl AppConfig {
    pub fn load_config(config: &Option<PathBuf>) -> anyhow::Result<Self> {
        let settings = if let Some(config) = config {
            info!("Using configuration from {:?}", config);
            Config::builder()
                .add_source(config::File::with_name(
                    config
                        .to_str()
                        .ok_or_else(|| anyhow::anyhow!("Failed to convert path"))?,
                ))
                .add_source(config::Environment::with_prefix("APP").separator("__"))
                .build()?
        } else {
            info!("Using dev configuration");
            Config::builder()
                .add_source(config::File::with_name("config/settings"))
                .add_source(config::File::with_name("config/dev_settings").required(false))
                .add_source(config::Environment::with_prefix("APP").separator("__"))
                .build()?
        };

        Ok(settings.try_deserialize()?)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ZenohConfig {
    #[serde(default)]
    pub connect: Vec<zenoh_config::EndPoint>,
    #[serde(default)]
    pub listen: Vec<zenoh_config::EndPoint>,
    #[serde(default)]
    pub config_path: Option<String>,
}

impl ZenohConfig {
    pub fn get_zenoh_config(&self) -> anyhow::Result<zenoh::config::Config> {
        let mut config = if let Some(conf_file) = &self.config_path {
            zenoh::config::Config::from_file(conf_file).map_err(ErrorWrapper::ZenohError)?
        } else {
            zenoh::config::Config::default()
        };
        if !self.connect.is_empty() {
            config.connect.endpoints.clone_from(&self.connect);
        }
        if !self.listen.is_empty() {
            config.listen.endpoints.clone_from(&self.listen);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static DEFAULT_CONFIG: &str = include_str!("../config/settings.yaml");

    fn parse(text: &str) -> AppConfig {
        Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize::<AppConfig>()
            .unwrap()
    }

    #[test]
    fn test_config() {
        let config = parse(DEFAULT_CONFIG);
        assert_eq!(config.fleet, FleetSettings::default());
        assert_eq!(config.map.origin_lat, 35.0);
        config.zenoh.get_zenoh_config().unwrap();
    }

    #[test]
    fn fleet_section_is_optional() {
        let config = parse(
            r#"
map:
  path: maps/lanelet2_map.osm
  origin_lat: 35.2
  origin_lon: 139.1
fleet:
  bridge_ros2dds: false
"#,
        );
        assert!(!config.fleet.bridge_ros2dds);
        assert_eq!(config.fleet.discovery_attempts, 10);
        assert!(config.zenoh.connect.is_empty());
    }
}
