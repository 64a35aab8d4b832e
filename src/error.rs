use std::path::PathBuf;
use thiserror::Error;

/// Wraps errors that don't implement `std::error::Error` themselves
#[derive(Error, Debug)]
pub enum ErrorWrapper {
    #[error("zenoh error {0:?}")]
    ZenohError(zenoh::Error),
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus operation on {key:?} failed: {reason}")]
    Transport { key: String, reason: String },
    #[error("bus is closed")]
    Closed,
}

impl BusError {
    pub fn transport(key: &str, error: impl std::fmt::Display) -> Self {
        Self::Transport {
            key: key.to_owned(),
            reason: error.to_string(),
        }
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FleetError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("failed to decode {schema} from {key:?}: {source}")]
    Decode {
        schema: &'static str,
        key: String,
        source: cdr::Error,
    },
    #[error("failed to encode {schema}: {source}")]
    Encode {
        schema: &'static str,
        source: cdr::Error,
    },
    #[error("invalid map origin lat={lat} lon={lon}")]
    InvalidOrigin { lat: f64, lon: f64 },
    #[error("failed to load lane map {path:?}: {reason}")]
    MapLoad { path: PathBuf, reason: String },
    #[error("lane map {path:?} has no lane with a usable centerline")]
    EmptyLaneMap { path: PathBuf },
    #[error("vehicle {0:?} not found")]
    VehicleNotFound(String),
    #[error("vehicle {id:?} failed to initialize: {reason}")]
    VehicleUnavailable { id: String, reason: String },
    #[error("no responder on {key:?}")]
    NoResponder { key: String },
    #[error("request on {key:?} rejected with code {code}: {message}")]
    Rejected {
        key: String,
        code: u16,
        message: String,
    },
    #[error("setting goal lat={lat} lon={lon} for vehicle {vehicle:?} failed: {source}")]
    Goal {
        vehicle: String,
        lat: f64,
        lon: f64,
        source: Box<FleetError>,
    },
    #[error("map task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("engaging vehicle {vehicle:?} failed: {source}")]
    Engage {
        vehicle: String,
        source: Box<FleetError>,
    },
}

pub type Result<T, E = FleetError> = std::result::Result<T, E>;
