#![doc = include_str!("../README.md")]
pub mod bus;
pub mod configuration;
pub mod error;
pub mod fleet;
pub mod geodesy;
pub mod lane_map;
pub mod logging;
pub mod map_context;
pub mod messages;
pub mod vehicle;
