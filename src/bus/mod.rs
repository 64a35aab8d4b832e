pub mod rpc;
#[cfg(test)]
pub(crate) mod stub;
mod zenoh_bus;

pub use zenoh_bus::ZenohBus;

use crate::error::BusError;
use async_trait::async_trait;

/// Message delivered to a subscription handler
#[derive(Debug, Clone)]
pub struct BusSample {
    pub key: String,
    pub payload: Vec<u8>,
}

/// One answer to a query. Responders may answer with an error instead of a payload.
#[derive(Debug, Clone)]
pub struct BusReply {
    pub key: String,
    pub payload: std::result::Result<Vec<u8>, String>,
}

/// Called from the bus' own threads, possibly concurrently with other handlers
pub type SampleHandler = Box<dyn Fn(BusSample) + Send + Sync + 'static>;

/// Live subscription. Dropping it without undeclaring leaves cleanup to the bus.
#[async_trait]
pub trait Subscription: Send + Sync {
    fn key(&self) -> &str;

    async fn undeclare(self: Box<Self>) -> Result<(), BusError>;
}

/// The publish/subscribe/query primitives the fleet coordinator needs
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), BusError>;

    async fn subscribe(
        &self,
        key: &str,
        handler: SampleHandler,
    ) -> Result<Box<dyn Subscription>, BusError>;

    /// Sends a query and waits until the bus closes the reply window.
    /// `selector` may contain wildcards.
    async fn query(
        &self,
        selector: &str,
        payload: Option<Vec<u8>>,
    ) -> Result<Vec<BusReply>, BusError>;
}
