use super::{Bus, BusReply, BusSample, SampleHandler, Subscription};
use crate::error::{BusError, ErrorWrapper};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::*;
use zenoh::{prelude::r#async::*, subscriber::Subscriber, Session, SessionDeclarations};

/// `Bus` backed by a zenoh session
pub struct ZenohBus {
    session: Arc<Session>,
    query_timeout: Duration,
}

impl ZenohBus {
    pub fn new(session: Arc<Session>, query_timeout: Duration) -> Self {
        Self {
            session,
            query_timeout,
        }
    }

    pub async fn open(config: zenoh::config::Config, query_timeout: Duration) -> anyhow::Result<Self> {
        let session = zenoh::open(config)
            .res()
            .await
            .map_err(ErrorWrapper::ZenohError)?
            .into_arc();
        info!(zid = %session.zid(), "Zenoh session open");
        Ok(Self::new(session, query_timeout))
    }
}

struct ZenohSubscription {
    key: String,
    subscriber: Subscriber<'static, ()>,
}

#[async_trait]
impl Subscription for ZenohSubscription {
    fn key(&self) -> &str {
        &self.key
    }

    async fn undeclare(self: Box<Self>) -> Result<(), BusError> {
        let key = self.key;
        self.subscriber
            .undeclare()
            .res()
            .await
            .map_err(|err| BusError::transport(&key, ErrorWrapper::ZenohError(err)))
    }
}

#[async_trait]
impl Bus for ZenohBus {
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.session
            .put(key, payload)
            .res()
            .await
            .map_err(|err| BusError::transport(key, ErrorWrapper::ZenohError(err)))
    }

    async fn subscribe(
        &self,
        key: &str,
        handler: SampleHandler,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let subscriber = self
            .session
            .declare_subscriber(key.to_owned())
            .callback(move |sample: Sample| {
                handler(BusSample {
                    key: sample.key_expr.as_str().to_owned(),
                    payload: sample.value.payload.contiguous().into_owned(),
                })
            })
            .res()
            .await
            .map_err(|err| BusError::transport(key, ErrorWrapper::ZenohError(err)))?;
        trace!(key, "Declared subscriber");
        Ok(Box::new(ZenohSubscription {
            key: key.to_owned(),
            subscriber,
        }))
    }

    async fn query(
        &self,
        selector: &str,
        payload: Option<Vec<u8>>,
    ) -> Result<Vec<BusReply>, BusError> {
        let mut request = self.session.get(selector).timeout(self.query_timeout);
        if let Some(payload) = payload {
            request = request.with_value(payload);
        }
        let receiver = request
            .res()
            .await
            .map_err(|err| BusError::transport(selector, ErrorWrapper::ZenohError(err)))?;

        let mut replies = vec![];
        while let Ok(reply) = receiver.recv_async().await {
            replies.push(match reply.sample {
                Ok(sample) => BusReply {
                    key: sample.key_expr.as_str().to_owned(),
                    payload: Ok(sample.value.payload.contiguous().into_owned()),
                },
                Err(value) => BusReply {
                    key: selector.to_owned(),
                    payload: Err(format!("{:?}", value)),
                },
            });
        }
        trace!(selector, replies = replies.len(), "Query finished");
        Ok(replies)
    }
}
