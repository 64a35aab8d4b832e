//! In-memory bus for tests. Records every call and lets tests push samples to subscribers.

use super::{Bus, BusReply, BusSample, SampleHandler, Subscription};
use crate::error::BusError;
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

#[derive(Default)]
struct StubState {
    next_id: u64,
    active: Vec<(u64, String, Arc<SampleHandler>)>,
    undeclared: Vec<String>,
    published: Vec<(String, Vec<u8>)>,
    queries: Vec<(String, Option<Vec<u8>>)>,
    replies: HashMap<String, Vec<BusReply>>,
    failing_subscriptions: Vec<String>,
    failing_queries: Vec<String>,
}

#[derive(Default, Clone)]
pub(crate) struct StubBus {
    state: Arc<Mutex<StubState>>,
}

impl StubBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_replies(&self, selector: &str, replies: Vec<BusReply>) {
        self.state
            .lock()
            .unwrap()
            .replies
            .insert(selector.to_owned(), replies);
    }

    pub fn reply_with(&self, selector: &str, payloads: Vec<Vec<u8>>) {
        let replies = payloads
            .into_iter()
            .map(|payload| BusReply {
                key: selector.to_owned(),
                payload: Ok(payload),
            })
            .collect();
        self.set_replies(selector, replies);
    }

    /// Subscriptions whose key contains `pattern` fail to declare
    pub fn fail_subscriptions_matching(&self, pattern: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_subscriptions
            .push(pattern.to_owned());
    }

    /// Queries whose selector contains `pattern` fail with a transport error
    pub fn fail_queries_matching(&self, pattern: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_queries
            .push(pattern.to_owned());
    }

    /// Delivers a sample to every live subscription on `key`
    pub fn inject(&self, key: &str, payload: Vec<u8>) {
        let handlers: Vec<_> = self
            .state
            .lock()
            .unwrap()
            .active
            .iter()
            .filter(|(_, subscribed, _)| subscribed == key)
            .map(|(_, _, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(BusSample {
                key: key.to_owned(),
                payload: payload.clone(),
            });
        }
    }

    pub fn active_subscriptions(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.active.iter().map(|(_, key, _)| key.clone()).collect()
    }

    pub fn undeclared(&self) -> Vec<String> {
        self.state.lock().unwrap().undeclared.clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn queries(&self) -> Vec<(String, Option<Vec<u8>>)> {
        self.state.lock().unwrap().queries.clone()
    }
}

struct StubSubscription {
    id: u64,
    key: String,
    state: Arc<Mutex<StubState>>,
}

#[async_trait]
impl Subscription for StubSubscription {
    fn key(&self) -> &str {
        &self.key
    }

    async fn undeclare(self: Box<Self>) -> Result<(), BusError> {
        let mut state = self.state.lock().unwrap();
        state.active.retain(|(id, _, _)| *id != self.id);
        state.undeclared.push(self.key.clone());
        Ok(())
    }
}

#[async_trait]
impl Bus for StubBus {
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.state
            .lock()
            .unwrap()
            .published
            .push((key.to_owned(), payload));
        Ok(())
    }

    async fn subscribe(
        &self,
        key: &str,
        handler: SampleHandler,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let mut state = self.state.lock().unwrap();
        if state
            .failing_subscriptions
            .iter()
            .any(|pattern| key.contains(pattern.as_str()))
        {
            return Err(BusError::transport(key, "subscription refused"));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.active.push((id, key.to_owned(), Arc::new(handler)));
        Ok(Box::new(StubSubscription {
            id,
            key: key.to_owned(),
            state: self.state.clone(),
        }))
    }

    async fn query(
        &self,
        selector: &str,
        payload: Option<Vec<u8>>,
    ) -> Result<Vec<BusReply>, BusError> {
        let mut state = self.state.lock().unwrap();
        state.queries.push((selector.to_owned(), payload));
        if state
            .failing_queries
            .iter()
            .any(|pattern| selector.contains(pattern.as_str()))
        {
            return Err(BusError::transport(selector, "unreachable"));
        }
        Ok(state.replies.get(selector).cloned().unwrap_or_default())
    }
}
