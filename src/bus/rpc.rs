//! Request/reply on top of the bus query primitive.

use super::Bus;
use crate::{
    error::BusError,
    messages::{Schema, ServiceResponse},
};
use tracing::*;

/// Reply that decoded against the expected schema
#[derive(Debug, Clone)]
pub struct Decoded<T> {
    pub key: String,
    pub message: T,
}

/// Sends `payload` (or nothing) to `key` and decodes every reply as `T`.
///
/// Blocks for the bus' reply window. Replies that fail to decode or that carry a responder
/// error are logged and skipped. An empty result means nobody answered.
pub async fn request<T: Schema>(
    bus: &dyn Bus,
    key: &str,
    payload: Option<Vec<u8>>,
) -> Result<Vec<Decoded<T>>, BusError> {
    let replies = bus.query(key, payload).await?;
    let received = replies.len();
    let decoded: Vec<_> = replies
        .into_iter()
        .filter_map(|reply| match reply.payload {
            Ok(payload) => match T::decode(&reply.key, &payload) {
                Ok(message) => Some(Decoded {
                    key: reply.key,
                    message,
                }),
                Err(err) => {
                    warn!("Failed to handle response: {}", err);
                    None
                }
            },
            Err(err) => {
                warn!(key = %reply.key, "Responder returned error: {}", err);
                None
            }
        })
        .collect();
    debug!(key, received, decoded = decoded.len(), "Request finished");
    Ok(decoded)
}

/// `request` for service calls, logging the status of every response
pub async fn call<T: ServiceResponse + std::fmt::Debug>(
    bus: &dyn Bus,
    key: &str,
    payload: Option<Vec<u8>>,
) -> Result<Vec<Decoded<T>>, BusError> {
    let responses = request::<T>(bus, key, payload).await?;
    if responses.is_empty() {
        warn!(key, "No responder for {}", T::NAME);
    }
    for response in &responses {
        let status = response.message.status();
        if status.success {
            info!(key = %response.key, "Received {:?}", response.message);
        } else {
            warn!(
                key = %response.key,
                code = status.code,
                message = %status.message,
                "{} reported failure",
                T::NAME
            );
        }
    }
    Ok(responses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::{stub::StubBus, BusReply},
        messages::{ClearRouteResponse, ResponseStatus},
    };

    fn response(success: bool, code: u16) -> Vec<u8> {
        ClearRouteResponse {
            status: ResponseStatus {
                success,
                code,
                message: String::new(),
            },
        }
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn collects_every_reply() {
        let bus = StubBus::new();
        bus.reply_with("v1/clear", vec![response(true, 0), response(false, 7)]);
        let replies = request::<ClearRouteResponse>(&*bus, "v1/clear", None)
            .await
            .unwrap();
        assert_eq!(replies.len(), 2);
        assert!(replies[0].message.status.success);
        assert_eq!(replies[1].message.status.code, 7);
        assert_eq!(bus.queries(), vec![("v1/clear".to_owned(), None)]);
    }

    #[tokio::test]
    async fn bad_replies_do_not_stop_collection() {
        let bus = StubBus::new();
        bus.set_replies(
            "v1/clear",
            vec![
                BusReply {
                    key: "v1/clear".to_owned(),
                    payload: Ok(vec![0x00, 0x01]),
                },
                BusReply {
                    key: "v1/clear".to_owned(),
                    payload: Err("service crashed".to_owned()),
                },
                BusReply {
                    key: "v1/clear".to_owned(),
                    payload: Ok(response(true, 0)),
                },
            ],
        );
        let replies = call::<ClearRouteResponse>(&*bus, "v1/clear", None)
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].message.status.success);
    }

    #[tokio::test]
    async fn no_responder_is_empty() {
        let bus = StubBus::new();
        let replies = call::<ClearRouteResponse>(&*bus, "v1/clear", Some(vec![1, 2]))
            .await
            .unwrap();
        assert!(replies.is_empty());
        assert_eq!(bus.queries()[0].1, Some(vec![1, 2]));
    }

    #[tokio::test]
    async fn transport_failure_is_an_error() {
        let bus = StubBus::new();
        bus.fail_queries_matching("clear");
        let result = request::<ClearRouteResponse>(&*bus, "v1/clear", None).await;
        assert!(matches!(result, Err(BusError::Transport { .. })));
    }
}
