//! graphql-transport-ws subscription protocol.
//!
//! `SubscriptionProtocol` is the transport-free state machine; the socket
//! driver only exists in the browser build. One socket carries the feed for
//! its whole life: when a push moves the cursor, the running subscription is
//! completed and the next one is started under a fresh id.

use data_feed::{LatestStream, LatestUpdate};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use table_core::Timestamp;

use crate::query::{
    latest_request, GraphqlError, GraphqlRequest, GraphqlResponse, LATEST_DATA_FIELD_NAME,
};
use crate::ClientError;

pub const PROTOCOL: &str = "graphql-transport-ws";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    ConnectionInit { payload: Value },
    Subscribe { id: String, payload: GraphqlRequest },
    Pong {},
    Complete { id: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ConnectionAck {
        #[serde(default)]
        payload: Option<Value>,
    },
    Ping {
        #[serde(default)]
        payload: Option<Value>,
    },
    Pong {
        #[serde(default)]
        payload: Option<Value>,
    },
    Next {
        id: String,
        payload: GraphqlResponse,
    },
    Error {
        id: String,
        #[serde(default)]
        payload: Vec<GraphqlError>,
    },
    Complete {
        id: String,
    },
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self, ClientError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug)]
pub enum Step {
    Send(ClientFrame),
    Emit(LatestUpdate),
    Fail(ClientError),
    Finish,
    Ignore,
}

/// The live feed of one proposal over one socket.
#[derive(Debug, Clone)]
pub struct SubscriptionProtocol {
    proposal: String,
    cursor: Timestamp,
    serial: u32,
    subscribed: bool,
}

impl SubscriptionProtocol {
    pub fn new(proposal: impl Into<String>, since: Timestamp) -> Self {
        Self {
            proposal: proposal.into(),
            cursor: since,
            serial: 1,
            subscribed: false,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn cursor(&self) -> Timestamp {
        self.cursor
    }

    /// Id of the running subscription.
    pub fn id(&self) -> String {
        self.serial.to_string()
    }

    pub fn init(&self) -> ClientFrame {
        ClientFrame::ConnectionInit { payload: json!({}) }
    }

    pub fn complete(&self) -> ClientFrame {
        ClientFrame::Complete { id: self.id() }
    }

    fn subscribe(&self) -> ClientFrame {
        ClientFrame::Subscribe {
            id: self.id(),
            payload: latest_request(&self.proposal, self.cursor),
        }
    }

    pub fn on_frame(&mut self, frame: ServerFrame) -> Step {
        match frame {
            ServerFrame::ConnectionAck { .. } if !self.subscribed => {
                self.subscribed = true;
                Step::Send(self.subscribe())
            }
            ServerFrame::Ping { .. } => Step::Send(ClientFrame::Pong {}),
            ServerFrame::Next { id, payload } if id == self.id() => match decode_next(payload) {
                Ok(update) => Step::Emit(update),
                Err(err) => Step::Fail(err),
            },
            ServerFrame::Error { id, payload } if id == self.id() => Step::Fail(
                ClientError::Subscription(
                    payload
                        .into_iter()
                        .map(|e| e.message)
                        .collect::<Vec<_>>()
                        .join("; "),
                ),
            ),
            ServerFrame::Complete { id } if id == self.id() => Step::Finish,
            _ => Step::Ignore,
        }
    }

    /// Record the timestamp of a delivered push. When it moves the cursor
    /// forward, returns the frames that swap the running subscription for
    /// one starting at the new cursor.
    pub fn advance(&mut self, timestamp: Timestamp) -> Vec<ClientFrame> {
        if !self.subscribed || timestamp <= self.cursor {
            return Vec::new();
        }
        let done = self.complete();
        self.cursor = timestamp;
        self.serial += 1;
        vec![done, self.subscribe()]
    }
}

/// Decode the payload of a `next` frame into a push message.
pub fn decode_next(payload: GraphqlResponse) -> Result<LatestUpdate, ClientError> {
    let value = payload.into_field(LATEST_DATA_FIELD_NAME)?;
    Ok(serde_json::from_value(value)?)
}

#[cfg(target_arch = "wasm32")]
pub fn subscribe(url: String, proposal: &str, since: Timestamp) -> LatestStream<ClientError> {
    use futures::stream::{self, StreamExt};
    use futures_util::SinkExt;
    use gloo_net::websocket::{futures::WebSocket, Message};
    use tracing::{debug, warn};

    struct Session {
        socket: WebSocket,
        protocol: SubscriptionProtocol,
        /// Frames to send before reading again.
        outbox: Vec<ClientFrame>,
    }

    async fn send(socket: &mut WebSocket, frame: &ClientFrame) -> Result<(), ClientError> {
        let text = serde_json::to_string(frame)?;
        socket
            .send(Message::Text(text))
            .await
            .map_err(|e| ClientError::Subscription(e.to_string()))
    }

    let socket = match WebSocket::open_with_protocol(&url, PROTOCOL) {
        Ok(socket) => socket,
        Err(err) => {
            warn!(url = %url, error = %err, "websocket open failed");
            let err = ClientError::Subscription(err.to_string());
            return Box::pin(stream::once(async move { Err(err) }));
        }
    };
    let protocol = SubscriptionProtocol::new(proposal, since);
    let session = Session {
        socket,
        outbox: vec![protocol.init()],
        protocol,
    };

    Box::pin(stream::unfold(Some(session), |state| async move {
        let mut session = state?;
        loop {
            for frame in std::mem::take(&mut session.outbox) {
                if let Err(err) = send(&mut session.socket, &frame).await {
                    return Some((Err(err), None));
                }
            }
            let text = match session.socket.next().await {
                None => return None,
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Bytes(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                Some(Err(err)) => {
                    return Some((Err(ClientError::Subscription(err.to_string())), None))
                }
            };
            let frame = match ServerFrame::parse(&text) {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(error = %err, "ignoring unparseable frame");
                    continue;
                }
            };
            match session.protocol.on_frame(frame) {
                Step::Send(reply) => session.outbox.push(reply),
                Step::Emit(update) => {
                    let frames = session.protocol.advance(update.metadata.timestamp);
                    if !frames.is_empty() {
                        debug!(cursor = session.protocol.cursor(), "resubscribing on open socket");
                    }
                    session.outbox.extend(frames);
                    return Some((Ok(update), Some(session)));
                }
                Step::Fail(err) => return Some((Err(err), None)),
                Step::Finish => return None,
                Step::Ignore => {}
            }
        }
    }))
}

#[cfg(not(target_arch = "wasm32"))]
pub fn subscribe(_url: String, _proposal: &str, _since: Timestamp) -> LatestStream<ClientError> {
    Box::pin(futures::stream::once(async {
        Err(ClientError::Unsupported(
            "live subscriptions need the browser websocket",
        ))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol() -> SubscriptionProtocol {
        SubscriptionProtocol::new("2956", 1234.0)
    }

    fn next_frame(id: &str, timestamp: f64) -> ServerFrame {
        ServerFrame::parse(&format!(
            r#"{{"type":"next","id":"{id}","payload":{{"data":{{"latest_data":{{
                "runs": {{}},
                "metadata": {{"runs": [], "variables": {{}}, "timestamp": {timestamp}}}
            }}}}}}}}"#
        ))
        .unwrap()
    }

    #[test]
    fn client_frames_use_protocol_names() {
        let p = protocol();
        assert_eq!(
            serde_json::to_value(p.init()).unwrap(),
            json!({"type": "connection_init", "payload": {}})
        );
        assert_eq!(
            serde_json::to_value(ClientFrame::Pong {}).unwrap(),
            json!({"type": "pong"})
        );
        assert_eq!(
            serde_json::to_value(p.complete()).unwrap(),
            json!({"type": "complete", "id": "1"})
        );
    }

    #[test]
    fn subscribes_once_after_ack() {
        let mut p = protocol();
        let ack = ServerFrame::parse(r#"{"type":"connection_ack"}"#).unwrap();
        let Step::Send(frame) = p.on_frame(ack.clone()) else {
            panic!("expected subscribe");
        };
        let value = serde_json::to_value(frame).unwrap();
        assert_eq!(value["type"], "subscribe");
        assert_eq!(value["payload"]["operationName"], "LatestRunSubcription");
        assert_eq!(value["payload"]["variables"]["timestamp"], 1234.0);
        assert!(p.is_subscribed());
        assert!(matches!(p.on_frame(ack), Step::Ignore));
    }

    #[test]
    fn pings_are_answered() {
        let mut p = protocol();
        let ping = ServerFrame::parse(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(p.on_frame(ping), Step::Send(ClientFrame::Pong {})));
    }

    #[test]
    fn next_frame_yields_push_message() {
        let mut p = protocol();
        let next = ServerFrame::parse(
            r#"{"type":"next","id":"1","payload":{"data":{"latest_data":{
                "runs": {"7": {"energy": {"value": 1.0, "dtype": "number"}}},
                "metadata": {"runs": [7], "variables": {}, "timestamp": 2000.0}
            }}}}"#,
        )
        .unwrap();
        let Step::Emit(update) = p.on_frame(next) else {
            panic!("expected update");
        };
        assert_eq!(update.metadata.timestamp, 2000.0);
        assert!(update.runs.contains_key(&7));
    }

    #[test]
    fn foreign_ids_are_ignored_and_errors_fail() {
        let mut p = protocol();
        let other = ServerFrame::parse(r#"{"type":"complete","id":"9"}"#).unwrap();
        assert!(matches!(p.on_frame(other), Step::Ignore));
        let err = ServerFrame::parse(
            r#"{"type":"error","id":"1","payload":[{"message":"boom"}]}"#,
        )
        .unwrap();
        match p.on_frame(err) {
            Step::Fail(ClientError::Subscription(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected {other:?}"),
        }
        let done = ServerFrame::parse(r#"{"type":"complete","id":"1"}"#).unwrap();
        assert!(matches!(p.on_frame(done), Step::Finish));
    }

    #[test]
    fn advancing_cursor_swaps_subscription_on_same_socket() {
        let mut p = protocol();
        assert!(p.advance(5000.0).is_empty());
        let ack = ServerFrame::parse(r#"{"type":"connection_ack"}"#).unwrap();
        p.on_frame(ack);

        let Step::Emit(update) = p.on_frame(next_frame("1", 2000.0)) else {
            panic!("expected update");
        };
        let frames = p.advance(update.metadata.timestamp);
        assert_eq!(frames.len(), 2);
        assert_eq!(
            serde_json::to_value(&frames[0]).unwrap(),
            json!({"type": "complete", "id": "1"})
        );
        let subscribe = serde_json::to_value(&frames[1]).unwrap();
        assert_eq!(subscribe["type"], "subscribe");
        assert_eq!(subscribe["id"], "2");
        assert_eq!(subscribe["payload"]["variables"]["timestamp"], 2000.0);
        assert_eq!(p.cursor(), 2000.0);

        // Late frames of the completed subscription are ignored.
        assert!(matches!(p.on_frame(next_frame("1", 2500.0)), Step::Ignore));
        assert!(matches!(p.on_frame(next_frame("2", 1500.0)), Step::Emit(_)));
        assert!(p.advance(1500.0).is_empty());
        assert_eq!(p.id(), "2");
    }

    #[tokio::test]
    async fn native_build_reports_unsupported() {
        use futures::StreamExt;
        let mut stream = subscribe("ws://localhost".into(), "1", 0.0);
        assert!(matches!(
            stream.next().await,
            Some(Err(ClientError::Unsupported(_)))
        ));
    }
}
