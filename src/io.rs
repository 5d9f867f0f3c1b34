//! Gateway wire codec and the IO plumbing around it.
//!
//! Inbound frames are inflated (the gateway compresses binary frames with
//! zlib when asked to via `compress` in the identify payload) and decoded
//! into generic [`Packet`]s. Outbound values are JSON-encoded text frames.

use std::fmt;
use std::io::Read;

use flate2::read::ZlibDecoder;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Payload encoding negotiated with the gateway through the URL query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Plain JSON payloads, optionally zlib-compressed by the server.
    #[default]
    Json,
    /// The ETF binary encoding. Declared for completeness; connecting with
    /// it selected is rejected because no ETF codec is implemented.
    Etf,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Encoding::Json => f.write_str("json"),
            Encoding::Etf => f.write_str("etf"),
        }
    }
}

/// A single gateway frame in generic form, before opcode dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    /// The opcode of the frame.
    pub op: u64,
    /// The sequence number, present on dispatches only.
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// The event name, present on dispatches only.
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// The payload tree.
    #[serde(rename = "d", default)]
    pub payload: Value,
}

impl Packet {
    /// Decode a websocket message into a packet.
    ///
    /// Binary messages are zlib streams wrapping JSON text; text messages
    /// are JSON directly. Returns `None` for control messages that carry no
    /// packet (ping/pong).
    pub fn decode(message: Message) -> Result<Option<Packet>> {
        match message {
            Message::Text(text) => Ok(Some(serde_json::from_str(text.as_str())?)),
            Message::Binary(bytes) => {
                let mut inflated = String::with_capacity(bytes.len() * 3);
                ZlibDecoder::new(&bytes[..]).read_to_string(&mut inflated)?;
                Ok(Some(serde_json::from_str(&inflated)?))
            }
            Message::Close(frame) => {
                let (code, reason) = match frame {
                    Some(frame) => (Some(frame.code.into()), frame.reason.into_owned()),
                    None => (None, String::new()),
                };
                Err(Error::Closed(code, reason))
            }
            _ => Ok(None),
        }
    }

    /// Encode a packet into a websocket text message.
    pub fn encode(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }
}

/// Inbound half of the gateway socket, yielding [`Packet`]s.
#[derive(Debug)]
pub struct PacketStream {
    inner: futures::stream::SplitStream<WsStream>,
}

impl PacketStream {
    pub fn new(inner: futures::stream::SplitStream<WsStream>) -> Self {
        Self { inner }
    }

    /// Receive the next packet, skipping control messages.
    ///
    /// A closed socket surfaces as [`Error::Closed`], carrying the close
    /// code when the peer supplied one.
    pub async fn recv(&mut self) -> Result<Packet> {
        loop {
            match self.inner.next().await {
                Some(Ok(message)) => match Packet::decode(message)? {
                    Some(packet) => return Ok(packet),
                    None => continue,
                },
                Some(Err(err)) => return Err(Error::WebSocket(err)),
                None => return Err(Error::Closed(None, String::new())),
            }
        }
    }
}

/// An outbound item for the gateway writer.
#[derive(Debug, Clone, PartialEq)]
pub enum WireOut {
    /// A JSON payload to send as a text frame.
    Json(Value),
    /// Close the connection with the given close code.
    Close(u16),
}

/// Outbound half of the gateway socket, accepting [`WireOut`] items.
#[derive(Debug)]
pub struct PacketSink {
    inner: futures::stream::SplitSink<WsStream, Message>,
}

impl PacketSink {
    pub fn new(inner: futures::stream::SplitSink<WsStream, Message>) -> Self {
        Self { inner }
    }

    /// Send one outbound item and flush it.
    pub async fn send(&mut self, item: WireOut) -> Result<()> {
        let message = match item {
            WireOut::Json(value) => Message::Text(serde_json::to_string(&value)?.into()),
            WireOut::Close(code) => Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: "".into(),
            })),
        };
        self.inner.send(message).await.map_err(Error::WebSocket)
    }
}

/// Abstraction over the gateway writer, so tests can capture sends.
pub(crate) trait OutboundSink: Send + 'static {
    fn send(
        &mut self,
        item: WireOut,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>>;
}

impl OutboundSink for PacketSink {
    fn send(
        &mut self,
        item: WireOut,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(PacketSink::send(self, item))
    }
}

/// Share the gateway writer between concurrent users (the session, the
/// heartbeat task, voice handles) by offloading the actual sending to a
/// spawned task and communicating over channels.
///
/// Dropping every clone drops the underlying sink, which closes the write
/// half of the socket.
#[derive(Debug)]
pub struct SharedSink {
    channel: mpsc::UnboundedSender<(WireOut, oneshot::Sender<Result<()>>)>,
}

impl SharedSink {
    /// Create a shared sink by offloading sending to a spawned task.
    pub(crate) fn new(sink: impl OutboundSink) -> Self {
        let (send, mut receive) =
            mpsc::unbounded_channel::<(WireOut, oneshot::Sender<Result<()>>)>();

        tokio::spawn(async move {
            let mut sink = sink;
            while let Some((item, reply)) = receive.recv().await {
                let _ = reply.send(sink.send(item).await);
            }
        });

        Self { channel: send }
    }

    /// Send one item, waiting until the writer task has flushed it.
    pub async fn send(&self, item: WireOut) -> Result<()> {
        let (reply, confirm) = oneshot::channel();
        self.channel
            .send((item, reply))
            .map_err(|_| Error::Other("gateway writer is gone"))?;
        match confirm.await {
            Ok(result) => result,
            Err(_) => Err(Error::Other("gateway writer is gone")),
        }
    }

    /// Send one JSON-serializable payload.
    pub async fn send_json(&self, value: &impl Serialize) -> Result<()> {
        self.send(WireOut::Json(serde_json::to_value(value)?)).await
    }
}

impl Clone for SharedSink {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
        }
    }
}

/// Split a connected websocket into gateway halves.
pub(crate) fn split_socket(socket: WsStream) -> (PacketStream, SharedSink) {
    let (write, read) = socket.split();
    (PacketStream::new(read), SharedSink::new(PacketSink::new(write)))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// A sink that records everything sent through it.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingSink {
        pub items: Arc<Mutex<Vec<WireOut>>>,
    }

    impl RecordingSink {
        pub fn new() -> (Self, Arc<Mutex<Vec<WireOut>>>) {
            let items = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    items: items.clone(),
                },
                items,
            )
        }
    }

    impl OutboundSink for RecordingSink {
        fn send(
            &mut self,
            item: WireOut,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
            self.items.lock().unwrap().push(item);
            Box::pin(async { Ok(()) })
        }
    }

    /// Collect the JSON payloads recorded by a [`RecordingSink`].
    pub(crate) fn sent_json(items: &Arc<Mutex<Vec<WireOut>>>) -> Vec<Value> {
        items
            .lock()
            .unwrap()
            .iter()
            .filter_map(|item| match item {
                WireOut::Json(value) => Some(value.clone()),
                WireOut::Close(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn text_frames_decode_to_packets() {
        let frame = Message::Text(r#"{"op":0,"s":7,"t":"PRESENCE_UPDATE","d":{}}"#.into());
        let packet = Packet::decode(frame).unwrap().unwrap();
        assert_eq!(packet.op, 0);
        assert_eq!(packet.sequence, Some(7));
        assert_eq!(packet.kind.as_deref(), Some("PRESENCE_UPDATE"));
    }

    #[test]
    fn binary_frames_are_inflated_before_decoding() {
        let raw = r#"{"op":10,"d":{"heartbeat_interval":41250}}"#;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(raw.as_bytes()).unwrap();
        let deflated = encoder.finish().unwrap();

        let packet = Packet::decode(Message::Binary(deflated.into()))
            .unwrap()
            .unwrap();
        assert_eq!(packet.op, 10);
        assert_eq!(packet.payload["heartbeat_interval"], json!(41250));
        assert_eq!(packet.sequence, None);
    }

    #[test]
    fn encode_round_trips_dispatches() {
        let packet = Packet {
            op: 0,
            sequence: Some(42),
            kind: Some("GUILD_CREATE".to_string()),
            payload: json!({ "id": "123", "unavailable": false }),
        };
        let round = Packet::decode(packet.encode().unwrap()).unwrap().unwrap();
        assert_eq!(round.op, packet.op);
        assert_eq!(round.sequence, packet.sequence);
        assert_eq!(round.kind, packet.kind);
        assert_eq!(round.payload, packet.payload);
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        let frame = Message::Text("{not json".into());
        assert!(matches!(Packet::decode(frame), Err(Error::Json(_))));
    }

    #[test]
    fn close_frames_surface_their_code() {
        let frame = Message::Close(Some(CloseFrame {
            code: CloseCode::from(4004),
            reason: "Authentication failed.".into(),
        }));
        match Packet::decode(frame) {
            Err(Error::Closed(Some(code), reason)) => {
                assert_eq!(code, 4004);
                assert_eq!(reason, "Authentication failed.");
            }
            other => panic!("expected close error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn shared_sink_forwards_in_order() {
        let (sink, items) = testing::RecordingSink::new();
        let shared = SharedSink::new(sink);
        let clone = shared.clone();

        shared.send(WireOut::Json(json!({ "op": 1 }))).await.unwrap();
        clone.send(WireOut::Json(json!({ "op": 3 }))).await.unwrap();
        shared.send(WireOut::Close(1000)).await.unwrap();

        let sent = items.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], WireOut::Json(json!({ "op": 1 })));
        assert_eq!(sent[1], WireOut::Json(json!({ "op": 3 })));
        assert_eq!(sent[2], WireOut::Close(1000));
    }
}
