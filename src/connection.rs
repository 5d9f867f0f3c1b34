//! The gateway connection: socket lifecycle, handshake, heartbeats, and
//! recovery from transient disconnects.

use std::cmp;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tracing::{debug, trace, warn};

use crate::io::{split_socket, Encoding, PacketStream, SharedSink, WireOut};
use crate::model::*;
use crate::{Discord, Error, Result, USER_AGENT};

/// The gateway protocol version spoken by this library.
pub const GATEWAY_VERSION: u64 = 6;

/// Deadline for the gateway to acknowledge a heartbeat before it is resent.
const ACK_DEADLINE: Duration = Duration::from_secs(5);
/// Consecutive unacknowledged heartbeats after which the connection is
/// considered dead and torn down for a reconnect.
const MAX_MISSED_ACKS: u32 = 3;

/// Base delay of the reconnect backoff.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Ceiling of the reconnect backoff.
const BACKOFF_CAP: Duration = Duration::from_secs(64);
/// Failed reconnect attempts between refreshes of the gateway URL.
const REDISCOVER_EVERY: u32 = 4;

/// Prepares a gateway connection before it is established.
#[derive(Clone)]
pub struct ConnectionBuilder<'a> {
    base_url: String,
    token: &'a str,

    shard: Option<[u8; 2]>,
    large_threshold: u64,
    encoding: Encoding,
}

impl<'a> ConnectionBuilder<'a> {
    pub(crate) fn new(base_url: String, token: &'a str) -> Self {
        ConnectionBuilder {
            base_url,
            token,
            shard: None,
            large_threshold: 250,
            encoding: Encoding::Json,
        }
    }

    /// Connect as only a specific shard.
    ///
    /// The `shard_id` is indexed at 0 while `total_shards` is indexed at 1.
    pub fn sharding(&mut self, shard_id: u8, total_shards: u8) -> &mut Self {
        self.shard = Some([shard_id, total_shards]);
        self
    }

    /// Member count above which the gateway stops sending offline members
    /// in server member lists. Clamped by Discord to 50..=250.
    pub fn large_threshold(&mut self, threshold: u64) -> &mut Self {
        self.large_threshold = threshold;
        self
    }

    /// Select the payload encoding negotiated with the gateway.
    ///
    /// Only [`Encoding::Json`] is implemented; connecting with
    /// [`Encoding::Etf`] selected fails.
    pub fn encoding(&mut self, encoding: Encoding) -> &mut Self {
        self.encoding = encoding;
        self
    }

    /// Establish a websocket connection over which events can be received.
    ///
    /// Also returns the `ReadyEvent` sent by Discord upon establishing the
    /// connection, which contains the initial state as seen by the client.
    pub async fn connect(&self) -> Result<(Connection, ReadyEvent)> {
        if self.encoding == Encoding::Etf {
            return Err(Error::Protocol("etf encoding is declared but not implemented"));
        }

        let identify = identify_message(self.token, self.shard, self.large_threshold);
        let url = build_gateway_url(&self.base_url, self.encoding);

        let established = open_gateway(&url, &identify, None).await?;
        let ready = match established.first_event {
            Event::Ready(ref ready) => ready.clone(),
            ref other => {
                debug!("unexpected event: {:?}", other);
                return Err(Error::Protocol("expected Ready during handshake"));
            }
        };

        if ready.version != GATEWAY_VERSION {
            warn!(
                "got protocol version {} instead of {}",
                ready.version, GATEWAY_VERSION
            );
        }

        let connection = Connection {
            receiver: established.receiver,
            sender: established.sender,
            heartbeat: established.heartbeat,
            notices: established.notices,
            pending: None,
            last_sequence: established.first_sequence,
            session_id: Some(ready.session_id.clone()),
            reconnecting: false,
            reconnects: 0,
            reconnect: ReconnectData {
                url,
                token: self.token.to_owned(),
                identify,
                encoding: self.encoding,
            },
        };

        Ok((connection, ready))
    }
}

/// An observation surfaced by [`Connection::recv_event`].
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A dispatch event arrived.
    Event(Event),
    /// A heartbeat was sent to the gateway.
    Heartbeat {
        /// The sequence number the heartbeat carried.
        sequence: Option<u64>,
    },
    /// The gateway acknowledged a heartbeat.
    HeartbeatAck {
        /// Time between the heartbeat send and its acknowledgement.
        round_trip: Duration,
    },
    /// The connection was lost and has been recovered, by resuming when the
    /// session allowed it and by re-identifying otherwise. The event stream
    /// continues with the next call.
    Reconnected,
}

/// One input to the connection's receive loop.
enum Inbound {
    Packet(Result<crate::io::Packet>),
    Notice(Option<HeartbeatNotice>),
}

/// An active WebSocket connection to the Discord gateway.
#[derive(Debug)]
pub struct Connection {
    /// Receiver of packets from the gateway.
    receiver: PacketStream,
    /// Shared writer, also held by the heartbeat task and voice handles.
    sender: SharedSink,

    /// Handle to the heartbeat task.
    heartbeat: HeartbeatHandle,
    /// Observations reported back by the heartbeat task.
    notices: mpsc::UnboundedReceiver<HeartbeatNotice>,

    /// An event produced during recovery, surfaced on the next receive.
    pending: Option<Event>,

    /// The latest dispatch sequence number received.
    last_sequence: Option<u64>,
    /// The ID of the current session, if one is live enough to resume.
    session_id: Option<String>,

    /// Set while recovering; a resume is only attempted when true.
    reconnecting: bool,
    /// Times the connection has been re-established.
    reconnects: u64,

    /// How to reconnect to the gateway.
    reconnect: ReconnectData,
}

impl Connection {
    /// Receive the next event or observation, blocking until one is
    /// available.
    ///
    /// Transient failures (socket loss, heartbeat stall, server-requested
    /// reconnects) are recovered internally with backoff;
    /// [`ConnectionEvent::Reconnected`] is surfaced when that happens. The
    /// only terminal error is [`Error::InvalidToken`].
    pub async fn recv_event(&mut self) -> Result<ConnectionEvent> {
        loop {
            if let Some(event) = self.pending.take() {
                return Ok(ConnectionEvent::Event(event));
            }

            let inbound = {
                let receiver = &mut self.receiver;
                let notices = &mut self.notices;
                tokio::select! {
                    packet = receiver.recv() => Inbound::Packet(packet),
                    notice = notices.recv() => Inbound::Notice(notice),
                }
            };

            match inbound {
                Inbound::Notice(Some(HeartbeatNotice::Beat { sequence })) => {
                    return Ok(ConnectionEvent::Heartbeat { sequence });
                }
                Inbound::Notice(Some(HeartbeatNotice::Ack { round_trip })) => {
                    return Ok(ConnectionEvent::HeartbeatAck { round_trip });
                }
                Inbound::Notice(Some(HeartbeatNotice::Stalled)) | Inbound::Notice(None) => {
                    warn!("heartbeat stalled, reconnecting");
                    return self.recover().await;
                }
                Inbound::Packet(Ok(packet)) => {
                    if let Some(event) = self.handle_packet(packet).await? {
                        return Ok(event);
                    }
                }
                Inbound::Packet(Err(Error::Json(err))) => {
                    // a malformed frame is not worth the connection
                    warn!("undecodable gateway frame: {}", err);
                }
                Inbound::Packet(Err(err)) => match check_close(err) {
                    Error::InvalidToken => {
                        self.heartbeat.shutdown();
                        return Err(Error::InvalidToken);
                    }
                    err => {
                        warn!("connection lost ({}), reconnecting", err);
                        return self.recover().await;
                    }
                },
            }
        }
    }

    /// Handle one inbound packet, returning an event when one is surfaced.
    async fn handle_packet(&mut self, packet: crate::io::Packet) -> Result<Option<ConnectionEvent>> {
        let message = match GatewayMessage::from_packet(packet) {
            Ok(message) => message,
            Err(err) => {
                warn!("undecodable gateway packet: {}", err);
                return Ok(None);
            }
        };

        match message {
            GatewayMessage::Dispatch(sequence, event) => {
                if let Some(sequence) = sequence {
                    self.last_sequence = Some(sequence);
                    self.heartbeat.sequence(sequence);
                }
                if let Event::Ready(ref ready) = event {
                    self.session_id = Some(ready.session_id.clone());
                }
                if let Event::Resumed { ref trace } = event {
                    trace!("resumed: {:?}", trace);
                }
                Ok(Some(ConnectionEvent::Event(event)))
            }
            GatewayMessage::Heartbeat(_) => {
                debug!("gateway requested an immediate heartbeat");
                self.heartbeat.beat_now();
                Ok(None)
            }
            GatewayMessage::HeartbeatAck => {
                self.heartbeat.ack();
                Ok(None)
            }
            GatewayMessage::Reconnect => {
                debug!("gateway requested a reconnect");
                let _ = self.sender.send(WireOut::Close(1000)).await;
                self.recover().await.map(Some)
            }
            GatewayMessage::InvalidSession => {
                debug!("session invalidated, identifying again");
                self.session_id = None;
                self.sender.send_json(&self.reconnect.identify).await?;
                Ok(None)
            }
            GatewayMessage::Hello(hello) => {
                debug!("mysterious mid-session hello: {}ms", hello.heartbeat_interval);
                Ok(None)
            }
            GatewayMessage::Unknown(op) => {
                debug!("ignoring unknown opcode {}", op);
                Ok(None)
            }
        }
    }

    /// Re-establish the connection after it was lost, resuming the session
    /// when possible and identifying from scratch otherwise.
    ///
    /// Attempts continue until one succeeds, with exponential backoff capped
    /// at [`BACKOFF_CAP`] and jittered to avoid thundering herds. Only an
    /// invalid token stops the loop.
    async fn recover(&mut self) -> Result<ConnectionEvent> {
        self.heartbeat.shutdown();
        self.reconnecting = true;

        let mut delay = BACKOFF_BASE;
        let mut attempts = 0u32;

        loop {
            tokio::time::sleep(jittered(delay)).await;
            attempts += 1;

            let resume = match (&self.session_id, self.last_sequence) {
                (Some(session_id), Some(sequence)) if self.reconnecting => Some(ResumePayload {
                    token: self.reconnect.token.clone(),
                    session_id: session_id.clone(),
                    last_sequence: sequence,
                }),
                _ => None,
            };

            trace!(
                "reconnect attempt {} ({})",
                attempts,
                if resume.is_some() { "resume" } else { "identify" }
            );

            match open_gateway(&self.reconnect.url, &self.reconnect.identify, resume).await {
                Ok(established) => {
                    self.install(established);
                    self.reconnecting = false;
                    self.reconnects += 1;
                    return Ok(ConnectionEvent::Reconnected);
                }
                Err(Error::InvalidToken) => return Err(Error::InvalidToken),
                Err(Error::Protocol(msg)) => {
                    // the gateway spoke but refused us; the session is gone
                    debug!("reconnect handshake failed: {}", msg);
                    self.session_id = None;
                }
                Err(err) => debug!("reconnect attempt {} failed: {}", attempts, err),
            }

            delay = next_backoff(delay);

            if attempts % REDISCOVER_EVERY == 0 {
                // the cached gateway URL may have gone stale
                match Discord::from_token_raw(self.reconnect.token.clone())
                    .get_gateway_url()
                    .await
                {
                    Ok(url) => {
                        self.reconnect.url = build_gateway_url(&url, self.reconnect.encoding);
                    }
                    Err(err) => debug!("gateway URL rediscovery failed: {}", err),
                }
            }
        }
    }

    /// Switch everything over to a freshly established connection.
    fn install(&mut self, established: Established) {
        self.receiver = established.receiver;
        self.sender = established.sender;
        self.heartbeat = established.heartbeat;
        self.notices = established.notices;
        self.pending = Some(established.first_event);
        if established.first_sequence.is_some() {
            self.last_sequence = established.first_sequence;
        }
        if established.session_id.is_some() {
            self.session_id = established.session_id;
        }
    }

    /// Sets the active presence of the client, including game and/or status
    /// information.
    ///
    /// `afk` will help Discord determine where to send notifications.
    pub async fn set_presence(
        &self,
        game: Option<Activity>,
        status: OnlineStatus,
        afk: bool,
    ) -> Result<()> {
        let status = match status {
            OnlineStatus::Offline => OnlineStatus::Invisible,
            other => other,
        };

        self.sender
            .send_json(&SentMessage::update_presence(UpdatePresencePayload {
                status,
                afk,
                since: None,
                game,
            }))
            .await
    }

    /// Set the client to be playing this game, with defaults used for any
    /// extended information.
    pub async fn set_game_name(&self, name: impl Into<String>) -> Result<()> {
        self.set_presence(Some(Activity::playing(name)), OnlineStatus::Online, false)
            .await
    }

    /// Request member chunks for the given large servers.
    pub async fn request_members(&self, server_ids: Vec<ServerId>) -> Result<()> {
        self.sender
            .send_json(&SentMessage::request_guild_members(server_ids))
            .await
    }

    /// A clone of the shared gateway writer.
    pub(crate) fn sink(&self) -> SharedSink {
        self.sender.clone()
    }

    /// The latest dispatch sequence number received.
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Times the connection has been re-established.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Cleanly shut down the websocket connection.
    pub async fn shutdown(mut self) -> Result<()> {
        self.heartbeat.shutdown();
        self.sender.send(WireOut::Close(1000)).await
    }
}

/// Instructions for how to reconnect.
#[derive(Debug)]
struct ReconnectData {
    /// The full gateway URL, query included.
    url: String,
    /// The token used to sign in to Discord.
    token: String,
    /// The complete identify message used when logging in.
    identify: SentMessage,
    /// The payload encoding the URL was built with.
    encoding: Encoding,
}

/// A freshly opened gateway socket, past its handshake.
struct Established {
    receiver: PacketStream,
    sender: SharedSink,
    heartbeat: HeartbeatHandle,
    notices: mpsc::UnboundedReceiver<HeartbeatNotice>,
    /// The first dispatch received after the handshake.
    first_event: Event,
    first_sequence: Option<u64>,
    /// The session ID, when the first dispatch was a `Ready`.
    session_id: Option<String>,
}

/// Open a socket to the gateway and run the handshake: await `Hello`, send
/// the resume (when given) or identify frame, arm the heartbeat, and wait
/// for the first dispatch.
///
/// A resume rejected with an invalid-session notice falls back to
/// identifying on the same socket.
async fn open_gateway(
    url: &str,
    identify: &SentMessage,
    resume: Option<ResumePayload>,
) -> Result<Established> {
    trace!("gateway: {}", url);

    let (socket, _response) = connect_async(url).await?;
    let (mut receiver, sender) = split_socket(socket);

    // the gateway speaks first
    let hello = match GatewayMessage::from_packet(receiver.recv().await.map_err(check_close)?)? {
        GatewayMessage::Hello(hello) => hello,
        other => {
            debug!("unexpected message: {:?}", other);
            return Err(Error::Protocol("expected Hello during handshake"));
        }
    };
    if !hello.trace.is_empty() {
        trace!("gateway trace: {:?}", hello.trace);
    }

    let resuming = resume.is_some();
    match resume {
        Some(ref payload) => {
            sender
                .send_json(&SentMessage::resume(payload.clone()))
                .await?
        }
        None => sender.send_json(identify).await?,
    }

    let (control, control_rx) = mpsc::unbounded_channel();
    let (notice_tx, notices) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // seed the resumed sequence so heartbeats do not regress
    if let Some(ref payload) = resume {
        let _ = control.send(HeartbeatControl::Sequence(payload.last_sequence));
    }

    tokio::spawn(heartbeat(
        Duration::from_millis(hello.heartbeat_interval),
        sender.clone(),
        control_rx,
        notice_tx,
        shutdown_rx,
    ));

    let heartbeat = HeartbeatHandle {
        control,
        shutdown: Some(shutdown_tx),
    };

    let mut identify_attempts: u32 = if resuming { 0 } else { 1 };
    loop {
        match GatewayMessage::from_packet(receiver.recv().await.map_err(check_close)?)? {
            GatewayMessage::Dispatch(sequence, event) => {
                if let Some(sequence) = sequence {
                    heartbeat.sequence(sequence);
                }
                let session_id = match event {
                    Event::Ready(ref ready) => Some(ready.session_id.clone()),
                    _ => None,
                };
                return Ok(Established {
                    receiver,
                    sender,
                    heartbeat,
                    notices,
                    first_event: event,
                    first_sequence: sequence,
                    session_id,
                });
            }
            GatewayMessage::InvalidSession if identify_attempts >= 2 => {
                return Err(Error::Protocol(
                    "invalid session during handshake; double-check the token \
                     or wait 5 seconds between starting shards",
                ));
            }
            GatewayMessage::InvalidSession => {
                debug!("session invalidated during handshake, identifying again");
                identify_attempts += 1;
                sender.send_json(identify).await?;
            }
            GatewayMessage::Heartbeat(_) => heartbeat.beat_now(),
            GatewayMessage::HeartbeatAck => heartbeat.ack(),
            other => debug!("unexpected message during handshake: {:?}", other),
        }
    }
}

/// Build the identify message for this account and configuration.
fn identify_message(token: &str, shard: Option<[u8; 2]>, large_threshold: u64) -> SentMessage {
    SentMessage::identify(IdentifyPayload {
        token: token.to_owned(),
        properties: IdentifyProperties {
            os: ::std::env::consts::OS.to_owned(),
            browser: USER_AGENT.to_owned(),
            device: USER_AGENT.to_owned(),
            referring_domain: String::new(),
            referrer: String::new(),
        },
        compress: true,
        large_threshold,
        v: GATEWAY_VERSION,
        shard: shard.map(|shard| (shard[0], shard[1])),
    })
}

/// Map terminal close codes onto their dedicated errors.
fn check_close(err: Error) -> Error {
    match err {
        Error::Closed(Some(code), _) if code == CLOSE_INVALID_TOKEN => Error::InvalidToken,
        other => other,
    }
}

#[inline]
fn build_gateway_url(base: &str, encoding: Encoding) -> String {
    let base = base.strip_suffix('/').unwrap_or(base);
    format!("{}/?v={}&encoding={}", base, GATEWAY_VERSION, encoding)
}

fn next_backoff(delay: Duration) -> Duration {
    cmp::min(delay * 2, BACKOFF_CAP)
}

/// Spread a backoff delay over +/-50% to avoid synchronized retries.
fn jittered(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}

// Heartbeats

/// Commands sent from the connection to the heartbeat task.
#[derive(Debug)]
enum HeartbeatControl {
    /// A new dispatch sequence number was received.
    Sequence(u64),
    /// The gateway acknowledged a heartbeat.
    Ack,
    /// Send a heartbeat immediately, without disturbing the schedule.
    Beat,
}

/// Observations reported back from the heartbeat task.
#[derive(Debug)]
enum HeartbeatNotice {
    /// A heartbeat was sent.
    Beat { sequence: Option<u64> },
    /// An acknowledgement arrived, with the measured round trip.
    Ack { round_trip: Duration },
    /// Too many heartbeats went unacknowledged; the connection is dead.
    Stalled,
}

/// Shutdown and control handle to the heartbeat task.
#[derive(Debug)]
struct HeartbeatHandle {
    control: mpsc::UnboundedSender<HeartbeatControl>,
    /// Always `Some` until the task is shut down.
    shutdown: Option<oneshot::Sender<()>>,
}

impl HeartbeatHandle {
    fn sequence(&self, sequence: u64) {
        let _ = self.control.send(HeartbeatControl::Sequence(sequence));
    }

    fn ack(&self) {
        let _ = self.control.send(HeartbeatControl::Ack);
    }

    fn beat_now(&self) {
        let _ = self.control.send(HeartbeatControl::Beat);
    }

    fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// The heartbeat task: sends a heartbeat every `interval`, watches for
/// acknowledgements, and reports observations back to the connection.
///
/// Every send arms a single acknowledgement watchdog. An expiry logs a
/// warning and resends; [`MAX_MISSED_ACKS`] consecutive expiries report a
/// stall and end the task, which tears the connection down for a reconnect.
async fn heartbeat(
    interval: Duration,
    sink: SharedSink,
    mut control: mpsc::UnboundedReceiver<HeartbeatControl>,
    notices: mpsc::UnboundedSender<HeartbeatNotice>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last_sequence: Option<u64> = None;
    // send instant of the heartbeat awaiting acknowledgement, if any
    let mut outstanding: Option<Instant> = None;
    let mut missed = 0u32;

    loop {
        let deadline = outstanding.map(|sent| sent + ACK_DEADLINE);
        let mut send = false;

        tokio::select! {
            _ = ticker.tick() => send = true,
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                missed += 1;
                if missed >= MAX_MISSED_ACKS {
                    warn!("{} heartbeats unacknowledged, giving up on the connection", missed);
                    let _ = notices.send(HeartbeatNotice::Stalled);
                    return;
                }
                warn!("heartbeat not acknowledged within {:?}, resending", ACK_DEADLINE);
                send = true;
            }
            message = control.recv() => match message {
                Some(HeartbeatControl::Sequence(sequence)) => last_sequence = Some(sequence),
                Some(HeartbeatControl::Ack) => {
                    if let Some(sent) = outstanding.take() {
                        missed = 0;
                        let _ = notices.send(HeartbeatNotice::Ack { round_trip: sent.elapsed() });
                    }
                }
                Some(HeartbeatControl::Beat) => send = true,
                None => return,
            },
            _ = &mut shutdown => return,
        }

        if send {
            if let Err(err) = sink.send_json(&SentMessage::heartbeat(last_sequence)).await {
                warn!("error sending gateway heartbeat: {}", err);
                let _ = notices.send(HeartbeatNotice::Stalled);
                return;
            }
            outstanding = Some(Instant::now());
            let _ = notices.send(HeartbeatNotice::Beat { sequence: last_sequence });
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::testing::{sent_json, RecordingSink};
    use serde_json::json;

    #[test]
    fn gateway_urls_trim_one_trailing_slash() {
        assert_eq!(
            build_gateway_url("wss://gateway.discord.gg/", Encoding::Json),
            "wss://gateway.discord.gg/?v=6&encoding=json"
        );
        assert_eq!(
            build_gateway_url("wss://gateway.discord.gg", Encoding::Json),
            "wss://gateway.discord.gg/?v=6&encoding=json"
        );
    }

    #[test]
    fn identify_reports_the_library_fingerprint() {
        let value = serde_json::to_value(identify_message("Bot abc", None, 250)).unwrap();
        assert_eq!(value["op"], json!(2));
        assert_eq!(value["d"]["token"], json!("Bot abc"));
        assert_eq!(value["d"]["compress"], json!(true));
        assert_eq!(value["d"]["v"], json!(6));
        assert_eq!(value["d"]["properties"]["$os"], json!(::std::env::consts::OS));
        assert_eq!(value["d"]["properties"]["$browser"], json!(USER_AGENT));
        assert_eq!(value["d"]["properties"]["$device"], json!(USER_AGENT));
        assert!(value["d"].get("shard").is_none());

        let value = serde_json::to_value(identify_message("Bot abc", Some([1, 3]), 250)).unwrap();
        assert_eq!(value["d"]["shard"], json!([1, 3]));
    }

    #[test]
    fn invalid_token_close_is_terminal() {
        assert!(matches!(
            check_close(Error::Closed(Some(4004), "Authentication failed.".into())),
            Error::InvalidToken
        ));
        assert!(matches!(
            check_close(Error::Closed(Some(1006), String::new())),
            Error::Closed(Some(1006), _)
        ));
    }

    #[test]
    fn backoff_doubles_to_a_cap() {
        let mut delay = BACKOFF_BASE;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(delay);
            delay = next_backoff(delay);
        }
        assert_eq!(seen[0], Duration::from_secs(1));
        assert_eq!(seen[1], Duration::from_secs(2));
        assert_eq!(seen[6], Duration::from_secs(64));
        assert_eq!(seen[7], Duration::from_secs(64));
    }

    #[test]
    fn jitter_stays_within_half_and_one_and_a_half() {
        for _ in 0..100 {
            let jittered = jittered(Duration::from_secs(8));
            assert!(jittered >= Duration::from_secs(4));
            assert!(jittered < Duration::from_secs(12));
        }
    }

    fn spawn_heartbeat(
        interval: Duration,
    ) -> (
        std::sync::Arc<std::sync::Mutex<Vec<crate::io::WireOut>>>,
        mpsc::UnboundedSender<HeartbeatControl>,
        mpsc::UnboundedReceiver<HeartbeatNotice>,
        oneshot::Sender<()>,
    ) {
        let (sink, items) = RecordingSink::new();
        let shared = SharedSink::new(sink);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(heartbeat(interval, shared, control_rx, notice_tx, shutdown_rx));
        (items, control_tx, notice_rx, shutdown_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_tick_and_carry_the_sequence() {
        let (items, control, mut notices, _shutdown) =
            spawn_heartbeat(Duration::from_millis(41250));

        // the first heartbeat goes out immediately
        let notice = notices.recv().await.unwrap();
        assert!(matches!(notice, HeartbeatNotice::Beat { sequence: None }));

        control.send(HeartbeatControl::Sequence(12)).unwrap();
        control.send(HeartbeatControl::Ack).unwrap();
        assert!(matches!(
            notices.recv().await.unwrap(),
            HeartbeatNotice::Ack { .. }
        ));

        tokio::time::sleep(Duration::from_millis(41250)).await;
        let notice = notices.recv().await.unwrap();
        assert!(matches!(notice, HeartbeatNotice::Beat { sequence: Some(12) }));

        let sent = sent_json(&items);
        assert_eq!(sent[0], json!({ "op": 1, "d": null }));
        assert_eq!(sent[1], json!({ "op": 1, "d": 12 }));
    }

    #[tokio::test(start_paused = true)]
    async fn server_requested_beats_do_not_wait_for_the_tick() {
        let (items, control, mut notices, _shutdown) =
            spawn_heartbeat(Duration::from_secs(600));

        // initial beat
        assert!(matches!(
            notices.recv().await.unwrap(),
            HeartbeatNotice::Beat { .. }
        ));
        control.send(HeartbeatControl::Ack).unwrap();
        assert!(matches!(
            notices.recv().await.unwrap(),
            HeartbeatNotice::Ack { .. }
        ));

        control.send(HeartbeatControl::Beat).unwrap();
        assert!(matches!(
            notices.recv().await.unwrap(),
            HeartbeatNotice::Beat { .. }
        ));
        assert_eq!(sent_json(&items).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_heartbeats_resend_then_stall() {
        let (items, _control, mut notices, _shutdown) =
            spawn_heartbeat(Duration::from_secs(600));

        // initial send, then two watchdog resends, then the stall
        assert!(matches!(
            notices.recv().await.unwrap(),
            HeartbeatNotice::Beat { .. }
        ));
        assert!(matches!(
            notices.recv().await.unwrap(),
            HeartbeatNotice::Beat { .. }
        ));
        assert!(matches!(
            notices.recv().await.unwrap(),
            HeartbeatNotice::Beat { .. }
        ));
        assert!(matches!(notices.recv().await.unwrap(), HeartbeatNotice::Stalled));

        assert_eq!(sent_json(&items).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledgement_resets_the_watchdog() {
        let (_items, control, mut notices, _shutdown) =
            spawn_heartbeat(Duration::from_secs(600));

        assert!(matches!(
            notices.recv().await.unwrap(),
            HeartbeatNotice::Beat { .. }
        ));
        // one miss, then the ack arrives
        assert!(matches!(
            notices.recv().await.unwrap(),
            HeartbeatNotice::Beat { .. }
        ));
        control.send(HeartbeatControl::Ack).unwrap();
        assert!(matches!(
            notices.recv().await.unwrap(),
            HeartbeatNotice::Ack { .. }
        ));

        // the next expiry is a fresh first miss, not a third strike
        assert!(matches!(
            notices.recv().await.unwrap(),
            HeartbeatNotice::Beat { .. }
        ));
        assert!(matches!(
            notices.recv().await.unwrap(),
            HeartbeatNotice::Beat { .. }
        ));
    }
}
