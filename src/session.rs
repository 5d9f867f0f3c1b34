//! The consumer-facing session: event routing, bootstrap gating, large
//! server member backfill, and voice join coordination on top of a
//! [`Connection`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use crate::connection::{Connection, ConnectionBuilder, ConnectionEvent};
use crate::io::{Encoding, SharedSink};
use crate::model::*;
use crate::state::{ChannelRef, State};
use crate::voice::{VoiceConnection, VoiceSession};
use crate::{Error, Result};

/// How often the member backfill checks for remaining work.
const CHUNK_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Spacing between consecutive chunk request sends.
const CHUNK_SEND_SPACING: Duration = Duration::from_secs(1);
/// Server IDs per chunk request.
const CHUNK_BATCH: usize = 50;
/// How long a voice join may wait for the gateway's two answers.
const VOICE_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Prepares a [`Session`] before it is connected.
pub struct SessionBuilder<'a> {
    connection: ConnectionBuilder<'a>,
    load_all_members: bool,
    disabled_events: HashSet<String>,
}

impl<'a> SessionBuilder<'a> {
    pub(crate) fn new(base_url: String, token: &'a str) -> Self {
        SessionBuilder {
            connection: ConnectionBuilder::new(base_url, token),
            load_all_members: false,
            disabled_events: HashSet::new(),
        }
    }

    /// Connect as only a specific shard.
    ///
    /// The `shard_id` is indexed at 0 while `total_shards` is indexed at 1.
    pub fn sharding(&mut self, shard_id: u8, total_shards: u8) -> &mut Self {
        self.connection.sharding(shard_id, total_shards);
        self
    }

    /// Member count above which the gateway stops sending offline members.
    pub fn large_threshold(&mut self, threshold: u64) -> &mut Self {
        self.connection.large_threshold(threshold);
        self
    }

    /// Select the payload encoding negotiated with the gateway.
    pub fn encoding(&mut self, encoding: Encoding) -> &mut Self {
        self.connection.encoding(encoding);
        self
    }

    /// Backfill the full member list of every large server before the
    /// session reports ready. Off by default; costs bandwidth and memory.
    pub fn load_all_members(&mut self, enabled: bool) -> &mut Self {
        self.load_all_members = enabled;
        self
    }

    /// Suppress delivery of the named dispatch events (by their wire names,
    /// e.g. `"TYPING_START"`). Suppressed events are not applied to the
    /// local state either; events the session itself depends on are still
    /// processed internally.
    pub fn disable_events<I>(&mut self, names: I) -> &mut Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.disabled_events
            .extend(names.into_iter().map(Into::into));
        self
    }

    /// Establish the gateway connection and bootstrap the session from the
    /// initial `READY`.
    pub async fn connect(&self) -> Result<Session> {
        let (connection, ready) = self.connection.connect().await?;

        let mut dispatcher = Dispatcher::new(
            connection.sink(),
            &ready,
            self.load_all_members,
            self.disabled_events.clone(),
        );
        dispatcher.advance_ready_gate();

        Ok(Session {
            connection,
            dispatcher,
        })
    }
}

/// An event or observation surfaced by [`Session::next_event`].
#[derive(Debug)]
pub enum SessionEvent {
    /// Bootstrap finished: every server of the initial ready list has
    /// arrived and, when member loading is enabled, every large server has
    /// been fully populated. Emitted at most once per session.
    Ready,
    /// The connection dropped and was recovered, by resume or re-identify.
    Reconnected,
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
    /// A dispatch event, delivered once the ready gate has opened.
    Event(Event),
}

/// A connected gateway session.
///
/// All session state is owned here and mutated only from the task calling
/// [`Session::next_event`]; there is no cross-thread sharing to go wrong.
#[derive(Debug)]
pub struct Session {
    connection: Connection,
    dispatcher: Dispatcher,
}

impl Session {
    /// Receive the next session event, driving timers (member chunk pacing,
    /// voice join deadlines) while waiting.
    pub async fn next_event(&mut self) -> Result<SessionEvent> {
        loop {
            if let Some(event) = self.dispatcher.outbox.pop_front() {
                return Ok(event);
            }

            let check_at = self.dispatcher.next_chunk_check;
            let send_at = self.dispatcher.chunker.next_send;
            let join_at = self.dispatcher.next_join_deadline();

            let wake = {
                let connection = &mut self.connection;
                tokio::select! {
                    event = connection.recv_event() => Wake::Connection(event),
                    _ = time::sleep_until(check_at.unwrap_or_else(far_future)), if check_at.is_some() => Wake::ChunkCheck,
                    _ = time::sleep_until(send_at.unwrap_or_else(far_future)), if send_at.is_some() => Wake::ChunkSend,
                    _ = time::sleep_until(join_at.unwrap_or_else(far_future)), if join_at.is_some() => Wake::JoinExpiry,
                }
            };

            match wake {
                Wake::Connection(event) => match event? {
                    ConnectionEvent::Event(event) => self.dispatcher.handle_dispatch(event),
                    ConnectionEvent::Heartbeat { sequence } => {
                        return Ok(SessionEvent::Heartbeat { sequence });
                    }
                    ConnectionEvent::HeartbeatAck { round_trip } => {
                        return Ok(SessionEvent::HeartbeatAck { round_trip });
                    }
                    ConnectionEvent::Reconnected => {
                        // the writer belongs to the new socket now
                        self.dispatcher.refresh_sink(self.connection.sink());
                        return Ok(SessionEvent::Reconnected);
                    }
                },
                Wake::ChunkCheck => self.dispatcher.run_chunk_check(Instant::now()),
                Wake::ChunkSend => {
                    if let Some(batch) = self.dispatcher.chunker.due_batch(Instant::now()) {
                        trace!("requesting members for {} servers", batch.len());
                        self.connection.request_members(batch).await?;
                    }
                }
                Wake::JoinExpiry => self.dispatcher.expire_joins(Instant::now()),
            }
        }
    }

    /// The local view of servers, channels and users.
    #[inline]
    pub fn state(&self) -> &State {
        &self.dispatcher.state
    }

    /// The logged-in user.
    #[inline]
    pub fn me(&self) -> &CurrentUser {
        self.dispatcher.state.user()
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
        self.connection.set_presence(game, status, afk).await
    }

    /// Set the client to be playing this game, with defaults used for any
    /// extended information.
    pub async fn set_game_name(&self, name: impl Into<String>) -> Result<()> {
        self.connection.set_game_name(name).await
    }

    /// Get a handle to the voice connection for a server, if one exists.
    pub fn voice(&mut self, server_id: ServerId) -> Option<&mut VoiceConnection> {
        self.dispatcher.voice.get_mut(&server_id)
    }

    /// Join a voice channel.
    ///
    /// Fails immediately when the channel is not a voice channel or a voice
    /// connection for its server already exists. Otherwise the returned
    /// completion resolves with the negotiated [`VoiceSession`] once the
    /// gateway has answered, or fails if the handshake breaks off or times
    /// out. Exactly one of the two happens.
    pub async fn join_voice_channel(
        &mut self,
        channel_id: ChannelId,
        mute: bool,
        deaf: bool,
    ) -> Result<oneshot::Receiver<Result<VoiceSession>>> {
        self.dispatcher
            .join_voice_channel(channel_id, mute, deaf)
            .await
    }

    /// Leave a server's voice channel and discard its voice handle.
    pub async fn leave_voice_channel(&mut self, server_id: ServerId) -> Result<()> {
        match self.dispatcher.voice.remove(&server_id) {
            Some(mut voice) => voice.disconnect().await,
            None => Ok(()),
        }
    }

    /// Times the underlying connection has been re-established.
    pub fn reconnects(&self) -> u64 {
        self.connection.reconnects()
    }

    /// Cleanly shut down the session and its connection.
    pub async fn shutdown(self) -> Result<()> {
        self.connection.shutdown().await
    }
}

enum Wake {
    Connection(Result<ConnectionEvent>),
    ChunkCheck,
    ChunkSend,
    JoinExpiry,
}

/// Dispatch events the session consumes itself, in addition to delivery.
/// These run on arrival and are never deferred by the ready gate.
fn is_internal(kind: Option<&str>) -> bool {
    matches!(
        kind,
        Some(
            "READY"
                | "RESUMED"
                | "GUILD_CREATE"
                | "GUILD_MEMBERS_CHUNK"
                | "VOICE_STATE_UPDATE"
                | "VOICE_SERVER_UPDATE"
        )
    )
}

/// Event routing and bootstrap state, separated from the socket so it can
/// be driven directly.
#[derive(Debug)]
struct Dispatcher {
    sink: SharedSink,
    state: State,

    /// Whether `SessionEvent::Ready` has been emitted. At most once.
    ready_emitted: bool,
    /// Dispatches held back until the ready gate opens.
    deferred: VecDeque<Event>,
    /// Events ready for delivery to the consumer.
    outbox: VecDeque<SessionEvent>,

    load_all_members: bool,
    disabled: HashSet<String>,
    chunker: Chunker,
    /// When the next periodic chunk check runs; `None` until the bootstrap
    /// hands control to the chunker.
    next_chunk_check: Option<Instant>,

    /// At most one voice connection per server.
    voice: HashMap<ServerId, VoiceConnection>,
}

impl Dispatcher {
    fn new(
        sink: SharedSink,
        ready: &ReadyEvent,
        load_all_members: bool,
        disabled: HashSet<String>,
    ) -> Dispatcher {
        if !ready.trace.is_empty() {
            trace!("gateway trace: {:?}", ready.trace);
        }
        Dispatcher {
            sink,
            state: State::new(ready),
            ready_emitted: false,
            deferred: VecDeque::new(),
            outbox: VecDeque::new(),
            load_all_members,
            disabled,
            chunker: Chunker::default(),
            next_chunk_check: None,
            voice: HashMap::new(),
        }
    }

    /// Route one dispatch event: internal handling, ready gating, delivery.
    fn handle_dispatch(&mut self, event: Event) {
        if let Event::Ready(_) = event {
            // a mid-session ready follows a forced re-identify; the cached
            // view is kept rather than re-parsed
            debug!("ready after re-identify, keeping the cached view");
            return;
        }

        let kind = event.kind();
        let internal = is_internal(kind);
        if internal {
            self.handle_internal(&event);
        }

        let enabled = match kind {
            Some(kind) => !self.disabled.contains(kind),
            // events this library does not model are not surfaced
            None => false,
        };
        if !enabled {
            return;
        }

        if !self.ready_emitted && kind != Some("GUILD_CREATE") {
            self.deferred.push_back(event);
            return;
        }

        if !internal {
            self.state.update(&event);
        }
        self.outbox.push_back(SessionEvent::Event(event));
    }

    /// The session's own handling of bootstrap, chunk and voice events.
    fn handle_internal(&mut self, event: &Event) {
        match *event {
            Event::Resumed { ref trace } => trace!("session resumed: {:?}", trace),
            Event::ServerCreate(ref server) => {
                self.state.update(event);
                if self.load_all_members {
                    if let PossibleServer::Online(ref server) = *server {
                        if server.large && !server.members_complete() {
                            self.chunker.note_large(server.id);
                        }
                    }
                }
                self.advance_ready_gate();
            }
            Event::ServerMembersChunk { server_id, .. } => {
                self.state.update(event);
                if self.state.members_complete(server_id)
                    && self.chunker.complete(server_id)
                    && self.chunker.active
                {
                    self.ready();
                }
            }
            Event::VoiceStateUpdate(ref voice_state) => {
                self.state.update(event);
                if let Some(server_id) = voice_state.server_id {
                    let ours = voice_state.user_id == self.state.user().id;
                    if let Some(voice) = self.voice.get_mut(&server_id) {
                        voice.update_state(voice_state);
                        if ours && voice_state.channel_id.is_none() {
                            // our own disconnect retires the handle
                            self.voice.remove(&server_id);
                        }
                    }
                }
            }
            Event::VoiceServerUpdate {
                server_id,
                ref endpoint,
                ref token,
            } => {
                if let Some(voice) = server_id.and_then(|id| self.voice.get_mut(&id)) {
                    voice.update_server(endpoint, token);
                }
            }
            _ => {}
        }
    }

    /// Open the ready gate if the bootstrap conditions allow it: no servers
    /// left unavailable, and the member backfill (when enabled) handed off.
    fn advance_ready_gate(&mut self) {
        if self.ready_emitted || !self.state.unavailable_servers().is_empty() {
            return;
        }

        if self.load_all_members {
            if !self.chunker.active {
                self.chunker.active = true;
                for id in self.state.unfilled_servers() {
                    self.chunker.note_large(id);
                }
                // the first check runs immediately
                self.next_chunk_check = Some(Instant::now());
            }
        } else {
            self.ready();
        }
    }

    /// Emit `ready` exactly once, then drain the deferred dispatches in
    /// their arrival order.
    fn ready(&mut self) {
        if self.ready_emitted {
            return;
        }
        self.ready_emitted = true;
        self.outbox.push_back(SessionEvent::Ready);

        while let Some(event) = self.deferred.pop_front() {
            if !is_internal(event.kind()) {
                self.state.update(&event);
            }
            self.outbox.push_back(SessionEvent::Event(event));
        }
    }

    /// The periodic chunker check: ready when nothing is left, otherwise
    /// queue chunk requests for everything newly pending.
    fn run_chunk_check(&mut self, now: Instant) {
        self.next_chunk_check = Some(now + CHUNK_CHECK_INTERVAL);
        if self.chunker.check(now) {
            self.ready();
        }
    }

    async fn join_voice_channel(
        &mut self,
        channel_id: ChannelId,
        mute: bool,
        deaf: bool,
    ) -> Result<oneshot::Receiver<Result<VoiceSession>>> {
        let (server_id, bitrate) = match self.state.find_channel(channel_id) {
            Some(ChannelRef::Server(server, channel)) if channel.kind == ChannelType::Voice => {
                (server.id, channel.bitrate)
            }
            Some(_) => return Err(Error::Other("not a voice channel")),
            None => return Err(Error::Other("unknown channel")),
        };

        if self.voice.contains_key(&server_id) {
            return Err(Error::Other(
                "a voice connection for this server already exists",
            ));
        }

        let mut voice =
            VoiceConnection::new(server_id, self.state.user().id, self.sink.clone());
        let completion = voice
            .connect(channel_id, mute, deaf, bitrate, VOICE_JOIN_TIMEOUT)
            .await?;
        self.voice.insert(server_id, voice);
        Ok(completion)
    }

    /// Point the dispatcher and every voice handle at a fresh writer after
    /// the connection was re-established.
    fn refresh_sink(&mut self, sink: SharedSink) {
        for voice in self.voice.values_mut() {
            voice.set_sink(sink.clone());
        }
        self.sink = sink;
    }

    /// The soonest deadline among voice joins still in flight.
    fn next_join_deadline(&self) -> Option<Instant> {
        self.voice
            .values()
            .filter_map(|voice| voice.join_deadline())
            .min()
    }

    /// Reject voice joins whose deadline has passed and retire their handles.
    fn expire_joins(&mut self, now: Instant) {
        self.voice.retain(|_, voice| !voice.expire_join(now));
    }
}

/// Bookkeeping for the large-server member backfill.
///
/// A server ID lives in at most one of `pending` and `in_flight`, and in
/// neither once its members are fully loaded.
#[derive(Debug, Default)]
struct Chunker {
    /// Whether the bootstrap has handed control over.
    active: bool,
    /// Large servers awaiting a chunk request.
    pending: HashSet<ServerId>,
    /// Large servers whose chunk request has been dispatched.
    in_flight: HashSet<ServerId>,
    /// Request batches queued for paced sending.
    queue: VecDeque<Vec<ServerId>>,
    /// When the next queued batch may go out.
    next_send: Option<Instant>,
}

impl Chunker {
    /// Record a large server in need of a member backfill.
    fn note_large(&mut self, id: ServerId) {
        if !self.in_flight.contains(&id) {
            self.pending.insert(id);
        }
    }

    /// Whether every requested backfill has completed.
    fn is_done(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty() && self.queue.is_empty()
    }

    /// Periodic check. Returns true when all backfills are done; otherwise
    /// moves everything pending into flight and queues the chunk requests.
    fn check(&mut self, now: Instant) -> bool {
        if self.is_done() {
            return true;
        }
        if self.pending.is_empty() {
            return false;
        }

        let mut ids: Vec<ServerId> = self.pending.drain().collect();
        ids.sort_unstable();
        self.in_flight.extend(ids.iter().copied());

        for batch in ids.chunks(CHUNK_BATCH) {
            self.queue.push_back(batch.to_vec());
        }
        if self.next_send.is_none() {
            self.next_send = Some(now);
        }
        false
    }

    /// The next batch, if its send time has come. Re-arms the pacing delay.
    fn due_batch(&mut self, now: Instant) -> Option<Vec<ServerId>> {
        match self.next_send {
            Some(due) if due <= now => {
                let batch = self.queue.pop_front();
                self.next_send = if self.queue.is_empty() {
                    None
                } else {
                    Some(now + CHUNK_SEND_SPACING)
                };
                batch
            }
            _ => None,
        }
    }

    /// A server's member list is complete. Returns true when that was the
    /// last backfill outstanding.
    fn complete(&mut self, id: ServerId) -> bool {
        self.in_flight.remove(&id);
        self.is_done()
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

    fn ready_value(guilds: serde_json::Value) -> serde_json::Value {
        json!({
            "v": 6,
            "user": { "id": "1", "username": "bot", "discriminator": "0001", "avatar": null, "email": null, "verified": true, "bot": true },
            "session_id": "S",
            "guilds": guilds,
            "private_channels": [],
        })
    }

    fn online_guild(id: u64) -> serde_json::Value {
        json!({
            "id": id.to_string(),
            "name": format!("server {}", id),
            "icon": null,
            "owner_id": "7",
            "member_count": 1,
            "members": [{
                "user": { "id": "7", "username": "owner", "discriminator": "0001", "avatar": null },
            }],
            "channels": [
                { "id": (id * 100).to_string(), "type": 2, "name": "voice", "bitrate": 64000 },
                { "id": (id * 100 + 1).to_string(), "type": 0, "name": "general" },
            ],
        })
    }

    fn large_guild(id: u64, member_count: u64) -> serde_json::Value {
        json!({
            "id": id.to_string(),
            "name": format!("server {}", id),
            "icon": null,
            "owner_id": "7",
            "large": true,
            "member_count": member_count,
            "members": [{
                "user": { "id": "7", "username": "owner", "discriminator": "0001", "avatar": null },
            }],
        })
    }

    fn dispatcher(
        guilds: serde_json::Value,
        load_all_members: bool,
        disabled: &[&str],
    ) -> (Dispatcher, std::sync::Arc<std::sync::Mutex<Vec<crate::io::WireOut>>>) {
        let (sink, items) = RecordingSink::new();
        let ready: ReadyEvent = serde_json::from_value(ready_value(guilds)).unwrap();
        let mut dispatcher = Dispatcher::new(
            SharedSink::new(sink),
            &ready,
            load_all_members,
            disabled.iter().map(|s| s.to_string()).collect(),
        );
        dispatcher.advance_ready_gate();
        (dispatcher, items)
    }

    fn message_create(id: u64) -> Event {
        Event::decode(
            "MESSAGE_CREATE",
            json!({
                "id": id.to_string(),
                "channel_id": "4201",
                "content": "hi",
                "timestamp": "2016-01-01T00:00:00.000000+00:00",
                "author": { "id": "7", "username": "owner", "discriminator": "0001", "avatar": null },
            }),
        )
        .unwrap()
    }

    fn members_chunk(server: u64, ids: std::ops::Range<u64>) -> Event {
        let members: Vec<serde_json::Value> = ids
            .map(|id| {
                json!({
                    "user": { "id": id.to_string(), "username": format!("user{}", id), "discriminator": "0001", "avatar": null },
                })
            })
            .collect();
        Event::decode(
            "GUILD_MEMBERS_CHUNK",
            json!({ "guild_id": server.to_string(), "members": members }),
        )
        .unwrap()
    }

    fn drain(dispatcher: &mut Dispatcher) -> Vec<SessionEvent> {
        dispatcher.outbox.drain(..).collect()
    }

    #[tokio::test]
    async fn ready_fires_immediately_with_no_unavailable_servers() {
        let (mut dispatcher, _items) = dispatcher(json!([online_guild(42)]), false, &[]);
        let events = drain(&mut dispatcher);
        assert!(matches!(events[..], [SessionEvent::Ready]));
    }

    #[tokio::test]
    async fn dispatches_are_deferred_until_ready_then_drained_in_order() {
        let (mut dispatcher, _items) = dispatcher(
            json!([online_guild(42), { "id": "41", "unavailable": true }]),
            false,
            &[],
        );
        assert!(drain(&mut dispatcher).is_empty());

        dispatcher.handle_dispatch(message_create(500));
        dispatcher.handle_dispatch(message_create(501));
        assert!(drain(&mut dispatcher).is_empty());
        assert_eq!(dispatcher.deferred.len(), 2);

        dispatcher.handle_dispatch(
            Event::decode("GUILD_CREATE", online_guild(41)).unwrap(),
        );

        let events = drain(&mut dispatcher);
        assert!(matches!(events[0], SessionEvent::Ready));
        match (&events[1], &events[2]) {
            (
                SessionEvent::Event(Event::MessageCreate(first)),
                SessionEvent::Event(Event::MessageCreate(second)),
            ) => {
                assert_eq!(first.id, MessageId(500));
                assert_eq!(second.id, MessageId(501));
            }
            other => panic!("unexpected drain order: {:?}", other),
        }
        // the guild create itself is delivered inline, not deferred
        assert!(matches!(
            events[3],
            SessionEvent::Event(Event::ServerCreate(_))
        ));
        assert!(dispatcher.deferred.is_empty());
    }

    #[tokio::test]
    async fn ready_is_emitted_at_most_once() {
        let (mut dispatcher, _items) = dispatcher(json!([online_guild(42)]), false, &[]);
        dispatcher.ready();
        dispatcher.ready();
        let events = drain(&mut dispatcher);
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, SessionEvent::Ready))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn disabled_events_are_not_delivered_or_deferred() {
        let (mut dispatcher, _items) =
            dispatcher(json!([online_guild(42)]), false, &["MESSAGE_CREATE"]);
        drain(&mut dispatcher);

        dispatcher.handle_dispatch(message_create(500));
        assert!(drain(&mut dispatcher).is_empty());
        assert!(dispatcher.deferred.is_empty());
    }

    #[tokio::test]
    async fn mid_session_ready_keeps_the_cached_view() {
        let (mut dispatcher, _items) = dispatcher(json!([online_guild(42)]), false, &[]);
        drain(&mut dispatcher);

        let replacement = Event::decode("READY", ready_value(json!([]))).unwrap();
        dispatcher.handle_dispatch(replacement);
        assert_eq!(dispatcher.state.servers().count(), 1);
        assert!(drain(&mut dispatcher).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn chunker_batches_and_paces_requests() {
        let guilds: Vec<serde_json::Value> = (1..=120).map(|id| large_guild(id, 3)).collect();
        let (mut dispatcher, _items) = dispatcher(json!(guilds), true, &[]);

        // handoff happened at bootstrap; the first check is due immediately
        assert!(dispatcher.next_chunk_check.is_some());
        let now = Instant::now();
        dispatcher.run_chunk_check(now);
        assert!(drain(&mut dispatcher).is_empty());

        assert!(dispatcher.chunker.pending.is_empty());
        assert_eq!(dispatcher.chunker.in_flight.len(), 120);

        // three batches: 50, 50, 20, spaced one second apart
        let first = dispatcher.chunker.due_batch(now).unwrap();
        assert_eq!(first.len(), 50);
        assert!(dispatcher.chunker.due_batch(now + Duration::from_millis(500)).is_none());
        let second = dispatcher
            .chunker
            .due_batch(now + Duration::from_secs(1))
            .unwrap();
        assert_eq!(second.len(), 50);
        let third = dispatcher
            .chunker
            .due_batch(now + Duration::from_secs(2))
            .unwrap();
        assert_eq!(third.len(), 20);
        assert!(dispatcher.chunker.next_send.is_none());

        // every id went out exactly once
        let mut all: Vec<ServerId> = first
            .into_iter()
            .chain(second.into_iter())
            .chain(third.into_iter())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 120);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_waits_for_every_member_chunk() {
        let guilds: Vec<serde_json::Value> = (1..=3).map(|id| large_guild(id, 3)).collect();
        let (mut dispatcher, _items) = dispatcher(json!(guilds), true, &[]);

        let now = Instant::now();
        dispatcher.run_chunk_check(now);
        dispatcher.chunker.due_batch(now).unwrap();

        dispatcher.handle_dispatch(members_chunk(1, 10..12));
        dispatcher.handle_dispatch(members_chunk(2, 10..12));
        assert!(drain(&mut dispatcher).is_empty());

        dispatcher.handle_dispatch(members_chunk(3, 10..12));
        let events = drain(&mut dispatcher);
        assert!(events
            .iter()
            .any(|event| matches!(event, SessionEvent::Ready)));

        // sets are empty once everything is loaded
        assert!(dispatcher.chunker.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn chunker_with_nothing_to_do_reports_ready_on_first_check() {
        let (mut dispatcher, _items) = dispatcher(json!([online_guild(42)]), true, &[]);
        assert!(drain(&mut dispatcher).is_empty());

        dispatcher.run_chunk_check(Instant::now());
        let events = drain(&mut dispatcher);
        assert!(matches!(events[..], [SessionEvent::Ready]));
    }

    #[tokio::test]
    async fn voice_join_rejects_text_channels_and_duplicates() {
        let (mut dispatcher, _items) = dispatcher(json!([online_guild(42)]), false, &[]);
        drain(&mut dispatcher);

        // 4201 is the text channel of server 42
        assert!(dispatcher
            .join_voice_channel(ChannelId(4201), false, false)
            .await
            .is_err());
        assert!(dispatcher
            .join_voice_channel(ChannelId(9999), false, false)
            .await
            .is_err());

        assert!(dispatcher
            .join_voice_channel(ChannelId(4200), false, false)
            .await
            .is_ok());
        // second join on the same server is refused while the first lives
        assert!(dispatcher
            .join_voice_channel(ChannelId(4200), false, false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn voice_join_completes_from_routed_events() {
        let (mut dispatcher, items) = dispatcher(json!([online_guild(42)]), false, &[]);
        drain(&mut dispatcher);

        let completion = dispatcher
            .join_voice_channel(ChannelId(4200), false, false)
            .await
            .unwrap();

        dispatcher.handle_dispatch(
            Event::decode(
                "VOICE_STATE_UPDATE",
                json!({ "user_id": "1", "guild_id": "42", "channel_id": "4200", "session_id": "x" }),
            )
            .unwrap(),
        );
        dispatcher.handle_dispatch(
            Event::decode(
                "VOICE_SERVER_UPDATE",
                json!({ "guild_id": "42", "endpoint": "e", "token": "t" }),
            )
            .unwrap(),
        );

        let session = completion.await.unwrap().unwrap();
        assert_eq!(session.server_id, ServerId(42));
        assert_eq!(session.session_id, "x");
        assert_eq!(session.endpoint, "e");
        // the bitrate of the joined channel was applied before resolution
        assert_eq!(session.bitrate, Some(64000));
        assert!(dispatcher.voice.contains_key(&ServerId(42)));

        // the join command went over the wire
        let sent = sent_json(&items);
        assert_eq!(sent[0]["op"], json!(4));
        assert_eq!(sent[0]["d"]["channel_id"], json!(4200));
    }

    #[tokio::test]
    async fn own_voice_disconnect_retires_the_handle() {
        let (mut dispatcher, _items) = dispatcher(json!([online_guild(42)]), false, &[]);
        drain(&mut dispatcher);

        dispatcher
            .join_voice_channel(ChannelId(4200), false, false)
            .await
            .unwrap();
        dispatcher.handle_dispatch(
            Event::decode(
                "VOICE_STATE_UPDATE",
                json!({ "user_id": "1", "guild_id": "42", "channel_id": null, "session_id": "x" }),
            )
            .unwrap(),
        );
        assert!(!dispatcher.voice.contains_key(&ServerId(42)));
    }

    #[tokio::test(start_paused = true)]
    async fn voice_join_deadlines_expire() {
        let (mut dispatcher, _items) = dispatcher(json!([online_guild(42)]), false, &[]);
        drain(&mut dispatcher);

        let completion = dispatcher
            .join_voice_channel(ChannelId(4200), false, false)
            .await
            .unwrap();
        assert!(dispatcher.next_join_deadline().is_some());

        dispatcher.expire_joins(Instant::now() + Duration::from_secs(11));
        assert!(completion.await.unwrap().is_err());
        assert!(dispatcher.voice.is_empty());
        assert!(dispatcher.next_join_deadline().is_none());
    }
}
