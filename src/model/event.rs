//! Messages exchanged with the gateway.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::io::Packet;
use crate::serial::Eq;
use crate::{Error, Result};

use super::{
    Activity, Channel, ChannelId, CurrentUser, CurrentUserPatch, LiveServer, Member, Message,
    MessageId, OnlineStatus, PossibleServer, Presence, Role, RoleId, Server, ServerId, User,
    UserId, VoiceState,
};

/// Gateway opcodes, by their numeric identity on the wire.
pub mod opcode {
    pub const DISPATCH: u64 = 0;
    pub const HEARTBEAT: u64 = 1;
    pub const IDENTIFY: u64 = 2;
    pub const PRESENCE_UPDATE: u64 = 3;
    pub const VOICE_STATE_UPDATE: u64 = 4;
    pub const RESUME: u64 = 6;
    pub const RECONNECT: u64 = 7;
    pub const REQUEST_GUILD_MEMBERS: u64 = 8;
    pub const INVALID_SESSION: u64 = 9;
    pub const HELLO: u64 = 10;
    pub const HEARTBEAT_ACK: u64 = 11;
}

/// The close code the gateway answers a bad token with. Terminal.
pub const CLOSE_INVALID_TOKEN: u16 = 4004;

/// A JSON payload message sent to the gateway.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SentMessage {
    /// Used to trigger the initial handshake with the gateway.
    Identify {
        /// The opcode behind this event type.
        #[doc(hidden)]
        op: Eq<2>,

        /// The payload sent with this message.
        #[serde(rename = "d")]
        payload: IdentifyPayload,
    },

    /// Used to replay missed events when a disconnected client resumes.
    Resume {
        /// The opcode behind this event type.
        #[doc(hidden)]
        op: Eq<6>,

        /// The payload sent with this message.
        #[serde(rename = "d")]
        payload: ResumePayload,
    },

    /// Used to maintain an active gateway connection.
    ///
    /// Must be sent every `heartbeat_interval` milliseconds after the Hello
    /// payload is received. The inner `d` key is the last sequence number
    /// received by the client, or `None` if none has arrived yet.
    Heartbeat {
        /// The opcode behind this event type.
        #[doc(hidden)]
        op: Eq<1>,

        /// The last dispatch sequence number received by the client.
        #[serde(rename = "d")]
        last_sequence: Option<u64>,
    },

    /// Used to request the full member list of one or more large servers.
    ///
    /// The gateway answers with `GUILD_MEMBERS_CHUNK` dispatches of up to
    /// 1000 members each until every requested server has been sent.
    RequestGuildMembers {
        /// The opcode behind this event type.
        #[doc(hidden)]
        op: Eq<8>,

        /// The request parameters.
        #[serde(rename = "d")]
        payload: RequestGuildMembersPayload,
    },

    /// Sent when a client wants to join, move, or disconnect from a voice channel.
    UpdateVoiceState {
        /// The opcode behind this event type.
        #[doc(hidden)]
        op: Eq<4>,

        /// The update payload.
        #[serde(rename = "d")]
        payload: UpdateVoiceStatePayload,
    },

    /// Sent by the client to indicate a presence or status update.
    UpdatePresence {
        /// The opcode behind this event type.
        #[doc(hidden)]
        op: Eq<3>,

        /// The update payload.
        #[serde(rename = "d")]
        payload: UpdatePresencePayload,
    },
}

impl SentMessage {
    pub fn identify(payload: IdentifyPayload) -> SentMessage {
        SentMessage::Identify { op: Eq, payload }
    }

    pub fn resume(payload: ResumePayload) -> SentMessage {
        SentMessage::Resume { op: Eq, payload }
    }

    pub fn heartbeat(last_sequence: Option<u64>) -> SentMessage {
        SentMessage::Heartbeat { op: Eq, last_sequence }
    }

    pub fn request_guild_members(server_ids: Vec<ServerId>) -> SentMessage {
        SentMessage::RequestGuildMembers {
            op: Eq,
            payload: RequestGuildMembersPayload {
                server_ids,
                username_query: String::new(),
                limit: 0,
            },
        }
    }

    pub fn update_voice_state(payload: UpdateVoiceStatePayload) -> SentMessage {
        SentMessage::UpdateVoiceState { op: Eq, payload }
    }

    pub fn update_presence(payload: UpdatePresencePayload) -> SentMessage {
        SentMessage::UpdatePresence { op: Eq, payload }
    }
}

/// The payload sent along with the `Identify` message (opcode 2).
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyPayload {
    /// Authentication token.
    pub token: String,
    /// System fingerprinting information for discord analytics.
    pub properties: IdentifyProperties,

    /// Whether the gateway may compress inbound packets.
    pub compress: bool,
    /// Total number of members where the gateway will stop sending offline
    /// members in the server member list. Between 50 and 250.
    pub large_threshold: u64,
    /// The gateway protocol version spoken.
    pub v: u64,

    /// A pair of `(shard_id, total_shards)`, used for server sharding.
    /// Sent only when sharding was configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<(u8, u8)>,
}

/// A connection fingerprint of sorts, describing the client program.
///
/// Bots do not send normal user agent strings, so the gateway collects
/// the equivalent here.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyProperties {
    /// The current operating system.
    #[serde(rename = "$os")]
    pub os: String,
    /// For bot users, this is set as the current library.
    #[serde(rename = "$browser")]
    pub browser: String,
    /// For bot users, this is set as the current library.
    #[serde(rename = "$device")]
    pub device: String,
    #[serde(rename = "$referring_domain")]
    pub referring_domain: String,
    #[serde(rename = "$referrer")]
    pub referrer: String,
}

/// The payload sent along with the `Resume` message (opcode 6).
#[derive(Debug, Clone, Serialize)]
pub struct ResumePayload {
    /// The token of the authenticating user.
    pub token: String,
    /// The session ID assigned by the gateway during the interrupted session.
    pub session_id: String,
    /// The last sequence number received over the interrupted session.
    #[serde(rename = "seq")]
    pub last_sequence: u64,
}

/// The request payload sent along with the `RequestGuildMembers` message (opcode 8).
#[derive(Debug, Clone, Serialize)]
pub struct RequestGuildMembersPayload {
    /// The servers to download members for.
    #[serde(rename = "guild_id")]
    pub server_ids: Vec<ServerId>,

    /// Prefix that returned usernames must start with; the empty string
    /// matches all members.
    #[serde(rename = "query")]
    pub username_query: String,

    /// Maximum number of members to send matching the query; a limit of 0
    /// together with an empty query returns all members.
    pub limit: u64,
}

/// The request payload sent along with the `UpdateVoiceState` message (opcode 4).
#[derive(Debug, Clone, Serialize)]
pub struct UpdateVoiceStatePayload {
    /// The server to change the voice state in.
    #[serde(rename = "guild_id")]
    pub server_id: ServerId,
    /// The voice channel the client wants to join (`None` if disconnecting).
    pub channel_id: Option<ChannelId>,

    /// Whether the client is muted.
    pub self_mute: bool,
    /// Whether the client is deafened.
    pub self_deaf: bool,
}

/// The new presence that will be attached to the gateway's user.
#[derive(Debug, Clone, Serialize)]
pub struct UpdatePresencePayload {
    /// The user's new status.
    pub status: OnlineStatus,
    /// Whether or not the client is away from keyboard.
    pub afk: bool,
    /// Unix time (in milliseconds) of when the client went idle, or `None`
    /// if the client is not idle.
    pub since: Option<u64>,
    /// The game the client reports as playing.
    pub game: Option<Activity>,
}

/// A gateway frame after opcode dispatch but before event routing.
#[derive(Debug, Clone)]
pub enum GatewayMessage {
    /// A named event, with its sequence number when one was attached.
    Dispatch(Option<u64>, Event),
    /// The gateway requests an immediate heartbeat.
    Heartbeat(Option<u64>),
    /// The gateway asks the client to disconnect and reconnect.
    Reconnect,
    /// The current gateway session is invalid; the client must re-identify.
    InvalidSession,
    /// The first message of a connection, carrying the heartbeat interval.
    Hello(HelloPayload),
    /// Acknowledgement of a heartbeat sent by the client.
    HeartbeatAck,
    /// An opcode this library does not handle.
    Unknown(u64),
}

impl GatewayMessage {
    /// Route a generic packet by opcode.
    pub fn from_packet(packet: Packet) -> Result<GatewayMessage> {
        Ok(match packet.op {
            opcode::DISPATCH => {
                let kind = packet.kind.ok_or(Error::Protocol("dispatch without event name"))?;
                GatewayMessage::Dispatch(packet.sequence, Event::decode(&kind, packet.payload)?)
            }
            opcode::HEARTBEAT => GatewayMessage::Heartbeat(
                serde_json::from_value(packet.payload).unwrap_or_default(),
            ),
            opcode::RECONNECT => GatewayMessage::Reconnect,
            opcode::INVALID_SESSION => GatewayMessage::InvalidSession,
            opcode::HELLO => {
                GatewayMessage::Hello(serde_json::from_value(packet.payload)?)
            }
            opcode::HEARTBEAT_ACK => GatewayMessage::HeartbeatAck,
            other => GatewayMessage::Unknown(other),
        })
    }
}

/// The data (`d`) field of a gateway `Hello` message.
#[derive(Debug, Clone, Deserialize)]
pub struct HelloPayload {
    /// Interval (in milliseconds) the client should heartbeat with.
    pub heartbeat_interval: u64,

    /// The trace of gateway servers involved in serving this connection.
    #[serde(rename = "_trace", default)]
    pub trace: Vec<String>,
}

/// A named event dispatched by the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "t", content = "d")]
pub enum Event {
    /// The first event of a fresh session, containing the initial state.
    ///
    /// Received again mid-session only after the connection had to
    /// re-identify instead of resuming.
    #[serde(rename = "READY")]
    Ready(ReadyEvent),
    /// The connection has successfully resumed after a disconnect.
    #[serde(rename = "RESUMED")]
    Resumed {
        /// The trace of gateway servers involved in serving this connection.
        #[serde(rename = "_trace", default)]
        trace: Vec<String>,
    },

    /// A server has become available: delivered during startup for every
    /// server in the ready list, when an unavailable server comes back, and
    /// when the logged-in user joins a new server.
    #[serde(rename = "GUILD_CREATE")]
    ServerCreate(PossibleServer<LiveServer>),
    /// A server's static settings have changed.
    #[serde(rename = "GUILD_UPDATE")]
    ServerUpdate(Server),
    /// A server has become unavailable, or the user was removed from it.
    #[serde(rename = "GUILD_DELETE")]
    ServerDelete(PossibleServer<Server>),

    #[serde(rename = "GUILD_MEMBER_ADD")]
    ServerMemberAdd {
        #[serde(rename = "guild_id")]
        server_id: ServerId,
        #[serde(flatten)]
        member: Member,
    },
    /// A member's roles or nickname have changed.
    #[serde(rename = "GUILD_MEMBER_UPDATE")]
    ServerMemberUpdate {
        #[serde(rename = "guild_id")]
        server_id: ServerId,
        #[serde(default)]
        roles: Vec<RoleId>,
        user: User,
        #[serde(default)]
        nick: Option<String>,
    },
    #[serde(rename = "GUILD_MEMBER_REMOVE")]
    ServerMemberRemove {
        #[serde(rename = "guild_id")]
        server_id: ServerId,
        user: User,
    },
    /// A slice of a large server's member list, answering a chunk request.
    #[serde(rename = "GUILD_MEMBERS_CHUNK")]
    ServerMembersChunk {
        #[serde(rename = "guild_id")]
        server_id: ServerId,
        members: Vec<Member>,
    },

    #[serde(rename = "GUILD_ROLE_CREATE")]
    ServerRoleCreate {
        #[serde(rename = "guild_id")]
        server_id: ServerId,
        role: Role,
    },
    #[serde(rename = "GUILD_ROLE_UPDATE")]
    ServerRoleUpdate {
        #[serde(rename = "guild_id")]
        server_id: ServerId,
        role: Role,
    },
    #[serde(rename = "GUILD_ROLE_DELETE")]
    ServerRoleDelete {
        #[serde(rename = "guild_id")]
        server_id: ServerId,
        role_id: RoleId,
    },

    #[serde(rename = "CHANNEL_CREATE")]
    ChannelCreate(Channel),
    #[serde(rename = "CHANNEL_UPDATE")]
    ChannelUpdate(Channel),
    #[serde(rename = "CHANNEL_DELETE")]
    ChannelDelete(Channel),

    #[serde(rename = "MESSAGE_CREATE")]
    MessageCreate(Message),
    /// A message has been edited, either by the user or the system.
    #[serde(rename = "MESSAGE_UPDATE")]
    MessageUpdate {
        id: MessageId,
        channel_id: ChannelId,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        author: Option<User>,
        #[serde(default)]
        edited_timestamp: Option<chrono::DateTime<chrono::FixedOffset>>,
    },
    #[serde(rename = "MESSAGE_DELETE")]
    MessageDelete {
        #[serde(rename = "id")]
        message_id: MessageId,
        channel_id: ChannelId,
    },

    /// A member's presence (status or game) has changed.
    #[serde(rename = "PRESENCE_UPDATE")]
    PresenceUpdate {
        #[serde(rename = "guild_id", default)]
        server_id: Option<ServerId>,
        #[serde(default)]
        roles: Option<Vec<RoleId>>,
        #[serde(flatten)]
        presence: Presence,
    },
    /// A user is typing; considered to last 5 seconds.
    #[serde(rename = "TYPING_START")]
    TypingStart {
        channel_id: ChannelId,
        user_id: UserId,
        #[serde(with = "chrono::serde::ts_seconds")]
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// An update to the logged-in user's information.
    #[serde(rename = "USER_UPDATE")]
    UserUpdate(CurrentUserPatch),

    /// A member's voice state has changed.
    #[serde(rename = "VOICE_STATE_UPDATE")]
    VoiceStateUpdate(VoiceState),
    /// Credentials for a server's voice endpoint are available.
    #[serde(rename = "VOICE_SERVER_UPDATE")]
    VoiceServerUpdate {
        #[serde(rename = "guild_id", default)]
        server_id: Option<ServerId>,
        #[serde(default)]
        endpoint: Option<String>,
        token: String,
    },

    /// An event type not covered by the above.
    #[serde(other)]
    Unknown,
}

impl Event {
    /// Decode a dispatch payload under its wire event name.
    pub fn decode(kind: &str, payload: Value) -> Result<Event> {
        const KNOWN_KINDS: &[&str] = &[
            "READY",
            "RESUMED",
            "GUILD_CREATE",
            "GUILD_UPDATE",
            "GUILD_DELETE",
            "GUILD_MEMBER_ADD",
            "GUILD_MEMBER_UPDATE",
            "GUILD_MEMBER_REMOVE",
            "GUILD_MEMBERS_CHUNK",
            "GUILD_ROLE_CREATE",
            "GUILD_ROLE_UPDATE",
            "GUILD_ROLE_DELETE",
            "CHANNEL_CREATE",
            "CHANNEL_UPDATE",
            "CHANNEL_DELETE",
            "MESSAGE_CREATE",
            "MESSAGE_UPDATE",
            "MESSAGE_DELETE",
            "PRESENCE_UPDATE",
            "TYPING_START",
            "USER_UPDATE",
            "VOICE_STATE_UPDATE",
            "VOICE_SERVER_UPDATE",
        ];
        // serde's adjacently-tagged `#[serde(other)]` fallback only accepts a
        // unit payload, so an unrecognized kind with a non-unit `d` would
        // otherwise fail to decode instead of falling back to `Unknown`.
        if !KNOWN_KINDS.contains(&kind) {
            return Ok(Event::Unknown);
        }
        serde_json::from_value(json!({ "t": kind, "d": payload })).map_err(Error::Json)
    }

    /// The wire name of this event, or `None` for events this library does
    /// not model.
    pub fn kind(&self) -> Option<&'static str> {
        Some(match self {
            Event::Ready(_) => "READY",
            Event::Resumed { .. } => "RESUMED",
            Event::ServerCreate(_) => "GUILD_CREATE",
            Event::ServerUpdate(_) => "GUILD_UPDATE",
            Event::ServerDelete(_) => "GUILD_DELETE",
            Event::ServerMemberAdd { .. } => "GUILD_MEMBER_ADD",
            Event::ServerMemberUpdate { .. } => "GUILD_MEMBER_UPDATE",
            Event::ServerMemberRemove { .. } => "GUILD_MEMBER_REMOVE",
            Event::ServerMembersChunk { .. } => "GUILD_MEMBERS_CHUNK",
            Event::ServerRoleCreate { .. } => "GUILD_ROLE_CREATE",
            Event::ServerRoleUpdate { .. } => "GUILD_ROLE_UPDATE",
            Event::ServerRoleDelete { .. } => "GUILD_ROLE_DELETE",
            Event::ChannelCreate(_) => "CHANNEL_CREATE",
            Event::ChannelUpdate(_) => "CHANNEL_UPDATE",
            Event::ChannelDelete(_) => "CHANNEL_DELETE",
            Event::MessageCreate(_) => "MESSAGE_CREATE",
            Event::MessageUpdate { .. } => "MESSAGE_UPDATE",
            Event::MessageDelete { .. } => "MESSAGE_DELETE",
            Event::PresenceUpdate { .. } => "PRESENCE_UPDATE",
            Event::TypingStart { .. } => "TYPING_START",
            Event::UserUpdate(_) => "USER_UPDATE",
            Event::VoiceStateUpdate(_) => "VOICE_STATE_UPDATE",
            Event::VoiceServerUpdate { .. } => "VOICE_SERVER_UPDATE",
            Event::Unknown => return None,
        })
    }
}

/// The "Ready" event, containing the initial state.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyEvent {
    /// Active gateway version
    #[serde(rename = "v")]
    pub version: u64,

    /// Logged in user.
    pub user: CurrentUser,

    /// The ID of the current session, used for resuming.
    pub session_id: String,

    /// The servers the user is in.
    ///
    /// Servers delivered unavailable here are eventually populated by
    /// discrete `GUILD_CREATE` events.
    #[serde(rename = "guilds")]
    pub servers: Vec<PossibleServer<LiveServer>>,

    /// The direct and group message channels the user participates in.
    #[serde(default)]
    pub private_channels: Vec<Channel>,

    /// For bot users, the shard info for this session; the shard ID used
    /// and the total number of shards.
    #[serde(default)]
    pub shard: Option<(u8, u8)>,

    /// The trace of gateway servers involved in serving this connection.
    #[serde(rename = "_trace", default)]
    pub trace: Vec<String>,
}
