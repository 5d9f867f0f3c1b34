//! Data models for `live` resources, i.e. those that are maintained by an
//! active gateway connection.
//!
//! Types in this category include `LiveServer`, `Presence` and so on.

use bitflags::bitflags;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_repr::{Deserialize_repr, Serialize_repr};

use super::{ChannelId, MessageId, Role, RoleId, ServerChannel, ServerId, User, UserId};

// Live Server

/// Live server information is provided and maintained actively by the gateway.
///
/// It is suitable for querying the constantly changing parts of a server,
/// such as its members and those members' presences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveServer {
    pub id: ServerId,
    pub name: String,
    pub icon: Option<String>,
    pub owner_id: UserId,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub joined_at: Option<DateTime<FixedOffset>>,

    /// Whether the member list was too large to deliver in full.
    ///
    /// Members of a large server must be backfilled with member chunk
    /// requests; until then `members` holds fewer than `member_count`
    /// entries.
    #[serde(default)]
    pub large: bool,
    /// The total number of members, including those not yet delivered.
    #[serde(default)]
    pub member_count: u64,

    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub channels: Vec<ServerChannel>,
    #[serde(default)]
    pub presences: Vec<Presence>,
    #[serde(default)]
    pub voice_states: Vec<VoiceState>,
    #[serde(default)]
    pub roles: Vec<Role>,

    #[serde(default)]
    pub afk_timeout: u64,
    #[serde(default)]
    pub afk_channel_id: Option<ChannelId>,
}

impl LiveServer {
    /// Returns the formatted URL of the server's icon.
    ///
    /// Returns None if the server does not have an icon.
    pub fn icon_url(&self) -> Option<String> {
        self.icon
            .as_ref()
            .map(|icon| format!(cdn_concat!("/icons/{}/{}.jpg"), self.id, icon))
    }

    /// Look up one of the server's channels by ID.
    pub fn channel(&self, id: ChannelId) -> Option<&ServerChannel> {
        self.channels.iter().find(|channel| channel.id == id)
    }

    /// Whether every member the server reports has been delivered.
    pub fn members_complete(&self) -> bool {
        self.members.len() as u64 >= self.member_count
    }
}

/// A server which may be unavailable
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PossibleServer<T> {
    /// An online server, for which more information is available
    Online(T),
    /// An offline server, the ID of which is known
    Offline {
        id: ServerId,
        #[serde(default)]
        unavailable: bool,
    },
}

impl<T> PossibleServer<T> {
    pub fn online(self) -> Option<T> {
        match self {
            PossibleServer::Online(server) => Some(server),
            PossibleServer::Offline { .. } => None,
        }
    }
}

impl PossibleServer<LiveServer> {
    pub fn id(&self) -> ServerId {
        match *self {
            PossibleServer::Offline { id, .. } => id,
            PossibleServer::Online(ref server) => server.id,
        }
    }
}

impl PossibleServer<super::Server> {
    pub fn id(&self) -> ServerId {
        match *self {
            PossibleServer::Offline { id, .. } => id,
            PossibleServer::Online(ref server) => server.id,
        }
    }
}

// Member

/// Information about a member of a server
///
/// https://discord.com/developers/docs/resources/guild#guild-member-object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// The user this member structure concerns.
    pub user: User,

    /// The user's server nickname.
    #[serde(default)]
    pub nick: Option<String>,

    /// The roles granted to the user
    #[serde(default)]
    pub roles: Vec<RoleId>,

    /// When the user joined this server.
    #[serde(default)]
    pub joined_at: Option<DateTime<FixedOffset>>,

    /// If the user has been muted by an administrator
    #[serde(default)]
    pub mute: bool,
    /// If the user has been deafened by an administrator
    #[serde(default)]
    pub deaf: bool,
}

impl Member {
    /// Get this member's nickname if present or their username otherwise.
    pub fn display_name(&self) -> &str {
        match self.nick.as_ref() {
            Some(name) => name,
            None => &self.user.name,
        }
    }
}

// Presence

/// A member's online status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    /// The user this presence belongs to.
    ///
    /// The wire carries a partial user object here; only the ID is kept.
    #[serde(rename = "user", deserialize_with = "crate::serial::deserialize_user_id")]
    pub user_id: UserId,

    /// The status of this user
    pub status: OnlineStatus,

    /// The game the user currently plays, if any.
    #[serde(default)]
    pub game: Option<Activity>,
}

impl Presence {
    /// The placeholder presence for a member delivered without one.
    pub fn offline(user_id: UserId) -> Presence {
        Presence {
            user_id,
            status: OnlineStatus::Offline,
            game: None,
        }
    }
}

/// A user's online presence status
///
/// https://discord.com/developers/docs/topics/gateway-events#update-presence-status-types
#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum OnlineStatus {
    /// The user will not receive notifications.
    #[serde(rename = "dnd")]
    DoNotDisturb,
    /// The user appears offline.
    #[serde(rename = "invisible")]
    Invisible,
    /// The user is presumed to not be online.
    #[serde(rename = "offline")]
    Offline,
    /// The user is online and active within discord.
    #[serde(rename = "online")]
    Online,
    /// The user will not receive notifications on a given device.
    #[serde(rename = "idle")]
    Idle,
}

/// Something a user is up to, attached to their presence.
///
/// https://discord.com/developers/docs/topics/gateway#activity-object
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Activity {
    /// The activity's name.
    pub name: String,

    #[serde(rename = "type", default)]
    pub kind: ActivityType,

    /// Stream url, set when `kind` is [`ActivityType::Streaming`].
    #[serde(default)]
    pub url: Option<String>,
}

impl Activity {
    /// An activity representing playing the named game.
    pub fn playing(name: impl Into<String>) -> Activity {
        Activity {
            name: name.into(),
            kind: ActivityType::Playing,
            url: None,
        }
    }

    /// An activity representing streaming at the given URL.
    pub fn streaming(name: impl Into<String>, url: impl Into<String>) -> Activity {
        Activity {
            name: name.into(),
            kind: ActivityType::Streaming,
            url: Some(url.into()),
        }
    }
}

/// A type of activity in a presence.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug, Default, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ActivityType {
    /// The user is playing a game
    #[default]
    Playing = 0,
    /// The user is streaming somewhere.
    Streaming = 1,
    /// The user is listening to music.
    Listening = 2,
    /// The user is watching something.
    Watching = 3,
    /// The user has set a custom text status.
    Custom = 4,
    /// The user is competing.
    Competing = 5,
}

// Voice States

/// A member's state within a voice channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceState {
    /// The user this voice state concerns.
    pub user_id: UserId,

    /// The voice channel they are connected to.
    pub channel_id: Option<ChannelId>,
    /// The server this voice state is about
    #[serde(rename = "guild_id", default)]
    pub server_id: Option<ServerId>,

    /// The session ID of this voice state
    pub session_id: String,

    /// If the user has muted themselves locally
    #[serde(rename = "self_mute", default)]
    pub mute: bool,
    /// If the user has deafened themselves locally
    #[serde(rename = "self_deaf", default)]
    pub deaf: bool,

    /// If the user has been muted by an administrator
    #[serde(rename = "mute", default)]
    pub server_mute: bool,
    /// If the user has been deafened by an administrator
    #[serde(rename = "deaf", default)]
    pub server_deaf: bool,

    /// Whether this user's permission to speak has been suppressed
    #[serde(default)]
    pub suppress: bool,
}

// Messages

/// Message transmitted over a text channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub content: String,
    // carry on if nonce is absent or for some reason not a string
    #[serde(deserialize_with = "crate::serial::ignore_errors")]
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub tts: bool,
    pub timestamp: DateTime<FixedOffset>,
    #[serde(default)]
    pub edited_timestamp: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(rename = "type", default)]
    pub kind: MessageType,

    pub author: User,
    #[serde(default)]
    pub mention_everyone: bool,
    #[serde(default)]
    pub mentions: Vec<User>,
    #[serde(default)]
    pub mention_roles: Vec<RoleId>,

    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Follows OEmbed standard
    #[serde(default)]
    pub embeds: Vec<Value>,

    #[serde(default)]
    pub flags: MessageFlags,
}

/// File upload attached to a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    /// Short filename for the attachment
    pub filename: String,
    /// Shorter URL with message and attachment id
    pub url: String,
    /// Longer URL with large hash
    pub proxy_url: String,
    /// Size of the file in bytes
    pub size: u64,
    /// Width if the file is an image
    #[serde(default)]
    pub width: Option<u64>,
    /// Height if the file is an image
    #[serde(default)]
    pub height: Option<u64>,
}

impl Attachment {
    /// Get the dimensions of the attachment if it is an image.
    pub fn dimensions(&self) -> Option<(u64, u64)> {
        if let (&Some(w), &Some(h)) = (&self.width, &self.height) {
            Some((w, h))
        } else {
            None
        }
    }
}

/// The type of a message
#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug, Default, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum MessageType {
    /// A regular, text-based message
    #[default]
    Default = 0,
    /// A recipient was added to the group
    GroupRecipientAdded = 1,
    /// A recipient was removed from the group
    GroupRecipientRemoved = 2,
    /// A group call was created
    GroupCall = 3,
    /// A group name was updated
    GroupNameChange = 4,
    /// A group icon was updated
    GroupIconChange = 5,
    /// A message was pinned
    MessagePinned = 6,
    /// A user joined a server and a welcome message was generated
    UserJoined = 7,
    /// A reply to another message
    Reply = 19,
    /// A message type this library does not model
    #[serde(other)]
    Unknown = 255,
}

bitflags! {
    /// Sets of flags that may be set on a message.
    ///
    /// See https://discord.com/developers/docs/resources/channel#message-object-message-flags
    #[derive(Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct MessageFlags: u16 {
        const CROSSPOSTED = 1 << 0;
        const IS_CROSSPOST = 1 << 1;
        const SUPPRESS_EMBEDS = 1 << 2;
        const SOURCE_MESSAGE_DELETED = 1 << 3;
        const URGENT = 1 << 4;
    }
}

impl Default for MessageFlags {
    fn default() -> Self {
        MessageFlags::empty()
    }
}
