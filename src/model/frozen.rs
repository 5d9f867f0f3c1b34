//! Data models for resources shaped like the Discord REST API returns them.
//!
//! The name `frozen` refers to data that rarely changes once fetched, such
//! as account identity and channel configuration. Resources maintained by an
//! active gateway connection live in the sister module `live`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use serde_repr::{Deserialize_repr, Serialize_repr};

// IDs

macro_rules! snowflake {
    ($(#[$attr:meta] $name:ident;)*) => {
        $(
            #[$attr]
            ///
            /// Identifiers can be debug-printed using the `{:?}` specifier, or their
            /// raw number value printed using the `{}` specifier.
            #[derive(Copy, Clone, Hash, Eq, PartialEq, Debug, Ord, PartialOrd)]
            #[derive(Serialize, Deserialize)]
            pub struct $name(#[serde(deserialize_with = "crate::serial::deserialize_id")] pub u64);

            impl $name {
                /// Get the creation date of the object referred to by this ID.
                ///
                /// Discord generates identifiers using a scheme based on [Twitter
                /// Snowflake](https://en.wikipedia.org/wiki/Snowflake_ID).
                pub fn creation_date(&self) -> DateTime<Utc> {
                    let secs = 1420070400 + (self.0 >> 22) / 1000;
                    DateTime::from_timestamp(secs as i64, 0).unwrap_or_default()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    }
}

snowflake! {
    /// Bots are identified sometimes by their application ID
    ApplicationId;
    /// An identifier for a User
    UserId;
    /// An identifier for a Server
    ServerId;
    /// An identifier for a Channel
    ChannelId;
    /// An identifier for a Message
    MessageId;
    /// An identifier for a Role
    RoleId;
    /// An identifier for an Emoji
    EmojiId;
}

// Users

/// Public user information, accessible without any relationship to that user.
///
/// https://discord.com/developers/docs/resources/user#user-object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// The user's ID
    pub id: UserId,

    /// The user's username, not unique across the platform.
    #[serde(rename = "username")]
    pub name: String,
    /// The user's Discord-tag
    #[serde(deserialize_with = "crate::serial::deserialize_discrim")]
    pub discriminator: u16,

    /// The user's avatar hash
    pub avatar: Option<String>,

    /// Whether the user belongs to an OAuth2 application
    #[serde(default)]
    pub bot: bool,
}

impl User {
    /// Returns the formatted URL of the user's icon.
    ///
    /// Returns None if the user does not have an avatar.
    pub fn avatar_url(&self) -> Option<String> {
        self.avatar
            .as_ref()
            .map(|avatar_hash| format!(cdn_concat!("/avatars/{}/{}.jpg"), self.id, avatar_hash))
    }
}

/// Information about the logged-in user
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CurrentUser {
    pub id: UserId,
    pub username: String,
    #[serde(deserialize_with = "crate::serial::deserialize_discrim")]
    pub discriminator: u16,
    pub avatar: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub bot: bool,
    #[serde(default)]
    pub mfa_enabled: bool,
}

/// A partial update to the logged-in user, carried by `USER_UPDATE`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CurrentUserPatch {
    pub id: Option<UserId>,
    pub username: Option<String>,
    #[serde(default, deserialize_with = "crate::serial::deserialize_discrim_opt")]
    pub discriminator: Option<u16>,
    pub avatar: Option<String>,
    pub email: Option<String>,
    pub verified: Option<bool>,
    pub mfa_enabled: Option<bool>,
    #[serde(default)]
    pub bot: Option<bool>,
}

impl CurrentUser {
    pub fn update_from(&mut self, patch: &CurrentUserPatch) {
        update_field(&mut self.id, &patch.id);
        update_field(&mut self.username, &patch.username);
        update_field(&mut self.discriminator, &patch.discriminator);
        update_field_opt(&mut self.avatar, &patch.avatar);
        update_field_opt(&mut self.email, &patch.email);
        update_field(&mut self.verified, &patch.verified);
        update_field(&mut self.mfa_enabled, &patch.mfa_enabled);
        update_field(&mut self.bot, &patch.bot);
    }
}

fn update_field<T: Clone>(item: &mut T, patch: &Option<T>) {
    if let Some(value) = patch.clone() {
        *item = value;
    }
}

fn update_field_opt<T: Clone>(item: &mut Option<T>, patch: &Option<T>) {
    if let Some(value) = patch.clone() {
        *item = Some(value);
    }
}

// Servers

/// Static information about a server, as carried by `GUILD_UPDATE`.
///
/// The gateway-maintained counterpart with members and presences is
/// `LiveServer` in the `live` module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    /// The ID of the server.
    pub id: ServerId,
    /// The name of the server (2-100 characters).
    pub name: String,
    /// The icon hash of the server.
    pub icon: Option<String>,
    /// The user who owns the server.
    pub owner_id: UserId,
    /// The voice region the server is hosted in.
    #[serde(default)]
    pub region: Option<String>,
    /// Seconds of inactivity after which voice users are moved to the AFK channel.
    #[serde(default)]
    pub afk_timeout: u64,
    /// The AFK voice channel, if one is configured.
    #[serde(default)]
    pub afk_channel_id: Option<ChannelId>,
    /// The bar members must pass before participating.
    #[serde(default)]
    pub verification_level: VerificationLevel,
}

impl Server {
    /// Returns the formatted URL of the server's icon.
    ///
    /// Returns None if the server does not have an icon.
    pub fn icon_url(&self) -> Option<String> {
        self.icon
            .as_ref()
            .map(|icon| format!(cdn_concat!("/icons/{}/{}.jpg"), self.id, icon))
    }
}

/// The verification bar members must pass before participating in a server.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug, Default, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum VerificationLevel {
    /// Unrestricted.
    #[default]
    Off = 0,
    /// Must have a verified email on their account.
    Low = 1,
    /// Must be registered on Discord for longer than 5 minutes.
    Medium = 2,
    /// Must be a member of the server for longer than 10 minutes.
    High = 3,
    /// Must have a verified phone number.
    Phone = 4,
}

/// A role granting permissions to members of a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    /// The permission bit set granted by this role.
    #[serde(deserialize_with = "crate::serial::deserialize_id")]
    pub permissions: u64,
    /// Color in `0xRRGGBB` form.
    #[serde(default)]
    pub color: u64,
    #[serde(default)]
    pub hoist: bool,
    #[serde(default)]
    pub managed: bool,
    #[serde(default)]
    pub mentionable: bool,
    #[serde(default)]
    pub position: i64,
}

// Channels

/// The type tag of a channel.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ChannelType {
    /// A text channel in a server
    Text = 0,
    /// A direct message channel between the client and another user
    Private = 1,
    /// A voice channel in a server
    Voice = 2,
    /// A group direct message channel
    Group = 3,
    /// An organizational category that contains channels
    Category = 4,
    /// A channel that users can follow and crosspost into their own server
    Announcement = 5,
    /// A channel type this library does not model
    #[serde(other)]
    Unknown = 255,
}

/// A channel that belongs to a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerChannel {
    pub id: ChannelId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ChannelType,

    /// The server this channel belongs to.
    ///
    /// Absent when the channel arrives nested in a `GUILD_CREATE`.
    #[serde(rename = "guild_id", default)]
    pub server_id: Option<ServerId>,

    /// Sorting position within the channel list.
    #[serde(default)]
    pub position: i64,
    /// The category this channel is sorted under.
    #[serde(default)]
    pub parent_id: Option<ChannelId>,

    /// The channel topic; text channels only.
    #[serde(default)]
    pub topic: Option<String>,

    /// The audio bitrate in bits; voice channels only.
    #[serde(default)]
    pub bitrate: Option<u64>,
    /// Maximum number of simultaneous voice members; voice channels only.
    #[serde(default)]
    pub user_limit: Option<u64>,
}

/// A direct message or group channel with one or more recipients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateChannel {
    pub id: ChannelId,
    #[serde(rename = "type")]
    pub kind: ChannelType,
    #[serde(default)]
    pub recipients: Vec<User>,
    #[serde(default)]
    pub last_message_id: Option<MessageId>,
}

impl PrivateChannel {
    /// The single recipient of a direct message channel.
    pub fn recipient(&self) -> Option<&User> {
        self.recipients.first()
    }
}

/// Any channel the client can observe.
#[derive(Debug, Clone)]
pub enum Channel {
    /// A channel within a server
    Server(ServerChannel),
    /// A direct or group message channel
    Private(PrivateChannel),
}

impl Channel {
    pub fn id(&self) -> ChannelId {
        match self {
            Channel::Server(channel) => channel.id,
            Channel::Private(channel) => channel.id,
        }
    }

    pub fn kind(&self) -> ChannelType {
        match self {
            Channel::Server(channel) => channel.kind,
            Channel::Private(channel) => channel.kind,
        }
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(d)?;
        let kind = value
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| D::Error::missing_field("type"))?;

        match kind {
            1 | 3 => PrivateChannel::deserialize(value)
                .map(Channel::Private)
                .map_err(D::Error::custom),
            _ => ServerChannel::deserialize(value)
                .map(Channel::Server)
                .map_err(D::Error::custom),
        }
    }
}

impl Serialize for Channel {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Channel::Server(channel) => channel.serialize(s),
            Channel::Private(channel) => channel.serialize(s),
        }
    }
}
