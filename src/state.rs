//! In-memory view of the connected account, maintained from gateway events.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use crate::model::*;

/// Known state composed from the initial `READY` bootstrap and the event
/// stream that follows it.
///
/// The state is owned by the session and mutated only on its worker; event
/// application is not re-entrant.
#[derive(Debug, Clone)]
pub struct State {
    user: CurrentUser,
    session_id: String,
    private_channels: Vec<PrivateChannel>,
    servers: BTreeMap<ServerId, LiveServer>,
    /// Servers known to exist whose data the gateway is still withholding.
    unavailable: HashSet<ServerId>,
}

/// A channel looked up by ID, which may sit inside a server or stand alone.
#[derive(Debug, Clone, Copy)]
pub enum ChannelRef<'a> {
    /// A channel within a server
    Server(&'a LiveServer, &'a ServerChannel),
    /// A direct or group message channel
    Private(&'a PrivateChannel),
}

impl State {
    /// Create a new state from an initial `ReadyEvent`.
    pub fn new(ready: &ReadyEvent) -> State {
        let mut servers = BTreeMap::new();
        let mut unavailable = HashSet::new();

        for server in &ready.servers {
            match server {
                PossibleServer::Online(server) => {
                    servers.insert(server.id, server.clone());
                }
                PossibleServer::Offline { id, .. } => {
                    unavailable.insert(*id);
                }
            }
        }

        State {
            user: ready.user.clone(),
            session_id: ready.session_id.clone(),
            private_channels: ready
                .private_channels
                .iter()
                .filter_map(|channel| match channel {
                    Channel::Private(channel) => Some(channel.clone()),
                    Channel::Server(channel) => {
                        warn!("server channel {} in ready private channels", channel.id);
                        None
                    }
                })
                .collect(),
            servers,
            unavailable,
        }
    }

    /// Update the state according to the event.
    pub fn update(&mut self, event: &Event) {
        match *event {
            Event::UserUpdate(ref patch) => self.user.update_from(patch),
            Event::ServerCreate(PossibleServer::Online(ref server)) => {
                self.unavailable.remove(&server.id);
                self.servers.insert(server.id, server.clone());
            }
            Event::ServerCreate(PossibleServer::Offline { id, .. }) => {
                self.unavailable.insert(id);
            }
            Event::ServerUpdate(ref update) => {
                if let Some(server) = self.servers.get_mut(&update.id) {
                    server.name = update.name.clone();
                    server.icon = update.icon.clone();
                    server.owner_id = update.owner_id;
                    server.region = update.region.clone();
                    server.afk_timeout = update.afk_timeout;
                    server.afk_channel_id = update.afk_channel_id;
                } else {
                    debug!("update to unknown server {}", update.id);
                }
            }
            Event::ServerDelete(ref server) => {
                let id = server.id();
                self.servers.remove(&id);
                match *server {
                    PossibleServer::Offline {
                        unavailable: true, ..
                    } => {
                        // outage rather than removal; expect it back
                        self.unavailable.insert(id);
                    }
                    _ => {
                        self.unavailable.remove(&id);
                    }
                }
            }
            Event::ServerMemberAdd {
                server_id,
                ref member,
            } => {
                if let Some(server) = self.servers.get_mut(&server_id) {
                    server.member_count += 1;
                    server.members.push(member.clone());
                }
            }
            Event::ServerMemberUpdate {
                server_id,
                ref roles,
                ref user,
                ref nick,
            } => {
                if let Some(server) = self.servers.get_mut(&server_id) {
                    match server.members.iter_mut().find(|m| m.user.id == user.id) {
                        Some(member) => {
                            member.user = user.clone();
                            member.roles = roles.clone();
                            member.nick = nick.clone();
                        }
                        None => debug!("update to unknown member {} of {}", user.id, server_id),
                    }
                }
            }
            Event::ServerMemberRemove { server_id, ref user } => {
                if let Some(server) = self.servers.get_mut(&server_id) {
                    server.member_count = server.member_count.saturating_sub(1);
                    server.members.retain(|m| m.user.id != user.id);
                }
            }
            Event::ServerMembersChunk {
                server_id,
                ref members,
            } => self.apply_member_chunk(server_id, members),
            Event::ServerRoleCreate { server_id, ref role } => {
                if let Some(server) = self.servers.get_mut(&server_id) {
                    server.roles.push(role.clone());
                }
            }
            Event::ServerRoleUpdate { server_id, ref role } => {
                if let Some(server) = self.servers.get_mut(&server_id) {
                    if let Some(slot) = server.roles.iter_mut().find(|r| r.id == role.id) {
                        *slot = role.clone();
                    }
                }
            }
            Event::ServerRoleDelete { server_id, role_id } => {
                if let Some(server) = self.servers.get_mut(&server_id) {
                    server.roles.retain(|r| r.id != role_id);
                }
            }
            Event::ChannelCreate(ref channel) | Event::ChannelUpdate(ref channel) => {
                self.upsert_channel(channel)
            }
            Event::ChannelDelete(ref channel) => match channel {
                Channel::Private(channel) => {
                    self.private_channels.retain(|c| c.id != channel.id);
                }
                Channel::Server(channel) => {
                    if let Some(id) = channel.server_id {
                        if let Some(server) = self.servers.get_mut(&id) {
                            server.channels.retain(|c| c.id != channel.id);
                        }
                    }
                }
            },
            Event::PresenceUpdate {
                server_id,
                ref presence,
                ..
            } => {
                if let Some(server) = server_id.and_then(|id| self.servers.get_mut(&id)) {
                    match server
                        .presences
                        .iter_mut()
                        .find(|p| p.user_id == presence.user_id)
                    {
                        Some(slot) => *slot = presence.clone(),
                        None => server.presences.push(presence.clone()),
                    }
                }
            }
            Event::VoiceStateUpdate(ref state) => {
                if let Some(server) = state.server_id.and_then(|id| self.servers.get_mut(&id)) {
                    server.voice_states.retain(|vs| vs.user_id != state.user_id);
                    if state.channel_id.is_some() {
                        server.voice_states.push(state.clone());
                    }
                }
            }
            _ => {}
        }
    }

    /// Insert or replace a channel wherever it lives.
    fn upsert_channel(&mut self, channel: &Channel) {
        match channel {
            Channel::Private(channel) => {
                match self.private_channels.iter_mut().find(|c| c.id == channel.id) {
                    Some(slot) => *slot = channel.clone(),
                    None => self.private_channels.push(channel.clone()),
                }
            }
            Channel::Server(channel) => {
                let Some(server) = channel.server_id.and_then(|id| self.servers.get_mut(&id))
                else {
                    debug!("channel {} update for an unknown server", channel.id);
                    return;
                };
                match server.channels.iter_mut().find(|c| c.id == channel.id) {
                    Some(slot) => *slot = channel.clone(),
                    None => server.channels.push(channel.clone()),
                }
            }
        }
    }

    /// Fold a member chunk into the server's member list.
    ///
    /// Members not seen before are appended with a default offline presence;
    /// members already known are left untouched.
    fn apply_member_chunk(&mut self, server_id: ServerId, members: &[Member]) {
        let Some(server) = self.servers.get_mut(&server_id) else {
            debug!("member chunk for unknown server {}", server_id);
            return;
        };

        for member in members {
            let user_id = member.user.id;
            if server.members.iter().any(|m| m.user.id == user_id) {
                continue;
            }
            server.members.push(member.clone());
            if !server.presences.iter().any(|p| p.user_id == user_id) {
                server.presences.push(Presence::offline(user_id));
            }
        }
    }

    /// The logged-in user.
    #[inline]
    pub fn user(&self) -> &CurrentUser {
        &self.user
    }

    /// The ID of the current gateway session.
    #[inline]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The servers the client is a member of.
    pub fn servers(&self) -> impl Iterator<Item = &LiveServer> {
        self.servers.values()
    }

    /// Look up a server by its ID.
    pub fn server(&self, id: ServerId) -> Option<&LiveServer> {
        self.servers.get(&id)
    }

    /// The direct and group message channels of the client.
    pub fn private_channels(&self) -> &[PrivateChannel] {
        &self.private_channels
    }

    /// Find the direct message channel with the given recipient.
    pub fn private_channel_with(&self, recipient: UserId) -> Option<&PrivateChannel> {
        self.private_channels
            .iter()
            .find(|channel| channel.recipient().map(|user| user.id) == Some(recipient))
    }

    /// Look up a channel anywhere in the known state.
    pub fn find_channel(&self, id: ChannelId) -> Option<ChannelRef<'_>> {
        for server in self.servers.values() {
            if let Some(channel) = server.channel(id) {
                return Some(ChannelRef::Server(server, channel));
            }
        }
        self.private_channels
            .iter()
            .find(|channel| channel.id == id)
            .map(ChannelRef::Private)
    }

    /// Servers delivered unavailable that have not yet come online.
    pub fn unavailable_servers(&self) -> &HashSet<ServerId> {
        &self.unavailable
    }

    /// Large servers whose member lists have not been fully delivered.
    pub fn unfilled_servers(&self) -> Vec<ServerId> {
        self.servers
            .values()
            .filter(|server| server.large && !server.members_complete())
            .map(|server| server.id)
            .collect()
    }

    /// Whether the server's member list holds every reported member.
    pub fn members_complete(&self, id: ServerId) -> bool {
        self.servers
            .get(&id)
            .map(|server| server.members_complete())
            // a server we no longer know cannot be waited on
            .unwrap_or(true)
    }

    /// The total count of members not yet delivered across all servers.
    pub fn unknown_members(&self) -> u64 {
        self.servers
            .values()
            .map(|server| server.member_count.saturating_sub(server.members.len() as u64))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn member_value(id: u64, name: &str) -> serde_json::Value {
        json!({
            "user": { "id": id.to_string(), "username": name, "discriminator": "0001", "avatar": null },
            "roles": [],
            "mute": false,
            "deaf": false,
        })
    }

    fn ready_fixture() -> ReadyEvent {
        serde_json::from_value::<ReadyEvent>(json!({
            "v": 6,
            "user": { "id": "1", "username": "bot", "discriminator": "0001", "avatar": null, "email": null, "verified": true, "bot": true },
            "session_id": "S",
            "guilds": [
                { "id": "41", "unavailable": true },
                {
                    "id": "42",
                    "name": "small",
                    "icon": null,
                    "owner_id": "7",
                    "member_count": 1,
                    "members": [member_value(7, "owner")],
                },
            ],
            "private_channels": [
                { "id": "9", "type": 1, "recipients": [{ "id": "8", "username": "friend", "discriminator": "0002", "avatar": null }] }
            ],
        }))
        .unwrap()
    }

    fn large_server_create(id: u64, member_count: u64, members: Vec<serde_json::Value>) -> Event {
        Event::decode(
            "GUILD_CREATE",
            json!({
                "id": id.to_string(),
                "name": "big",
                "icon": null,
                "owner_id": "7",
                "large": true,
                "member_count": member_count,
                "members": members,
            }),
        )
        .unwrap()
    }

    #[test]
    fn bootstrap_partitions_available_and_unavailable() {
        let state = State::new(&ready_fixture());
        assert_eq!(state.session_id(), "S");
        assert_eq!(state.user().id, UserId(1));
        assert_eq!(state.servers().count(), 1);
        assert!(state.unavailable_servers().contains(&ServerId(41)));
        assert_eq!(state.private_channel_with(UserId(8)).unwrap().id, ChannelId(9));
    }

    #[test]
    fn server_create_drains_the_unavailable_set() {
        let mut state = State::new(&ready_fixture());
        state.update(&large_server_create(41, 3, vec![member_value(7, "owner")]));
        assert!(state.unavailable_servers().is_empty());
        assert_eq!(state.unfilled_servers(), vec![ServerId(41)]);
        assert_eq!(state.unknown_members(), 2);
    }

    #[test]
    fn member_chunks_fill_with_offline_defaults() {
        let mut state = State::new(&ready_fixture());
        state.update(&large_server_create(41, 3, vec![member_value(7, "owner")]));

        let chunk = Event::decode(
            "GUILD_MEMBERS_CHUNK",
            json!({
                "guild_id": "41",
                // the already known member must not be duplicated
                "members": [member_value(7, "owner"), member_value(8, "a"), member_value(9, "b")],
            }),
        )
        .unwrap();
        state.update(&chunk);

        let server = state.server(ServerId(41)).unwrap();
        assert_eq!(server.members.len(), 3);
        assert!(state.members_complete(ServerId(41)));
        assert_eq!(state.unknown_members(), 0);

        let presence = server
            .presences
            .iter()
            .find(|p| p.user_id == UserId(9))
            .unwrap();
        assert_eq!(presence.status, OnlineStatus::Offline);
        assert!(presence.game.is_none());
    }

    #[test]
    fn server_delete_distinguishes_outage_from_removal() {
        let mut state = State::new(&ready_fixture());

        let outage = Event::decode("GUILD_DELETE", json!({ "id": "42", "unavailable": true })).unwrap();
        state.update(&outage);
        assert!(state.unavailable_servers().contains(&ServerId(42)));

        let removal = Event::decode("GUILD_DELETE", json!({ "id": "42" })).unwrap();
        state.update(&removal);
        assert!(!state.unavailable_servers().contains(&ServerId(42)));
        assert!(state.server(ServerId(42)).is_none());
    }

    #[test]
    fn voice_states_are_replaced_per_user() {
        let mut state = State::new(&ready_fixture());
        state.update(&large_server_create(41, 1, vec![member_value(7, "owner")]));

        let join = Event::decode(
            "VOICE_STATE_UPDATE",
            json!({ "user_id": "7", "guild_id": "41", "channel_id": "88", "session_id": "x" }),
        )
        .unwrap();
        state.update(&join);
        assert_eq!(state.server(ServerId(41)).unwrap().voice_states.len(), 1);

        let leave = Event::decode(
            "VOICE_STATE_UPDATE",
            json!({ "user_id": "7", "guild_id": "41", "channel_id": null, "session_id": "x" }),
        )
        .unwrap();
        state.update(&leave);
        assert!(state.server(ServerId(41)).unwrap().voice_states.is_empty());
    }
}
