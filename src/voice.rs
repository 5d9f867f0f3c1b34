//! Voice communication control plane.
//!
//! A `VoiceConnection` for a server is obtained from the session by joining
//! a voice channel. Joining negotiates with the gateway in two halves which
//! may arrive in either order: a `VOICE_STATE_UPDATE` carrying the voice
//! session ID, and a `VOICE_SERVER_UPDATE` carrying the endpoint and token.
//! Once both halves are present they are combined into a [`VoiceSession`],
//! the artifact the voice data plane is driven with.

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::io::SharedSink;
use crate::model::*;
use crate::{Error, Result};

/// Everything needed to establish the voice data plane for one server.
#[derive(Debug, Clone)]
pub struct VoiceSession {
    /// The server this voice session belongs to.
    pub server_id: ServerId,
    /// The voice session ID, from the gateway's voice state update.
    pub session_id: String,
    /// The voice server to connect to, from the voice server update.
    pub endpoint: String,
    /// The authentication token for the voice server.
    pub token: String,
    /// The configured bitrate of the joined channel, in bits per second.
    pub bitrate: Option<u64>,
}

/// A join attempt waiting for the gateway's two answers.
#[derive(Debug)]
struct PendingJoin {
    completion: oneshot::Sender<Result<VoiceSession>>,
    deadline: Instant,
}

/// The voice connection of a single server, driven by the session.
#[derive(Debug)]
pub struct VoiceConnection {
    server_id: ServerId,
    /// The logged-in user, whose voice state updates are ours.
    user_id: UserId,
    sink: SharedSink,

    channel_id: Option<ChannelId>,
    mute: bool,
    deaf: bool,
    bitrate: Option<u64>,

    // whichever handshake half arrives first is buffered here
    session_id: Option<String>,
    endpoint_token: Option<(String, String)>,

    session: Option<VoiceSession>,
    pending: Option<PendingJoin>,
}

impl VoiceConnection {
    pub(crate) fn new(server_id: ServerId, user_id: UserId, sink: SharedSink) -> Self {
        VoiceConnection {
            server_id,
            user_id,
            sink,
            channel_id: None,
            mute: false,
            deaf: false,
            bitrate: None,
            session_id: None,
            endpoint_token: None,
            session: None,
            pending: None,
        }
    }

    /// Replace the gateway writer after a reconnect.
    pub(crate) fn set_sink(&mut self, sink: SharedSink) {
        self.sink = sink;
    }

    /// Ask the gateway to join the given channel and register the join
    /// completion. Resolved once both handshake halves have arrived.
    pub(crate) async fn connect(
        &mut self,
        channel_id: ChannelId,
        mute: bool,
        deaf: bool,
        bitrate: Option<u64>,
        timeout: std::time::Duration,
    ) -> Result<oneshot::Receiver<Result<VoiceSession>>> {
        self.channel_id = Some(channel_id);
        self.mute = mute;
        self.deaf = deaf;
        self.bitrate = bitrate;

        let (completion, receiver) = oneshot::channel();
        self.pending = Some(PendingJoin {
            completion,
            deadline: Instant::now() + timeout,
        });

        self.send_connect().await?;
        Ok(receiver)
    }

    /// Disconnect from the current voice channel, if any.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.channel_id = None;
        self.drop_session();
        self.send_connect().await
    }

    /// Set the mute status of the voice connection.
    pub async fn set_mute(&mut self, mute: bool) -> Result<()> {
        self.mute = mute;
        if self.channel_id.is_some() {
            self.send_connect().await
        } else {
            Ok(())
        }
    }

    /// Set the deaf status of the voice connection. Does not affect mute status.
    pub async fn set_deaf(&mut self, deaf: bool) -> Result<()> {
        self.deaf = deaf;
        if self.channel_id.is_some() {
            self.send_connect().await
        } else {
            Ok(())
        }
    }

    /// Get the current channel of this voice connection, if any.
    #[inline]
    pub fn current_channel(&self) -> Option<ChannelId> {
        self.channel_id
    }

    /// The established voice session, once the handshake has completed.
    #[inline]
    pub fn session(&self) -> Option<&VoiceSession> {
        self.session.as_ref()
    }

    /// Send the connect/disconnect command over the gateway.
    async fn send_connect(&self) -> Result<()> {
        self.sink
            .send_json(&SentMessage::update_voice_state(UpdateVoiceStatePayload {
                server_id: self.server_id,
                channel_id: self.channel_id,
                self_mute: self.mute,
                self_deaf: self.deaf,
            }))
            .await
    }

    /// Feed a voice state update concerning this server into the handshake.
    pub(crate) fn update_state(&mut self, voice_state: &VoiceState) {
        if voice_state.user_id != self.user_id {
            return;
        }

        self.channel_id = voice_state.channel_id;
        if voice_state.channel_id.is_some() {
            let session_id = voice_state.session_id.clone();
            if let Some((endpoint, token)) = self.endpoint_token.take() {
                self.complete(session_id, endpoint, token);
            } else {
                self.session_id = Some(session_id);
            }
        } else {
            self.drop_session();
        }
    }

    /// Feed a voice server update into the handshake.
    pub(crate) fn update_server(&mut self, endpoint: &Option<String>, token: &str) {
        if let Some(endpoint) = endpoint.clone() {
            let token = token.to_string();
            // session_id is deliberately not taken; on a voice server
            // transfer only this update is re-sent
            if let Some(session_id) = self.session_id.clone() {
                self.complete(session_id, endpoint, token);
            } else {
                self.endpoint_token = Some((endpoint, token));
            }
        } else {
            self.drop_session();
        }
    }

    /// Both halves are in; assemble the session and resolve the join.
    fn complete(&mut self, session_id: String, endpoint: String, token: String) {
        let session = VoiceSession {
            server_id: self.server_id,
            session_id,
            endpoint,
            token,
            bitrate: self.bitrate,
        };
        debug!(
            "voice handshake for {} complete, endpoint {}",
            self.server_id, session.endpoint
        );
        self.session_id = Some(session.session_id.clone());
        self.session = Some(session.clone());

        if let Some(pending) = self.pending.take() {
            let _ = pending.completion.send(Ok(session));
        }
    }

    /// Tear down the session; a join still waiting is rejected.
    fn drop_session(&mut self) {
        self.session = None;
        self.session_id = None;
        self.endpoint_token = None;
        if let Some(pending) = self.pending.take() {
            warn!("voice connection to {} dropped mid-join", self.server_id);
            let _ = pending.completion.send(Err(Error::Other(
                "voice connection dropped before the handshake completed",
            )));
        }
    }

    /// The deadline of a join still in flight.
    pub(crate) fn join_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|pending| pending.deadline)
    }

    /// Reject the pending join if its deadline has passed. Returns whether
    /// the handle should be discarded.
    pub(crate) fn expire_join(&mut self, now: Instant) -> bool {
        match self.pending {
            Some(ref pending) if pending.deadline <= now => {
                warn!("voice join for {} timed out", self.server_id);
                if let Some(pending) = self.pending.take() {
                    let _ = pending.completion.send(Err(Error::Other("voice join timed out")));
                }
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::testing::{sent_json, RecordingSink};
    use serde_json::json;
    use std::time::Duration;

    fn voice_state(user: u64, channel: Option<u64>, session: &str) -> VoiceState {
        serde_json::from_value(json!({
            "user_id": user.to_string(),
            "guild_id": "41",
            "channel_id": channel.map(|c| c.to_string()),
            "session_id": session,
        }))
        .unwrap()
    }

    async fn joining_connection() -> (
        VoiceConnection,
        oneshot::Receiver<Result<VoiceSession>>,
        std::sync::Arc<std::sync::Mutex<Vec<crate::io::WireOut>>>,
    ) {
        let (sink, items) = RecordingSink::new();
        let mut connection = VoiceConnection::new(ServerId(41), UserId(1), SharedSink::new(sink));
        let receiver = connection
            .connect(ChannelId(88), false, true, Some(96000), Duration::from_secs(10))
            .await
            .unwrap();
        (connection, receiver, items)
    }

    #[tokio::test]
    async fn join_sends_the_voice_state_command() {
        let (_connection, _receiver, items) = joining_connection().await;
        let sent = sent_json(&items);
        assert_eq!(
            sent[0],
            json!({
                "op": 4,
                "d": { "guild_id": 41, "channel_id": 88, "self_mute": false, "self_deaf": true }
            })
        );
    }

    #[tokio::test]
    async fn state_then_server_completes_the_join() {
        let (mut connection, mut receiver, _items) = joining_connection().await;

        connection.update_state(&voice_state(1, Some(88), "x"));
        assert!(receiver.try_recv().is_err());

        connection.update_server(&Some("smart.loyal.discord.gg:80".into()), "t");
        let session = receiver.await.unwrap().unwrap();
        assert_eq!(session.session_id, "x");
        assert_eq!(session.endpoint, "smart.loyal.discord.gg:80");
        assert_eq!(session.token, "t");
        assert_eq!(session.bitrate, Some(96000));
        assert!(connection.session().is_some());
    }

    #[tokio::test]
    async fn server_then_state_completes_the_join() {
        let (mut connection, receiver, _items) = joining_connection().await;

        connection.update_server(&Some("e".into()), "t");
        connection.update_state(&voice_state(1, Some(88), "x"));

        let session = receiver.await.unwrap().unwrap();
        assert_eq!(session.session_id, "x");
        assert_eq!(session.endpoint, "e");
    }

    #[tokio::test]
    async fn other_users_voice_states_are_ignored() {
        let (mut connection, mut receiver, _items) = joining_connection().await;

        connection.update_state(&voice_state(2, Some(88), "not ours"));
        connection.update_server(&Some("e".into()), "t");
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_channel_rejects_a_pending_join() {
        let (mut connection, receiver, _items) = joining_connection().await;

        connection.update_state(&voice_state(1, None, "x"));
        assert!(receiver.await.unwrap().is_err());
        assert!(connection.session().is_none());
    }

    #[tokio::test]
    async fn expiry_rejects_exactly_once() {
        let (mut connection, receiver, _items) = joining_connection().await;

        let later = Instant::now() + Duration::from_secs(11);
        assert!(connection.expire_join(later));
        assert!(receiver.await.unwrap().is_err());

        // a second expiry has nothing left to reject
        assert!(!connection.expire_join(later));
    }

    #[tokio::test]
    async fn completion_wins_over_a_later_expiry() {
        let (mut connection, receiver, _items) = joining_connection().await;

        connection.update_server(&Some("e".into()), "t");
        connection.update_state(&voice_state(1, Some(88), "x"));
        assert!(receiver.await.unwrap().is_ok());

        let later = Instant::now() + Duration::from_secs(11);
        assert!(!connection.expire_join(later));
    }

    #[tokio::test]
    async fn server_transfer_reuses_the_session_id() {
        let (mut connection, receiver, _items) = joining_connection().await;

        connection.update_state(&voice_state(1, Some(88), "x"));
        connection.update_server(&Some("first".into()), "t1");
        assert!(receiver.await.unwrap().is_ok());

        // the voice server moves; only the server update is re-sent
        connection.update_server(&Some("second".into()), "t2");
        let session = connection.session().unwrap();
        assert_eq!(session.endpoint, "second");
        assert_eq!(session.session_id, "x");
    }
}
