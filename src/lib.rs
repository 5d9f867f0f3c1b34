//! Client library for the [Discord](https://discord.com) real-time gateway.
//!
//! The gateway is the websocket side of the Discord API: a long-lived
//! connection over which state updates and chat events are received, kept
//! alive by a heartbeat exchange and recoverable through session resuming.
//!
//! Log in with [`Discord::from_bot_token`] and call [`Discord::connect`] to
//! obtain a [`SessionBuilder`]; connecting it yields a [`Session`] whose
//! [`Session::next_event`] loop delivers [`SessionEvent`]s. The session
//! keeps a [`State`] seeded from the initial `READY` and maintained from
//! the event stream, can backfill the member lists of large servers before
//! reporting ready, and negotiates per-server voice sessions with
//! [`Session::join_voice_channel`].
//!
//! The REST API beyond gateway endpoint discovery, and the voice UDP data
//! plane itself, are out of scope; joining a voice channel hands off a
//! [`voice::VoiceSession`] with everything a data plane needs.

use std::collections::BTreeMap;

use reqwest::header;
use tracing::warn;

macro_rules! cdn_concat {
    ($e:expr) => {
        // Out of everything, only the CDN still uses the old domain.
        concat!("https://cdn.discordapp.com", $e)
    };
}

mod connection;
mod error;
mod io;
mod session;
mod state;

pub mod voice;

/// Struct and enum definitions of values in the Discord model.
pub mod model {
    mod event;
    pub use self::event::*;

    mod frozen;
    pub use frozen::*;

    mod live;
    pub use live::*;
}

mod serial;

pub use connection::{Connection, ConnectionBuilder, ConnectionEvent, GATEWAY_VERSION};
pub use error::{Error, Result};
pub use io::{Encoding, Packet};
pub use session::{Session, SessionBuilder, SessionEvent};
pub use state::{ChannelRef, State};

const API_BASE: &str = "https://discord.com/api/v6";

/// Gateway endpoint used when discovery over REST fails.
const DEFAULT_GATEWAY: &str = "wss://gateway.discord.gg";

/// User agent reported to Discord, over HTTP and in the gateway identify.
pub(crate) const USER_AGENT: &str = concat!(
    "DiscordBot (discord-gateway, ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

/// Client for the slice of the Discord REST API the gateway needs.
///
/// Log in with `from_bot_token`, then use `connect` to discover the gateway
/// endpoint and prepare a [`SessionBuilder`].
pub struct Discord {
    client: reqwest::Client,
    token: String,
}

impl Discord {
    /// Log in as a bot account using the given bot authentication token.
    /// The token will automatically be prefixed with `Bot `.
    pub fn from_bot_token(token: &str) -> Discord {
        Discord::from_token_raw(format!("Bot {}", token.trim()))
    }

    /// Log in using a raw authorization header value.
    pub fn from_token_raw(token: String) -> Discord {
        Discord {
            client: reqwest::Client::builder()
                .https_only(true)
                .user_agent(USER_AGENT)
                .build()
                .expect("Couldn't build HTTPS reqwest client"),
            token,
        }
    }

    /// Prepare a websocket connection over which events can be received.
    ///
    /// The gateway endpoint is discovered over REST; if discovery fails the
    /// well-known default endpoint is used instead.
    pub async fn connect(&self) -> SessionBuilder<'_> {
        let url = match self.get_gateway_url().await {
            Ok(url) => url,
            Err(err) => {
                warn!("gateway URL discovery failed ({}), using the default", err);
                DEFAULT_GATEWAY.to_owned()
            }
        };
        SessionBuilder::new(url, &self.token)
    }

    /// Fetch the websocket URL of the gateway.
    pub async fn get_gateway_url(&self) -> Result<String> {
        let response = retry(&mut || {
            self.client
                .get(format!("{}/gateway", API_BASE))
                .header(header::AUTHORIZATION, self.token.clone())
        })
        .await?
        .error_for_status()?;

        let mut body: BTreeMap<String, String> = response.json().await?;
        match body.remove("url") {
            Some(url) => Ok(url),
            None => Err(Error::Protocol(
                "response missing \"url\" in Discord::get_gateway_url()",
            )),
        }
    }
}

/// Send a request, retrying it a second time if the connection is aborted
/// the first time.
async fn retry<F: FnMut() -> reqwest::RequestBuilder>(
    f: &mut F,
) -> reqwest::Result<reqwest::Response> {
    // retry on a ConnectionAborted, which occurs if it's been a while since the last request
    match f().send().await {
        Err(err) if err.is_connect() => f().send().await,
        other => other,
    }
}
