use reqwest::Error as ReqwestError;
use serde_json::Error as JsonError;
use serde_json::Value;
use std::error::Error as StdError;
use std::fmt::Display;
use std::io::Error as IoError;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Discord API `Result` alias type.
pub type Result<T> = ::std::result::Result<T, Error>;

/// Discord gateway error type.
#[derive(Debug)]
pub enum Error {
    /// A `reqwest` crate error
    Reqwest(ReqwestError),
    /// A `serde_json` crate error
    Json(JsonError),
    /// A `tungstenite` crate error
    WebSocket(WsError),
    /// A `std::io` module error
    Io(IoError),
    /// The websocket connection was closed, possibly with a code and message
    Closed(Option<u16>, String),
    /// A json decoding error, with a description and the offending value
    Decode(&'static str, Value),
    /// A Discord protocol error, with a description
    Protocol(&'static str),
    /// The gateway closed the connection because the account token is not valid.
    ///
    /// This error is terminal; no reconnect is attempted after it.
    InvalidToken,
    /// A miscellaneous error, with a description
    Other(&'static str),
}

impl From<IoError> for Error {
    fn from(err: IoError) -> Error {
        Error::Io(err)
    }
}

impl From<ReqwestError> for Error {
    fn from(err: ReqwestError) -> Error {
        Error::Reqwest(err)
    }
}

impl From<JsonError> for Error {
    fn from(err: JsonError) -> Error {
        Error::Json(err)
    }
}

impl From<WsError> for Error {
    fn from(err: WsError) -> Error {
        Error::WebSocket(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        match *self {
            Error::Reqwest(ref inner) => inner.fmt(f),
            Error::Json(ref inner) => inner.fmt(f),
            Error::WebSocket(ref inner) => inner.fmt(f),
            Error::Io(ref inner) => inner.fmt(f),
            Error::Closed(Some(code), ref message) if !message.is_empty() => {
                write!(f, "connection closed with code {}: {}", code, message)
            }
            Error::Closed(Some(code), _) => write!(f, "connection closed with code {}", code),
            Error::Closed(None, _) => f.write_str("connection closed"),
            Error::Decode(msg, _) => write!(f, "decode error: {}", msg),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::InvalidToken => f.write_str("token is invalid"),
            Error::Other(msg) => f.write_str(msg),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match *self {
            Error::Reqwest(ref inner) => Some(inner),
            Error::Json(ref inner) => Some(inner),
            Error::WebSocket(ref inner) => Some(inner),
            Error::Io(ref inner) => Some(inner),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_token_message() {
        assert_eq!(Error::InvalidToken.to_string(), "token is invalid");
    }

    #[test]
    fn close_frames_render_code_and_reason() {
        let err = Error::Closed(Some(4014), "Disallowed intent(s).".into());
        assert_eq!(
            err.to_string(),
            "connection closed with code 4014: Disallowed intent(s)."
        );
        assert_eq!(Error::Closed(None, String::new()).to_string(), "connection closed");
    }
}
