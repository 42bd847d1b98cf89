use tokio_tungstenite::tungstenite;

/// Failures of the bridge transport itself: binding the shared port,
/// reaching a leader, and talking to followers.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(
        "failed to start server on port {port}; another process may own it. \
         Change `server.port` (or DECK_SERVER__PORT) and restart"
    )]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("leader did not accept registration in time")]
    ConnectTimeout,

    #[error("could not connect to leader: {0}")]
    Connect(#[source] Box<tungstenite::Error>),

    #[error("follower request timed out")]
    RpcTimeout,

    #[error("follower connection closed before responding")]
    FollowerGone,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("election coordinator was stopped; create a new one to rejoin")]
    Stopped,
}

impl From<tungstenite::Error> for BridgeError {
    fn from(err: tungstenite::Error) -> Self {
        Self::Connect(Box::new(err))
    }
}

/// Why a run or cancel could not be dispatched. Every variant is reported
/// back to the caller as a structured failure result, never raised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Invalid slotDataId format")]
    MalformedId,

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Cancel not supported by this provider")]
    CancelUnsupported,

    #[error("Window not found")]
    WindowNotFound,

    /// A proxied run failed in transit (timeout or closed follower link).
    #[error("Failed to execute command")]
    RunForward,

    #[error("Failed to cancel command")]
    CancelForward,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_error_is_actionable() {
        let err = BridgeError::Bind {
            port: 52375,
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        let msg = err.to_string();
        assert!(msg.contains("52375"));
        assert!(msg.contains("server.port"));
    }

    #[test]
    fn command_error_messages() {
        assert_eq!(
            CommandError::UnknownProvider("p1".into()).to_string(),
            "Unknown provider: p1"
        );
        assert_eq!(CommandError::WindowNotFound.to_string(), "Window not found");
    }
}
