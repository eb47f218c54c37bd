use thiserror::Error;

#[derive(Debug, Error)]
pub enum NvramError {
    #[error("slot {slot} is outside the {capacity}-byte image")]
    SlotOutOfRange { slot: usize, capacity: usize },
    #[error("nvram io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("nvram backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document must be a JSON object")]
    NotAnObject,
    #[error("malformed patch: {0}")]
    MalformedPatch(#[source] serde_json::Error),
    #[error("failed to serialize document: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("document io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("document backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("invalid link configuration: {0}")]
    InvalidConfiguration(&'static str),
    #[error("link driver error: {0}")]
    Driver(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,
    #[error("session client error: {0}")]
    Client(String),
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to spawn `{name}` task: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("background tasks were already started")]
    AlreadyStarted,
}
