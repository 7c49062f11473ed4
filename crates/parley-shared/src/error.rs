use thiserror::Error;

/// Why an inbound frame could not be decoded. Every variant is dropped by the
/// session without tearing down the connection.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    NotJson(#[source] serde_json::Error),

    #[error("frame has no string `type` field")]
    MissingType,

    #[error("unknown frame type: {0}")]
    UnknownType(String),

    #[error("invalid `{kind}` frame: {reason}")]
    Invalid { kind: String, reason: String },

    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}
