use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("deadline passed before progress was made")]
    Timeout,

    #[error("session or listener is closed")]
    Closed,

    #[error("close called twice on the same handle")]
    AlreadyClosed,

    #[error("packet checksum mismatch")]
    ChecksumMismatch,

    #[error("buffer too small for the next message ({needed} bytes needed)")]
    BufferTooSmall { needed: usize },

    #[error("message would exceed 255 fragments")]
    MessageTooLarge,

    #[error("underlying transport failed: {0}")]
    TransportFailed(io::Error),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(&'static str),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
