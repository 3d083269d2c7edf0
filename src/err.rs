use crate::socket::ReadMode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind local port {0}: {1}")]
    Bind(u16, #[source] std::io::Error),

    #[error("socket is closing; writes are no longer accepted")]
    WriteAfterClose,

    #[error("read mode {0:?} is not supported")]
    UnsupportedReadMode(ReadMode),

    #[error("datagram too short for a segment header")]
    TruncatedSegment,

    #[error("datagram carries protocol identifier {0}, not ours")]
    ForeignProtocol(u32),

    #[error("segment header lengths are inconsistent")]
    MalformedSegment,

    #[error("background engine terminated abnormally")]
    Engine,
}
