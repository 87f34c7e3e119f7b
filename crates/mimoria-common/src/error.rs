use thiserror::Error;

/// Failures while decoding or framing wire bytes. None of these carry
/// enough context to respond to a client (no request id is known yet when
/// most of them occur) — the connection is simply closed (§7 `MalformedFrame`).
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum WireError {
    #[error("frame violated minimum length or framing rules")]
    MalformedFrame,
    #[error("buffer ended before a value could be fully decoded")]
    Truncated,
    #[error("unknown tagged-value tag byte {0:#x}")]
    UnknownTag(u8),
    #[error("unknown operation code {0:#x}")]
    UnknownOp(u8),
}
