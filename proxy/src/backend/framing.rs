//! Response header framing.

use memchr::{memchr, memchr_iter, memmem};

/// End of a response header block.
pub const HEADER_END: &[u8] = b"\r\n\r\n";

/// Header blocks larger than this without a terminating blank line are
/// rejected.
pub const MAX_HEADER_BLOCK: usize = 64 * 1024;

/// Why a backend response could not be framed.
///
/// Every variant is handled the same way: the client gets whatever was
/// received and is closed, and the backend returns to its pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("response has no Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),
    #[error("malformed header block: {0}")]
    MalformedHeaderBlock(&'static str),
    #[error("response bytes arrived with no client to forward them to")]
    IoFailure,
}

/// Offset just past the blank line ending the header block, if present.
pub fn header_end(buf: &[u8]) -> Option<usize> {
    memmem::find(buf, HEADER_END).map(|pos| pos + HEADER_END.len())
}

/// Read `Content-Length` out of a complete header block.
///
/// The first line is the status line and is not inspected. Every other
/// non-empty line must be a `name: value` pair.
pub fn content_length(block: &[u8]) -> Result<u64, FramingError> {
    let mut start = 0;
    let mut lines = memchr_iter(b'\n', block)
        .chain(std::iter::once(block.len()))
        .map(|end| {
            let line = trim_cr(&block[start..end]);
            start = (end + 1).min(block.len());
            line
        });
    lines.next();

    let mut length = None;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let colon = memchr(b':', line)
            .ok_or(FramingError::MalformedHeaderBlock("header line without a colon"))?;
        let (name, value) = (&line[..colon], &line[colon + 1..]);

        if length.is_none() && name.trim_ascii().eq_ignore_ascii_case(b"content-length") {
            let value = String::from_utf8_lossy(value.trim_ascii()).into_owned();
            length = Some(
                value
                    .parse::<u64>()
                    .map_err(|_| FramingError::InvalidContentLength(value))?,
            );
        }
    }

    length.ok_or(FramingError::MissingContentLength)
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}
