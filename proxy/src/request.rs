//! Minimal request-head scanning for frontend connections.
//!
//! Only the request target and the Host header are ever looked at; everything
//! else in the request is forwarded untouched.

use memchr::{memchr, memchr_iter, memmem};

/// What has been learned so far from the head of a request.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// Request target up to (not including) any query string.
    pub uri: Option<String>,
    /// Host header value without port.
    pub host: Option<String>,
    /// The blank line ending the header block has been seen.
    pub complete: bool,
}

impl RequestHead {
    /// The request can be routed: a Host header or the end of headers was found.
    pub fn is_routable(&self) -> bool {
        self.host.is_some() || self.complete
    }
}

/// Scan the bytes received so far.
///
/// Partial lines are ignored, so a Host header split across reads is only
/// picked up once its line is terminated.
pub fn scan(buf: &[u8]) -> RequestHead {
    let mut head = RequestHead {
        uri: request_target(buf),
        ..Default::default()
    };

    let mut line_ends = memchr_iter(b'\n', buf);
    // request line
    let Some(mut start) = line_ends.next().map(|end| end + 1) else {
        return head;
    };

    // only terminated lines are yielded, a partial last line is left alone
    for end in line_ends {
        let line = trim_line_end(&buf[start..=end]);
        start = end + 1;
        if line.is_empty() {
            head.complete = true;
            break;
        }
        if head.host.is_none() {
            head.host = host_value(line);
        }
    }

    // a blank line immediately after the request line (or no request line at all)
    if !head.complete && find(buf, b"\r\n\r\n").is_some() {
        head.complete = true;
    }

    head
}

/// Position of the first occurrence of `needle` in `haystack`.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    memmem::find(haystack, needle)
}

fn request_target(buf: &[u8]) -> Option<String> {
    let line_end = memchr(b'\n', buf).unwrap_or(buf.len());
    let line = &buf[..line_end];

    // skip the method
    let start = line.iter().position(|b| b.is_ascii_whitespace())? + 1;
    let rest = &line[start..];
    let len = rest
        .iter()
        .position(|b| b.is_ascii_whitespace() || *b == b'?')
        // an unterminated target may still be growing
        .or((line_end < buf.len()).then_some(rest.len()))?;

    Some(String::from_utf8_lossy(&rest[..len]).into_owned())
}

fn host_value(line: &[u8]) -> Option<String> {
    const NAME: &[u8] = b"host:";
    if line.len() < NAME.len() || !line[..NAME.len()].eq_ignore_ascii_case(NAME) {
        return None;
    }
    let value = &line[NAME.len()..];
    let value = match value.iter().position(|b| !b.is_ascii_whitespace()) {
        Some(start) => &value[start..],
        None => return None,
    };
    let end = memchr(b':', value).unwrap_or(value.len());
    let host = String::from_utf8_lossy(&value[..end]).trim_end().to_string();
    (!host.is_empty()).then_some(host)
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
