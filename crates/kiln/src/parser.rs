// src/parser.rs
//
// Line-oriented request parsing over the connection's read buffer. Lines
// are terminated in place: a CRLF pair is overwritten with NUL bytes and the
// caller slices the line out of the buffer, no copies.
use crate::http::Method;
use memchr::memchr2;

/// Result of scanning for the end of the current line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A full line ends just before `checked_idx`.
    Ok,
    /// A stray CR or LF.
    Bad,
    /// The line continues past the bytes received so far.
    Open,
}

/// Scan `buf[*checked_idx..read_idx]` for a line terminator.
///
/// On `Ok`, `*checked_idx` points past the terminator and the line occupies
/// `start..*checked_idx - 2`. A CR that is the last received byte is left
/// unchecked so its LF can arrive in a later read.
pub fn parse_line(buf: &mut [u8], checked_idx: &mut usize, read_idx: usize) -> LineStatus {
    let start = *checked_idx;
    if start >= read_idx {
        return LineStatus::Open;
    }

    let Some(offset) = memchr2(b'\r', b'\n', &buf[start..read_idx]) else {
        *checked_idx = read_idx;
        return LineStatus::Open;
    };
    let i = start + offset;

    if buf[i] == b'\r' {
        if i + 1 == read_idx {
            *checked_idx = i;
            return LineStatus::Open;
        }
        if buf[i + 1] == b'\n' {
            buf[i] = 0;
            buf[i + 1] = 0;
            *checked_idx = i + 2;
            return LineStatus::Ok;
        }
        return LineStatus::Bad;
    }

    // LF: only valid as the second half of a CRLF pair
    if i > 0 && buf[i - 1] == b'\r' {
        buf[i - 1] = 0;
        buf[i] = 0;
        *checked_idx = i + 1;
        return LineStatus::Ok;
    }
    LineStatus::Bad
}

/// Parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    /// Absolute path, with any scheme and authority removed.
    pub url: String,
}

/// Target served for a bare `/`.
pub const LANDING_PAGE: &str = "/judge.html";

fn is_blank(b: &u8) -> bool {
    *b == b' ' || *b == b'\t'
}

/// Split off the next space/tab separated token.
fn next_token(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let start = line.iter().position(|b| !is_blank(b))?;
    let line = &line[start..];
    let end = line.iter().position(is_blank).unwrap_or(line.len());
    Some((&line[..end], &line[end..]))
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// Parse `METHOD TARGET VERSION`. `None` means the request is malformed.
pub fn parse_request_line(line: &[u8]) -> Option<RequestLine> {
    let (method, rest) = next_token(line)?;
    let method = Method::from_token(method)?;

    let (target, rest) = next_token(rest)?;
    let (version, rest) = next_token(rest)?;
    if !version.eq_ignore_ascii_case(b"HTTP/1.1") {
        return None;
    }
    if next_token(rest).is_some() {
        return None;
    }

    let mut url = std::str::from_utf8(target).ok()?;
    for scheme in ["http://", "https://"] {
        if let Some(stripped) = strip_prefix_ignore_case(url, scheme) {
            url = &stripped[stripped.find('/')?..];
            break;
        }
    }
    if !url.starts_with('/') {
        return None;
    }

    let url = if url == "/" { LANDING_PAGE } else { url };
    Some(RequestLine {
        method,
        url: url.to_string(),
    })
}

/// A recognized (or ignored) header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header<'a> {
    /// `true` unless the peer asked for `close`.
    Connection(bool),
    /// `None` when the value is not a valid length.
    ContentLength(Option<usize>),
    Host(&'a str),
    Unknown(&'a [u8]),
}

fn header_value<'a>(line: &'a [u8], name: &str) -> Option<&'a [u8]> {
    let colon = line.iter().position(|&b| b == b':')?;
    if !line[..colon].eq_ignore_ascii_case(name.as_bytes()) {
        return None;
    }
    let value = &line[colon + 1..];
    let start = value.iter().position(|b| !is_blank(b)).unwrap_or(value.len());
    let end = value.iter().rposition(|b| !is_blank(b)).map_or(start, |e| e + 1);
    Some(&value[start..end.max(start)])
}

/// Classify one header line. Never fails; unknown headers are returned as-is.
pub fn parse_header(line: &[u8]) -> Header<'_> {
    if let Some(value) = header_value(line, "Connection") {
        return Header::Connection(!value.eq_ignore_ascii_case(b"close"));
    }
    if let Some(value) = header_value(line, "Content-Length") {
        let len = std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.parse::<usize>().ok());
        return Header::ContentLength(len);
    }
    if let Some(value) = header_value(line, "Host") {
        if let Ok(host) = std::str::from_utf8(value) {
            return Header::Host(host);
        }
    }
    Header::Unknown(line)
}
