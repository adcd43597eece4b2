use crate::domain::errors::TransportError;
use crate::domain::records::Headers;

/// A STOMP 1.2 frame.
///
/// Wire format: command line, `name:value` header lines, a blank line, the
/// body, then a NUL byte. Repeated headers are kept in order; the first one
/// wins on lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// One item read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    /// A bare EOL sent as a heart-beat.
    Heartbeat,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_headers(mut self, headers: &Headers) -> Self {
        for (name, value) in headers {
            self.headers.push((name.clone(), value.clone()));
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Headers as a map, first occurrence of each name winning.
    pub fn headers_map(&self) -> Headers {
        let mut map = Headers::new();
        for (name, value) in &self.headers {
            map.entry(name.clone()).or_insert_with(|| value.clone());
        }
        map
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Serialize to wire bytes. A `content-length` header is added for any
    /// non-empty body that does not already carry one.
    pub fn encode(&self) -> Vec<u8> {
        let escape = escapes_headers(&self.command);
        let mut out = Vec::with_capacity(self.body.len() + 64);
        out.extend_from_slice(self.command.as_bytes());
        out.push(b'\n');
        for (name, value) in &self.headers {
            push_header(&mut out, name, value, escape);
        }
        if !self.body.is_empty() && self.header("content-length").is_none() {
            push_header(&mut out, "content-length", &self.body.len().to_string(), false);
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &str, escape: bool) {
    if escape {
        out.extend_from_slice(escape_value(name).as_bytes());
        out.push(b':');
        out.extend_from_slice(escape_value(value).as_bytes());
    } else {
        out.extend_from_slice(name.as_bytes());
        out.push(b':');
        out.extend_from_slice(value.as_bytes());
    }
    out.push(b'\n');
}

// CONNECT and CONNECTED frames never escape header values.
fn escapes_headers(command: &str) -> bool {
    command != "CONNECT" && command != "CONNECTED"
}

pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

pub fn unescape_value(value: &str) -> Result<String, TransportError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            Some(other) => {
                return Err(TransportError::Protocol(format!(
                    "undefined header escape \\{}",
                    other
                )))
            }
            None => {
                return Err(TransportError::Protocol(
                    "header ends inside an escape".to_string(),
                ))
            }
        }
    }
    Ok(out)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Largest frame accepted from the broker unless configured otherwise.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

fn too_large(size: usize, max_frame_size: usize) -> TransportError {
    TransportError::Protocol(format!(
        "frame of at least {} bytes exceeds the maximum of {}",
        size, max_frame_size
    ))
}

/// Try to decode one item from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the decoded item
/// and the number of bytes it occupied. A frame that is, or would grow,
/// larger than `max_frame_size` bytes is a protocol error.
pub fn decode(buf: &[u8], max_frame_size: usize) -> Result<Option<(Decoded, usize)>, TransportError> {
    match buf {
        [] => return Ok(None),
        [b'\n', ..] => return Ok(Some((Decoded::Heartbeat, 1))),
        [b'\r'] => return Ok(None),
        [b'\r', b'\n', ..] => return Ok(Some((Decoded::Heartbeat, 2))),
        _ => {}
    }

    let (head_end, body_start) = match (find(buf, b"\r\n\r\n"), find(buf, b"\n\n")) {
        (Some(crlf), Some(lf)) if crlf < lf => (crlf, crlf + 4),
        (_, Some(lf)) => (lf, lf + 2),
        (Some(crlf), None) => (crlf, crlf + 4),
        (None, None) if buf.len() > max_frame_size => {
            return Err(too_large(buf.len(), max_frame_size))
        }
        (None, None) => return Ok(None),
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|e| TransportError::Protocol(format!("frame head is not UTF-8: {}", e)))?;
    let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
    let command = lines
        .next()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| TransportError::Protocol("frame without a command".to_string()))?
        .to_string();
    let escape = escapes_headers(&command);

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| TransportError::Protocol(format!("malformed header line '{}'", line)))?;
        if escape {
            headers.push((unescape_value(name)?, unescape_value(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| TransportError::Protocol(format!("bad content-length '{}'", v)))
        })
        .transpose()?;

    let body_end = match content_length {
        Some(len) => {
            let end = body_start
                .checked_add(len)
                .filter(|end| *end < max_frame_size)
                .ok_or_else(|| too_large(body_start.saturating_add(len), max_frame_size))?;
            if buf.len() <= end {
                return Ok(None);
            }
            if buf[end] != 0 {
                return Err(TransportError::Protocol(
                    "frame body not terminated by NUL".to_string(),
                ));
            }
            end
        }
        None => match buf[body_start..].iter().position(|b| *b == 0) {
            Some(offset) => body_start + offset,
            None if buf.len() > max_frame_size => return Err(too_large(buf.len(), max_frame_size)),
            None => return Ok(None),
        },
    };

    let frame = Frame {
        command,
        headers,
        body: buf[body_start..body_end].to_vec(),
    };
    Ok(Some((Decoded::Frame(frame), body_end + 1)))
}
