//! Header and body canonicalization

/// DKIM canonicalization algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Canonicalization {
    Simple,
    #[default]
    Relaxed,
}

impl Canonicalization {
    pub fn name(self) -> &'static str {
        match self {
            Canonicalization::Simple => "simple",
            Canonicalization::Relaxed => "relaxed",
        }
    }

    /// Parse a `c=` tag value into (header, body)
    pub fn parse_pair(value: &str) -> (Self, Self) {
        let parse = |s: &str| match s.trim() {
            "relaxed" => Canonicalization::Relaxed,
            _ => Canonicalization::Simple,
        };
        match value.split_once('/') {
            Some((h, b)) => (parse(h), parse(b)),
            None => (parse(value), Canonicalization::Simple),
        }
    }
}

/// A header field as it appears in the message; `value` keeps its folding
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawHeader {
    pub name: String,
    pub value: String,
}

/// Split a message into its header fields and body bytes. A message with
/// no blank line is all header and has an empty body. `None` when there is
/// no header field at all.
pub(crate) fn split_message(message: &[u8]) -> Option<(Vec<RawHeader>, &[u8])> {
    let (header_end, body_start) =
        find_separator(message).unwrap_or((message.len(), message.len()));
    let header_section = String::from_utf8_lossy(&message[..header_end]);

    let mut headers: Vec<RawHeader> = Vec::new();
    for line in header_section.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = headers.last_mut() {
                last.value.push_str("\r\n");
                last.value.push_str(line);
            }
        } else if let Some((name, value)) = line.split_once(':') {
            headers.push(RawHeader {
                name: name.to_string(),
                value: value.to_string(),
            });
        }
    }

    if headers.is_empty() {
        return None;
    }
    Some((headers, &message[body_start..]))
}

fn find_separator(message: &[u8]) -> Option<(usize, usize)> {
    if message.starts_with(b"\r\n") {
        return Some((0, 2));
    }
    if let Some(pos) = message.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    message
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|pos| (pos, pos + 2))
}

fn compress_wsp(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical form of one header field, with trailing CRLF
pub(crate) fn canonicalize_header(canon: Canonicalization, header: &RawHeader) -> String {
    match canon {
        Canonicalization::Simple => format!("{}:{}\r\n", header.name, header.value),
        Canonicalization::Relaxed => format!(
            "{}:{}\r\n",
            header.name.trim().to_ascii_lowercase(),
            compress_wsp(&header.value.replace("\r\n", ""))
        ),
    }
}

/// Canonical form of the body
pub(crate) fn canonicalize_body(canon: Canonicalization, body: &[u8]) -> Vec<u8> {
    let mut lines: Vec<Vec<u8>> = Vec::new();
    for line in body.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        lines.push(match canon {
            Canonicalization::Simple => line.to_vec(),
            Canonicalization::Relaxed => relax_line(line),
        });
    }

    // split leaves one empty entry after a final line break
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }

    if lines.is_empty() {
        return match canon {
            Canonicalization::Simple => b"\r\n".to_vec(),
            Canonicalization::Relaxed => Vec::new(),
        };
    }

    let mut out = Vec::with_capacity(body.len() + 2);
    for line in lines {
        out.extend_from_slice(&line);
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn relax_line(line: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len());
    let mut in_wsp = false;
    for &b in line {
        if b == b' ' || b == b'\t' {
            in_wsp = true;
        } else {
            if in_wsp {
                out.push(b' ');
                in_wsp = false;
            }
            out.push(b);
        }
    }
    out
}
