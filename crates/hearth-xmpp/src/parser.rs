//! Incremental stream decoding for client connections.
//!
//! A client connection is one long-lived XML document: an opening
//! `<stream:stream>` tag, any number of top-level stanzas, and eventually the
//! closing tag. [`StreamDecoder`] accepts bytes as they arrive from the socket
//! and turns them into ordered [`StreamEvent`]s. Only the framing is handled
//! here; each complete stanza is handed to minidom for the actual parse.

use minidom::Element;
use tracing::trace;

use crate::XmppError;

/// Namespace URIs used on client streams
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// Stream error namespace
    pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Legacy authentication namespace
    pub const AUTH: &str = "jabber:iq:auth";
    /// In-band registration namespace
    pub const REGISTER: &str = "jabber:iq:register";
    /// Roster namespace
    pub const ROSTER: &str = "jabber:iq:roster";
    /// Legacy delayed delivery namespace
    pub const DELAY: &str = "jabber:x:delay";
}

/// Closing tag written when a stream is shut down.
pub const STREAM_CLOSE: &str = "</stream:stream>";

/// Default upper bound for a single buffered stanza.
pub const DEFAULT_MAX_STANZA_BYTES: usize = 64 * 1024;

/// Parsed stream header information.
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    /// The 'to' attribute (target host)
    pub to: Option<String>,
    /// The 'from' attribute
    pub from: Option<String>,
    /// The 'id' attribute (stream ID, set by server)
    pub id: Option<String>,
    /// The 'version' attribute
    pub version: Option<String>,
    /// The 'xml:lang' attribute
    pub lang: Option<String>,
    /// The default namespace declared on the stream
    pub xmlns: Option<String>,
}

impl StreamHeader {
    /// Parse a stream header from raw XML data.
    ///
    /// This handles the special case of XMPP stream headers which are
    /// incomplete XML (the closing tag comes at session end).
    pub fn parse(data: &str) -> Result<Self, XmppError> {
        let mut header = StreamHeader::default();

        // Find the stream:stream opening tag
        let stream_start = data
            .find("<stream:stream")
            .or_else(|| data.find("<stream "))
            .ok_or_else(|| XmppError::xml_parse("No stream:stream element found"))?;

        let stream_end = data[stream_start..]
            .find('>')
            .map(|i| stream_start + i)
            .ok_or_else(|| XmppError::xml_parse("Incomplete stream header"))?;

        let tag = &data[stream_start..=stream_end];

        // Parse attributes manually since the tag is intentionally unclosed
        header.to = extract_attribute(tag, "to");
        header.from = extract_attribute(tag, "from");
        header.id = extract_attribute(tag, "id");
        header.version = extract_attribute(tag, "version");
        header.lang = extract_attribute(tag, "xml:lang");
        header.xmlns = extract_attribute(tag, "xmlns");

        Ok(header)
    }
}

/// Extract an attribute value from an XML tag string.
///
/// The attribute name must be preceded by whitespace, so `id` does not match
/// inside `sid` and `xmlns` does not match `xmlns:stream`.
fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    // Try both single and double quotes
    for quote in ['"', '\''] {
        let pattern = format!("{}={}", name, quote);
        for (start, _) in tag.match_indices(&pattern) {
            let preceded_by_space = tag[..start]
                .chars()
                .next_back()
                .is_some_and(char::is_whitespace);
            if !preceded_by_space {
                continue;
            }
            let value_start = start + pattern.len();
            if let Some(value_end) = tag[value_start..].find(quote) {
                return Some(tag[value_start..value_start + value_end].to_string());
            }
        }
    }
    None
}

/// Events produced by the decoder, in stream order.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The client opened its stream.
    Open(StreamHeader),
    /// A complete top-level stanza.
    Node(Element),
    /// The input is not a well-formed stream. No further events follow.
    Error(String),
    /// The client closed its stream. No further events follow.
    Close,
}

/// Incremental decoder for one client stream.
///
/// Each connection owns its own decoder; there is no shared state.
pub struct StreamDecoder {
    /// Bytes received but not yet consumed
    buffer: Vec<u8>,
    /// Next position in `buffer` to scan for markup
    cursor: usize,
    /// Element nesting depth (1 = inside the stream element)
    depth: usize,
    /// Start of the stanza currently being buffered
    stanza_start: Option<usize>,
    /// Default namespace declared by the stream header
    default_ns: String,
    /// Upper bound for a single buffered stanza
    max_stanza_bytes: usize,
    /// Set after a close or an error
    finished: bool,
}

enum Markup {
    /// Processing instructions, comments and CDATA sections
    Skip,
    Start,
    Empty,
    End(String),
}

enum Scan {
    Incomplete,
    Malformed(&'static str),
    Found { markup: Markup, name: String, len: usize },
}

impl StreamDecoder {
    /// Create a decoder with the default stanza size limit.
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_STANZA_BYTES)
    }

    /// Create a decoder that rejects stanzas larger than `max_stanza_bytes`.
    pub fn with_limit(max_stanza_bytes: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            cursor: 0,
            depth: 0,
            stanza_start: None,
            default_ns: ns::JABBER_CLIENT.to_string(),
            max_stanza_bytes,
            finished: false,
        }
    }

    /// Whether the stream has been closed or failed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed bytes into the decoder and collect the events they complete.
    pub fn feed(&mut self, data: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        self.buffer.extend_from_slice(data);

        while !self.finished {
            let Some(offset) = self.buffer[self.cursor..].iter().position(|b| *b == b'<') else {
                self.cursor = self.buffer.len();
                break;
            };
            let start = self.cursor + offset;

            match scan_markup(&self.buffer[start..]) {
                Scan::Incomplete => {
                    self.cursor = start;
                    break;
                }
                Scan::Malformed(reason) => self.fail(reason.to_string(), &mut events),
                Scan::Found { markup, name, len } => {
                    self.cursor = start + len;
                    self.handle(markup, &name, start, &mut events);
                }
            }
        }

        self.compact();

        if !self.finished && self.buffer.len() > self.max_stanza_bytes {
            let reason = format!("stanza exceeds {} bytes", self.max_stanza_bytes);
            self.fail(reason, &mut events);
            self.compact();
        }

        events
    }

    fn handle(&mut self, markup: Markup, name: &str, start: usize, events: &mut Vec<StreamEvent>) {
        match (self.depth, markup) {
            (_, Markup::Skip) => {}
            (0, Markup::Start) if is_stream_tag(name) => {
                let raw = String::from_utf8_lossy(&self.buffer[start..self.cursor]).into_owned();
                match StreamHeader::parse(&raw) {
                    Ok(header) => {
                        if let Some(ref xmlns) = header.xmlns {
                            self.default_ns = xmlns.clone();
                        }
                        self.depth = 1;
                        trace!(to = ?header.to, "stream opened");
                        events.push(StreamEvent::Open(header));
                    }
                    Err(e) => self.fail(e.to_string(), events),
                }
            }
            (0, _) => self.fail("expected stream header".to_string(), events),
            (1, Markup::Start) => {
                self.stanza_start = Some(start);
                self.depth = 2;
            }
            (1, Markup::Empty) => self.emit_stanza(start, events),
            (1, Markup::End(closing)) => {
                if is_stream_tag(&closing) {
                    self.depth = 0;
                    self.finished = true;
                    events.push(StreamEvent::Close);
                } else {
                    self.fail(format!("unexpected closing tag </{}>", closing), events);
                }
            }
            (_, Markup::Start) => self.depth += 1,
            (_, Markup::Empty) => {}
            (_, Markup::End(_)) => {
                self.depth -= 1;
                if self.depth == 1 {
                    if let Some(stanza_start) = self.stanza_start.take() {
                        self.emit_stanza(stanza_start, events);
                    }
                }
            }
        }
    }

    fn emit_stanza(&mut self, start: usize, events: &mut Vec<StreamEvent>) {
        let raw = match std::str::from_utf8(&self.buffer[start..self.cursor]) {
            Ok(raw) => raw.to_string(),
            Err(_) => {
                self.fail("stanza is not valid UTF-8".to_string(), events);
                return;
            }
        };

        match parse_stanza(&raw, &self.default_ns) {
            Ok(element) => events.push(StreamEvent::Node(element)),
            Err(e) => self.fail(e.to_string(), events),
        }
    }

    fn fail(&mut self, reason: String, events: &mut Vec<StreamEvent>) {
        trace!(%reason, "stream decoding failed");
        self.finished = true;
        events.push(StreamEvent::Error(reason));
    }

    /// Drop consumed bytes, keeping any partially buffered stanza.
    fn compact(&mut self) {
        if self.finished {
            self.buffer.clear();
            self.cursor = 0;
            self.stanza_start = None;
            return;
        }

        let keep_from = self.stanza_start.unwrap_or(self.cursor);
        if keep_from > 0 {
            self.buffer.drain(..keep_from);
            self.cursor -= keep_from;
            if let Some(start) = self.stanza_start.as_mut() {
                *start -= keep_from;
            }
        }
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn is_stream_tag(name: &str) -> bool {
    name == "stream" || name.ends_with(":stream")
}

fn find_seq(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Scan one piece of markup starting at `<`.
fn scan_markup(bytes: &[u8]) -> Scan {
    if bytes.len() < 2 {
        return Scan::Incomplete;
    }

    let skip_until = |open: &[u8], close: &[u8]| -> Scan {
        match find_seq(&bytes[open.len()..], close) {
            Some(i) => Scan::Found {
                markup: Markup::Skip,
                name: String::new(),
                len: open.len() + i + close.len(),
            },
            None => Scan::Incomplete,
        }
    };

    match bytes[1] {
        b'?' => skip_until(b"<?", b"?>"),
        b'!' => {
            if bytes.starts_with(b"<!--") {
                skip_until(b"<!--", b"-->")
            } else if bytes.starts_with(b"<![CDATA[") {
                skip_until(b"<![CDATA[", b"]]>")
            } else if b"<!--".starts_with(bytes) || b"<![CDATA[".starts_with(bytes) {
                Scan::Incomplete
            } else {
                Scan::Malformed("markup declarations are not allowed")
            }
        }
        b'/' => match bytes.iter().position(|b| *b == b'>') {
            Some(end) => {
                let name = String::from_utf8_lossy(&bytes[2..end]).trim().to_string();
                if name.is_empty() {
                    return Scan::Malformed("empty closing tag");
                }
                Scan::Found {
                    markup: Markup::End(name.clone()),
                    name,
                    len: end + 1,
                }
            }
            None => Scan::Incomplete,
        },
        _ => {
            let mut quote: Option<u8> = None;
            for (i, &b) in bytes.iter().enumerate().skip(1) {
                match quote {
                    Some(q) => {
                        if b == q {
                            quote = None;
                        }
                    }
                    None => match b {
                        b'"' | b'\'' => quote = Some(b),
                        b'<' => return Scan::Malformed("'<' inside a tag"),
                        b'>' => {
                            let name = element_name(&bytes[1..i]);
                            if name.is_empty() {
                                return Scan::Malformed("empty element name");
                            }
                            let markup = if bytes[i - 1] == b'/' {
                                Markup::Empty
                            } else {
                                Markup::Start
                            };
                            return Scan::Found {
                                markup,
                                name,
                                len: i + 1,
                            };
                        }
                        _ => {}
                    },
                }
            }
            Scan::Incomplete
        }
    }
}

fn element_name(tag_body: &[u8]) -> String {
    let end = tag_body
        .iter()
        .position(|b| b.is_ascii_whitespace() || *b == b'/' || *b == b'>')
        .unwrap_or(tag_body.len());
    String::from_utf8_lossy(&tag_body[..end]).into_owned()
}

/// Parse one complete top-level stanza.
///
/// Stanzas inherit their namespace from the stream element, which minidom
/// never sees, so the stream's default namespace is declared on the root
/// element when the client did not declare one itself.
fn parse_stanza(raw: &str, default_ns: &str) -> Result<Element, XmppError> {
    let open_len = match scan_markup(raw.as_bytes()) {
        Scan::Found { len, .. } => len,
        _ => return Err(XmppError::xml_parse("Incomplete stanza")),
    };
    let open_tag = &raw[..open_len];
    let name_end = 1 + element_name(&raw.as_bytes()[1..]).len();

    let mut declarations = String::new();
    if !open_tag.contains(" xmlns=") && !open_tag.contains("\txmlns=") && !open_tag.contains("\nxmlns=") {
        declarations.push_str(&format!(" xmlns='{}'", default_ns));
    }
    if raw[1..name_end].starts_with("stream:") && !open_tag.contains("xmlns:stream=") {
        declarations.push_str(&format!(" xmlns:stream='{}'", ns::STREAM));
    }

    let source = if declarations.is_empty() {
        raw.to_string()
    } else {
        format!("{}{}{}", &raw[..name_end], declarations, &raw[name_end..])
    };

    source
        .parse::<Element>()
        .map_err(|e| XmppError::xml_parse(format!("Failed to parse element: {}", e)))
}

/// Convert a minidom Element back to an XML string.
pub fn element_to_string(element: &Element) -> Result<String, XmppError> {
    let mut output = Vec::new();
    element
        .write_to(&mut output)
        .map_err(|e| XmppError::xml_parse(format!("Failed to serialize element: {}", e)))?;
    String::from_utf8(output).map_err(|e| XmppError::xml_parse(format!("Invalid UTF-8: {}", e)))
}

/// Escape text for an attribute value or character data.
pub fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
