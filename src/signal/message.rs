use std::fmt;
use std::str::FromStr;

use combine::EasyParser;

use super::parser::{message_head, uri_parser, StartLine};
use super::SignalError;

/// Request methods.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// Call setup.
    Invite,
    /// Confirms a final response to INVITE.
    Ack,
    /// Ends a connected call.
    Bye,
    /// Abandons a pending INVITE.
    Cancel,
    /// Binds our address at the server.
    Register,
    /// Keep-alive and capability query.
    Options,
    /// Anything else, verbatim.
    Other(String),
}

impl Method {
    /// Wire name.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Other(v) => v,
        }
    }
}

impl FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "REGISTER" => Method::Register,
            "OPTIONS" => Method::Options,
            _ => Method::Other(s.to_string()),
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `sip:user@host:port`. URI parameters are not kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    /// User part.
    pub user: Option<String>,
    /// Host name or address.
    pub host: String,
    /// Port, when given.
    pub port: Option<u16>,
}

impl Uri {
    /// A URI with a user part.
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Uri {
            user: Some(user.into()),
            host: host.into(),
            port,
        }
    }

    /// Parse from the text form.
    pub fn parse(s: &str) -> Option<Uri> {
        uri_parser().easy_parse(s.trim()).ok().map(|(u, _)| u)
    }

    /// The user part, or empty.
    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or("")
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sip:")?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// The value of From, To and Contact: `"Name" <sip:user@host>;tag=abc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    /// Display name without quotes.
    pub display: Option<String>,
    /// The address.
    pub uri: Uri,
    /// The `tag` parameter.
    pub tag: Option<String>,
    /// The `expires` parameter, seen on Contact in REGISTER responses.
    pub expires: Option<u32>,
}

impl NameAddr {
    /// A bare address without display name or tag.
    pub fn new(uri: Uri) -> Self {
        NameAddr {
            display: None,
            uri,
            tag: None,
            expires: None,
        }
    }

    /// Parse a header value.
    pub fn parse(s: &str) -> Option<NameAddr> {
        let s = s.trim();

        let (display, uri, params) = if let Some(open) = s.find('<') {
            let close = s[open..].find('>')? + open;
            let display = s[..open].trim().trim_matches('"').trim();
            let display = (!display.is_empty()).then(|| display.to_string());
            (display, &s[open + 1..close], &s[close + 1..])
        } else {
            match s.find(';') {
                Some(i) => (None, &s[..i], &s[i..]),
                None => (None, s, ""),
            }
        };

        let mut addr = NameAddr::new(Uri::parse(uri)?);
        addr.display = display;

        for (k, v) in params.split(';').filter_map(|p| p.split_once('=')) {
            match k.trim().to_ascii_lowercase().as_str() {
                "tag" => addr.tag = Some(v.trim().to_string()),
                "expires" => addr.expires = v.trim().parse().ok(),
                _ => {}
            }
        }

        Some(addr)
    }

    /// Same address with the given tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(d) = &self.display {
            write!(f, "\"{}\" ", d)?;
        }
        write!(f, "<{}>", self.uri)?;
        if let Some(tag) = &self.tag {
            write!(f, ";tag={}", tag)?;
        }
        if let Some(expires) = self.expires {
            write!(f, ";expires={}", expires)?;
        }
        Ok(())
    }
}

/// Header lines in wire order. Lookup is case insensitive.
///
/// `Content-Length` is never stored, it is derived from the body when written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// First value of the header.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of the header, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Append a header line.
    pub fn push(&mut self, name: impl Into<String>, value: impl ToString) {
        let name = name.into();
        if name.eq_ignore_ascii_case("Content-Length") {
            return;
        }
        self.0.push((name, value.to_string()));
    }

    /// Replace the first header of that name, or append it.
    pub fn set(&mut self, name: &str, value: impl ToString) {
        match self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some((_, v)) => *v = value.to_string(),
            None => self.push(name, value),
        }
    }

    /// Remove every header of that name.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Iterate the header lines.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// `Call-ID`
    pub fn call_id(&self) -> Option<&str> {
        self.get("Call-ID").map(str::trim)
    }

    /// `CSeq` as sequence number and method.
    pub fn cseq(&self) -> Option<(u32, Method)> {
        let (n, m) = self.get("CSeq")?.trim().split_once(' ')?;
        let n = n.parse().ok()?;
        let m = m.trim().parse().ok()?;
        Some((n, m))
    }

    /// `From`
    pub fn from_addr(&self) -> Option<NameAddr> {
        self.get("From").and_then(NameAddr::parse)
    }

    /// `To`
    pub fn to_addr(&self) -> Option<NameAddr> {
        self.get("To").and_then(NameAddr::parse)
    }

    /// `Contact`
    pub fn contact(&self) -> Option<NameAddr> {
        self.get("Contact").and_then(NameAddr::parse)
    }

    /// `Expires` in seconds.
    pub fn expires(&self) -> Option<u32> {
        self.get("Expires").and_then(|v| v.trim().parse().ok())
    }
}

/// A request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Method.
    pub method: Method,
    /// Request URI.
    pub uri: Uri,
    /// Header lines.
    pub headers: Headers,
    /// Body text.
    pub body: String,
}

impl Request {
    /// A request without headers or body.
    pub fn new(method: Method, uri: Uri) -> Self {
        Request {
            method,
            uri,
            headers: Headers::default(),
            body: String::new(),
        }
    }
}

/// A response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Status code.
    pub code: u16,
    /// Reason phrase.
    pub reason: String,
    /// Header lines.
    pub headers: Headers,
    /// Body text.
    pub body: String,
}

impl Response {
    /// A response to `req` carrying its Via, From, To, Call-ID and CSeq.
    ///
    /// `to_tag` is added to To unless the request already had one.
    pub fn for_request(req: &Request, code: u16, to_tag: Option<&str>) -> Self {
        let mut headers = Headers::default();

        for via in req.headers.get_all("Via") {
            headers.push("Via", via);
        }
        if let Some(from) = req.headers.get("From") {
            headers.push("From", from);
        }
        if let Some(to) = req.headers.get("To") {
            match (req.headers.to_addr(), to_tag) {
                (Some(addr), Some(tag)) if addr.tag.is_none() => {
                    headers.push("To", addr.with_tag(tag));
                }
                _ => headers.push("To", to),
            }
        }
        if let Some(call_id) = req.headers.get("Call-ID") {
            headers.push("Call-ID", call_id);
        }
        if let Some(cseq) = req.headers.get("CSeq") {
            headers.push("CSeq", cseq);
        }

        Response {
            code,
            reason: reason_phrase(code).to_string(),
            headers,
            body: String::new(),
        }
    }

    /// 1xx
    pub fn is_provisional(&self) -> bool {
        self.code < 200
    }

    /// 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// A parsed or built signaling message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A request.
    Request(Request),
    /// A response.
    Response(Response),
}

impl Message {
    /// Parse a datagram.
    pub fn parse(raw: &[u8]) -> Result<Message, SignalError> {
        let text =
            std::str::from_utf8(raw).map_err(|e| SignalError::Parse(format!("not utf-8: {e}")))?;

        let ((start, lines), rest) = message_head()
            .easy_parse(text)
            .map_err(|e| SignalError::Parse(e.to_string()))?;

        let mut headers = Headers::default();
        let mut content_length = None;
        for (name, value) in lines {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = value.trim().parse::<usize>().ok();
            } else {
                headers.push(name, value);
            }
        }

        let body = match content_length {
            Some(len) => {
                if rest.len() < len || !rest.is_char_boundary(len) {
                    return Err(SignalError::Parse(format!(
                        "body shorter than Content-Length {len}"
                    )));
                }
                &rest[..len]
            }
            // Datagrams without Content-Length carry the rest as body.
            None => rest,
        };

        Ok(match start {
            StartLine::Request(method, uri) => Message::Request(Request {
                method,
                uri,
                headers,
                body: body.to_string(),
            }),
            StartLine::Status(code, reason) => Message::Response(Response {
                code,
                reason,
                headers,
                body: body.to_string(),
            }),
        })
    }

    /// Headers of either kind.
    pub fn headers(&self) -> &Headers {
        match self {
            Message::Request(r) => &r.headers,
            Message::Response(r) => &r.headers,
        }
    }

    /// Serialize for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (headers, body) = match self {
            Message::Request(r) => {
                write!(f, "{} {} SIP/2.0\r\n", r.method, r.uri)?;
                (&r.headers, &r.body)
            }
            Message::Response(r) => {
                write!(f, "SIP/2.0 {} {}\r\n", r.code, r.reason)?;
                (&r.headers, &r.body)
            }
        };
        for (name, value) in headers.iter() {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        write!(f, "Content-Length: {}\r\n\r\n{}", body.len(), body)
    }
}

impl From<Request> for Message {
    fn from(v: Request) -> Self {
        Message::Request(v)
    }
}

impl From<Response> for Message {
    fn from(v: Response) -> Self {
        Message::Response(v)
    }
}

/// Reason phrase for the codes we send.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        491 => "Request Pending",
        501 => "Not Implemented",
        603 => "Decline",
        _ => "Unknown",
    }
}
