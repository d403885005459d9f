use combine::parser::char::*;
use combine::parser::combinator::*;
use combine::*;
use combine::{ParseError, Parser, Stream};

use super::message::{Method, Uri};

/// First line of a message.
#[derive(Debug, PartialEq, Eq)]
pub enum StartLine {
    /// `INVITE sip:1001@host SIP/2.0`
    Request(Method, Uri),
    /// `SIP/2.0 180 Ringing`
    Status(u16, String),
}

/// Start line, header lines and the empty line ending the head. The body is
/// whatever input remains.
pub fn message_head<Input>() -> impl Parser<Input, Output = (StartLine, Vec<(String, String)>)>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (
        choice((attempt(status_line()), request_line())),
        many::<Vec<_>, _, _>(header_line()),
        line_end(),
    )
        .map(|(start, headers, _)| (start, headers))
}

fn status_line<Input>() -> impl Parser<Input, Output = StartLine>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (
        string("SIP/2.0"),
        token(' '),
        from_str(count_min_max::<String, _, _>(3, 3, digit())),
        optional(token(' ')),
        many::<String, _, _>(satisfy(|c| c != '\r' && c != '\n')),
        line_end(),
    )
        .map(|(_, _, code, _, reason, _)| StartLine::Status(code, reason))
        .message("status line")
}

fn request_line<Input>() -> impl Parser<Input, Output = StartLine>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (
        many1::<String, _, _>(satisfy(|c: char| c.is_ascii_alphabetic())),
        token(' '),
        uri_parser(),
        skip_many(satisfy(|c| c != ' ' && c != '\r' && c != '\n')),
        token(' '),
        string("SIP/2.0"),
        line_end(),
    )
        .map(|(method, _, uri, _, _, _, _)| {
            // FromStr for Method is infallible.
            let method = method.parse().unwrap_or(Method::Other(method));
            StartLine::Request(method, uri)
        })
        .message("request line")
}

/// `sip:user@host:port`, stopping before any URI parameters.
pub fn uri_parser<Input>() -> impl Parser<Input, Output = Uri>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    let user = attempt((
        many1::<String, _, _>(satisfy(|c| !matches!(c, '@' | ':' | ';' | '>' | ' ' | '\r' | '\n'))),
        token('@'),
    ))
    .map(|(u, _)| u);

    let host = many1::<String, _, _>(satisfy(|c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')
    }));

    let port = (token(':'), from_str(many1::<String, _, _>(digit()))).map(|(_, p): (_, u16)| p);

    (
        choice((attempt(string("sips:")), string("sip:"))),
        optional(user),
        host,
        optional(port),
    )
        .map(|(_, user, host, port)| Uri { user, host, port })
}

/// `Name: value`. Compact names come out in their long form.
fn header_line<Input>() -> impl Parser<Input, Output = (String, String)>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (
        many1::<String, _, _>(satisfy(|c| !matches!(c, ':' | ' ' | '\t' | '\r' | '\n'))),
        skip_many(one_of(" \t".chars())),
        token(':'),
        skip_many(one_of(" \t".chars())),
        many::<String, _, _>(satisfy(|c| c != '\r' && c != '\n')),
        line_end(),
    )
        .map(|(name, _, _, _, value, _)| (long_name(name), value.trim_end().to_string()))
}

fn long_name(name: String) -> String {
    let long = match name.as_str() {
        "i" | "I" => "Call-ID",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "v" | "V" => "Via",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        _ => return name,
    };
    long.to_string()
}

/// \r\n or \n
fn line_end<Input>() -> impl Parser<Input, Output = ()>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    choice((crlf().map(|_| ()), newline().map(|_| ())))
}
