use std::net::IpAddr;

use combine::parser::char::*;
use combine::parser::combinator::*;
use combine::*;
use combine::{ParseError, Parser, Stream};

use crate::event::MediaKind;
use crate::rtp::{Pt, SessionId};

use super::data::*;

/// Creates a parser of the session body.
pub fn body_parser<Input>() -> impl Parser<Input, Output = SessionBody>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (
        typed_line('v', token('0')),                         // v=0
        originator_line(),                                   // o=- 4711 1 IN IP4 10.0.0.5
        typed_line('s', any_value()),                        // s=-
        many::<Vec<_>, _, _>(ignored_session_line()),        // i=, u=, e=, p=
        optional(typed_line('c', connection_value())),       // c=IN IP4 10.0.0.5
        many::<Vec<_>, _, _>(typed_line('b', any_value())), // b=AS:64
        typed_line('t', any_value()),                        // t=0 0
        many::<Vec<_>, _, _>(typed_line('a', any_value())),  // session attributes
        many::<Vec<_>, _, _>(media_parser()),
    )
        .map(|(_, (session_id, version, o_addr), _, _, c_addr, _, _, _, media)| {
            let media: Vec<Option<MediaLine>> = media;
            SessionBody {
                session_id,
                version,
                addr: c_addr.unwrap_or(o_addr),
                media: media.into_iter().flatten().collect(),
            }
        })
}

/// `o=<username> <sess-id> <sess-version> IN <addrtype> <unicast-address>`
fn originator_line<Input>() -> impl Parser<Input, Output = (SessionId, u64, IpAddr)>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    typed_line(
        'o',
        (
            not_sp(),
            token(' '),
            from_str(many1::<String, _, _>(digit())),
            token(' '),
            from_str(many1::<String, _, _>(digit())),
            token(' '),
            connection_value(),
        )
            .map(|(_, _, sess, _, version, _, addr): (_, _, u64, _, u64, _, _)| {
                (SessionId::from(sess), version, addr)
            }),
    )
}

/// `IN IP4 10.0.0.5`
fn connection_value<Input>() -> impl Parser<Input, Output = IpAddr>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (
        string("IN"),
        token(' '),
        not_sp(),
        token(' '),
        from_str(not_sp()),
    )
        .map(|(_, _, _, _, addr)| addr)
}

fn ignored_session_line<Input>() -> impl Parser<Input, Output = ()>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    line(one_of("iuepzk".chars()), any_value()).map(|_| ())
}

#[derive(Debug)]
enum MediaAttr {
    Rtpmap(Pt, String, u32),
    Ptime(u32),
    Crypto(String),
    Other,
}

/// One m= section. Sections of kinds other than audio and video come out as `None`.
fn media_parser<Input>() -> impl Parser<Input, Output = Option<MediaLine>>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (
        media_line(),
        optional(typed_line('c', any_value())),
        many::<Vec<_>, _, _>(typed_line('b', any_value())),
        many::<Vec<_>, _, _>(media_attribute_line()),
    )
        .map(|((kind, port, pt), _, _, attrs)| {
            let kind = kind?;
            let attrs: Vec<MediaAttr> = attrs;

            let mut rtpmap = None;
            let mut ptime = None;
            let mut key = None;

            for a in attrs {
                match a {
                    MediaAttr::Rtpmap(p, enc, rate) if p == pt => rtpmap = Some((enc, rate)),
                    MediaAttr::Ptime(v) => ptime = Some(v),
                    MediaAttr::Crypto(k) => key = key.or(Some(k)),
                    _ => {}
                }
            }

            let (encoding, clock_rate) = rtpmap.unwrap_or_else(|| static_rtpmap(pt));

            Some(MediaLine {
                kind,
                port,
                pt,
                encoding,
                clock_rate,
                ptime,
                key,
            })
        })
}

/// Encodings of the static payload types we might see without an rtpmap.
fn static_rtpmap(pt: Pt) -> (String, u32) {
    match *pt {
        0 => ("PCMU".into(), 8000),
        8 => ("PCMA".into(), 8000),
        _ => (String::new(), 0),
    }
}

/// `m=audio 40000 RTP/AVP 8 101`. Only the first format counts.
fn media_line<Input>() -> impl Parser<Input, Output = (Option<MediaKind>, u16, Pt)>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    let kind = choice((
        attempt(string("audio").map(|_| Some(MediaKind::Audio))),
        attempt(string("video").map(|_| Some(MediaKind::Video))),
        not_sp().map(|_| None),
    ));

    let pt = from_str(many1::<String, _, _>(digit())).map(|v: u8| Pt::from(v));

    typed_line(
        'm',
        (
            kind,
            token(' '),
            from_str(many1::<String, _, _>(digit())),
            token(' '),
            not_sp(),
            token(' '),
            sep_by1::<Vec<Pt>, _, _, _>(pt, token(' ')),
        )
            .map(|(kind, _, port, _, _, _, pts): (_, _, u16, _, _, _, Vec<Pt>)| {
                (kind, port, pts[0])
            }),
    )
}

fn media_attribute_line<Input>() -> impl Parser<Input, Output = MediaAttr>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    // a=rtpmap:8 PCMA/8000
    let rtpmap = (
        string("rtpmap:"),
        from_str(many1::<String, _, _>(digit())),
        token(' '),
        many1::<String, _, _>(satisfy(|c| c != '/' && c != '\r' && c != '\n')),
        token('/'),
        from_str(many1::<String, _, _>(digit())),
        skip_many(satisfy(|c| c != '\r' && c != '\n')),
    )
        .map(|(_, pt, _, enc, _, rate, _): (_, u8, _, _, _, u32, _)| {
            MediaAttr::Rtpmap(pt.into(), enc, rate)
        });

    // a=ptime:20
    let ptime = (string("ptime:"), from_str(many1::<String, _, _>(digit())))
        .map(|(_, v): (_, u32)| MediaAttr::Ptime(v));

    // a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:<key>|2^20|1:32
    let crypto = (
        string("crypto:"),
        many1::<String, _, _>(digit()),
        token(' '),
        not_sp(),
        token(' '),
        string("inline:"),
        many1::<String, _, _>(satisfy(|c| c != '|' && c != ' ' && c != '\r' && c != '\n')),
        skip_many(satisfy(|c| c != '\r' && c != '\n')),
    )
        .map(|(_, _, _, _, _, _, key, _)| MediaAttr::Crypto(key));

    typed_line(
        'a',
        choice((
            attempt(rtpmap),
            attempt(ptime),
            attempt(crypto),
            any_value().map(|_| MediaAttr::Other),
        )),
    )
}

/// A line starting with the given type character.
fn typed_line<Input, Pval, Out>(expected: char, val: Pval) -> impl Parser<Input, Output = Out>
where
    Input: Stream<Token = char>,
    Pval: Parser<Input, Output = Out>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    line(token(expected), val)
}

/// A line with some parser for value and parser for type.
fn line<Input, Ptyp, Pval, Out>(typ: Ptyp, val: Pval) -> impl Parser<Input, Output = Out>
where
    Ptyp: Parser<Input, Output = char>,
    Pval: Parser<Input, Output = Out>,
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    attempt((typ, token('='), val, line_end()))
        .map(|(_, _, value, _)| value)
        .message("body line")
}

/// Not SP, \r or \n
fn not_sp<Input>() -> impl Parser<Input, Output = String>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    many1(satisfy(|c| c != ' ' && c != '\r' && c != '\n'))
}

/// Any value that isn't \r or \n.
fn any_value<Input>() -> impl Parser<Input, Output = String>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    many1(satisfy(|c| c != '\r' && c != '\n'))
}

/// \r\n, \n or EOF.
fn line_end<Input>() -> impl Parser<Input, Output = ()>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    choice((crlf().map(|_| ()), newline().map(|_| ()), eof()))
}
