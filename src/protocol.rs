//! The implementation of the protocol itself (no message specific details).
//!
//! You usually shouldn't have to interact with things from here and use the message types
//! directly. However, you can if you want to.
//!
//! ## Examples
//!
//! Serialization and deserialization is handled through the core [`Message`] type. Arguments are
//! held as raw bytes rather than `String`, since katcp payloads are not required to be valid
//! UTF-8 (binary sensor values, for instance, are free to carry arbitrary octets).
//!
//! ### Deserialization
//!
//! ```
//! use katcp::protocol::Message;
//!
//! let msg_bytes = b"?set-unknown-paramer[123] 6.1 true my-attribute\n";
//! let msg = Message::parse(msg_bytes).unwrap();
//! ```
//!
//! ### Serialization
//!
//! ```
//! use katcp::protocol::{Message, MessageKind};
//!
//! let msg = Message::new(MessageKind::Inform, "foo-bar", None, vec![
//!     b"param-1".to_vec(), b"param-2".to_vec(),
//! ])
//! .unwrap();
//! let wire = msg.to_bytes();
//! ```

use std::fmt::Display;

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{alpha1, alphanumeric1, char, digit0, none_of, one_of},
    combinator::{eof, map_res, opt, recognize},
    error::Error,
    multi::{many0, many1},
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};

use crate::error::KatcpError;

/// The largest message id katcp allows, `2^36 - 1`, matching the range servers are required to
/// accept and reject beyond.
pub const MAX_MESSAGE_ID: u64 = (1u64 << 36) - 1;

#[derive(Debug, PartialEq, Eq, Hash, Copy, Clone)]
/// The kind of katcp message. The docs call this the type, but we want to scoot
/// around the fact that `type` is a reserved keyword.
pub enum MessageKind {
    /// Request (?) messages will always be acknowledged by a reply
    Request,
    /// Reply (!) messages are sent in response to a `Request`
    Reply,
    /// Inform (#) messages can be sent asynchronously and do not invoke a reply
    Inform,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
/// The core raw message type of katcp.
pub struct Message {
    pub(crate) kind: MessageKind,
    pub(crate) name: String,
    pub(crate) id: Option<u64>,
    /// The (potentially empty) vector of message arguments, held as raw bytes. Consumers use the
    /// `ToKatcpArgument`/`FromKatcpArgument` traits to move between these and typed values.
    pub(crate) arguments: Vec<Vec<u8>>,
}

pub type MessageResult = Result<Message, KatcpError>;

impl Message {
    /// A constructor that does *not* validate that `name` and `arguments` are valid katcp tokens.
    ///
    /// # Safety
    /// The caller must guarantee `name` matches the `name` grammar and every argument contains no
    /// raw whitespace, NUL, CR, LF, or unescaped backslash, or the serialized result will be
    /// malformed.
    pub unsafe fn new_unchecked<T: AsRef<str>>(
        kind: MessageKind,
        name: T,
        id: Option<u64>,
        arguments: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            kind,
            name: name.as_ref().into(),
            id,
            arguments,
        }
    }

    /// Constructs and validates a message, checking the name, id, and each argument against the
    /// wire grammar.
    pub fn new<T: AsRef<str>>(
        kind: MessageKind,
        name: T,
        id: Option<u64>,
        arguments: Vec<Vec<u8>>,
    ) -> MessageResult {
        let (rest, _) = self::name(name.as_ref().as_bytes())
            .map_err(|e| KatcpError::SyntaxError(format!("invalid message name: {e}")))?;
        if !rest.is_empty() {
            return Err(KatcpError::SyntaxError(format!(
                "trailing bytes after message name: {:?}",
                name.as_ref()
            )));
        }
        if let Some(id) = id {
            if id == 0 || id > MAX_MESSAGE_ID {
                return Err(KatcpError::SyntaxError(format!(
                    "message id {id} out of range"
                )));
            }
        }
        for arg in &arguments {
            let (rest, _) = self::argument(arg)
                .map_err(|e| KatcpError::SyntaxError(format!("invalid argument: {e}")))?;
            if !rest.is_empty() {
                return Err(KatcpError::SyntaxError(
                    "trailing bytes after argument".to_owned(),
                ));
            }
        }
        // Safety: name, id, and every argument were just validated above.
        Ok(unsafe { Self::new_unchecked(kind, name, id, arguments) })
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn arguments(&self) -> &[Vec<u8>] {
        &self.arguments
    }

    /// Consumes the message, returning its arguments.
    pub fn into_arguments(self) -> Vec<Vec<u8>> {
        self.arguments
    }

    /// Parses a single message out of a leading slice of `input`, returning the parsed message
    /// and the remaining unconsumed bytes.
    pub fn parse_with_remainder(input: &[u8]) -> Result<(Message, &[u8]), KatcpError> {
        match message(input) {
            Ok((rest, m)) => Ok((m, rest)),
            Err(e) => Err(KatcpError::SyntaxError(format!("{e}"))),
        }
    }

    /// Parses a single, complete message from `input`, failing if trailing bytes remain.
    pub fn parse(input: &[u8]) -> MessageResult {
        let (m, rest) = Self::parse_with_remainder(input)?;
        if !rest.is_empty() {
            return Err(KatcpError::SyntaxError(
                "trailing bytes after message".to_owned(),
            ));
        }
        Ok(m)
    }

    /// Serializes the message to its canonical wire representation, including the trailing `\n`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(match self.kind {
            MessageKind::Request => b'?',
            MessageKind::Reply => b'!',
            MessageKind::Inform => b'#',
        });
        out.extend_from_slice(self.name.as_bytes());
        if let Some(id) = self.id {
            out.push(b'[');
            out.extend_from_slice(id.to_string().as_bytes());
            out.push(b']');
        }
        for arg in &self.arguments {
            out.push(b' ');
            out.extend_from_slice(arg);
        }
        out.push(b'\n');
        out
    }
}

fn kind(input: &[u8]) -> IResult<&[u8], MessageKind> {
    let (remaining, typ) = one_of("!#?")(input)?;
    Ok((remaining, match typ {
        '?' => MessageKind::Request,
        '!' => MessageKind::Reply,
        '#' => MessageKind::Inform,
        _ => unreachable!(),
    }))
}

fn whitespace(input: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(many1(one_of(" \t")))(input)
}

fn name(input: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(pair(alpha1, many0(alt((alphanumeric1, tag("-"))))))(input)
}

fn id(input: &[u8]) -> IResult<&[u8], u64> {
    map_res(
        delimited(
            char('['),
            recognize(tuple((one_of("123456789"), digit0))),
            char(']'),
        ),
        |digits: &[u8]| {
            let value = std::str::from_utf8(digits).unwrap().parse::<u64>().unwrap();
            if value > MAX_MESSAGE_ID {
                Err(KatcpError::ValueDecodeError(format!(
                    "message id {value} exceeds the maximum of {MAX_MESSAGE_ID}"
                )))
            } else {
                Ok(value)
            }
        },
    )(input)
}

fn escape(input: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(pair(char('\\'), one_of("\\_0nret@")))(input)
}

fn eol(input: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(one_of("\n\r"))(input)
}

fn plain(input: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(many1(none_of("\\ \0\n\r\t")))(input)
}

fn argument(input: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(many1(alt((escape, plain))))(input)
}

/// The parser combinator for messages. One could write a grammar that utilizes this parser with
/// nom directly against a byte stream.
pub fn message(input: &[u8]) -> IResult<&[u8], Message> {
    let (remaining, (kind, name, id, arguments, _, _)) = tuple((
        kind,
        name,
        opt(id),
        many0(preceded(whitespace, argument)),
        opt(whitespace),
        alt((eol, eof)),
    ))(input)?;

    let name = std::str::from_utf8(name).unwrap_or_default();
    // Arguments are kept in their escaped wire form here; unescaping is the job of the
    // `FromKatcpArgument` impl for the type a caller decodes them into.
    let arguments: Vec<Vec<u8>> = arguments.into_iter().map(|a| a.to_vec()).collect();

    // Safety: name and arguments just came from the grammar above, so they are valid tokens.
    // `id` is bounded by digit0 here but not yet range-checked; callers that need the
    // max-id invariant go through `Message::new`.
    Ok((remaining, unsafe {
        Message::new_unchecked(kind, name, id, arguments)
    }))
}

impl std::str::FromStr for Message {
    type Err = KatcpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.as_bytes())
    }
}

impl TryFrom<&str> for Message {
    type Error = KatcpError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s.as_bytes())
    }
}

impl TryFrom<&[u8]> for Message {
    type Error = KatcpError;

    fn try_from(s: &[u8]) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

/// A lossy, human-readable rendering of the message, substituting the UTF-8 replacement
/// character for any non-UTF-8 bytes. Arguments are already in their escaped wire form, so this
/// does not escape them again. Use [`Message::to_bytes`] for anything that needs to round-trip.
impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let type_char = match self.kind {
            MessageKind::Request => '?',
            MessageKind::Reply => '!',
            MessageKind::Inform => '#',
        };
        write!(f, "{}{}", type_char, self.name)?;
        if let Some(id) = self.id {
            write!(f, "[{id}]")?;
        }
        for arg in &self.arguments {
            write!(f, " {}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod parser_tests {
    use super::*;

    #[test]
    fn test_msg_type() {
        assert_eq!(Ok((&b""[..], MessageKind::Reply)), kind(b"!"));
        assert_eq!(Ok((&b""[..], MessageKind::Inform)), kind(b"#"));
        assert_eq!(Ok((&b""[..], MessageKind::Request)), kind(b"?"));
    }

    #[test]
    fn test_name() {
        assert_eq!(Ok((&b""[..], &b"set-rate"[..])), name(b"set-rate"));
        assert_eq!(Ok((&b""[..], &b"foobar"[..])), name(b"foobar"));
        assert_eq!(Ok((&b""[..], &b"f00-bar"[..])), name(b"f00-bar"));
    }

    #[test]
    fn test_msg_id() {
        assert_eq!(Ok((&b""[..], 123)), id(b"[123]"));
        assert_eq!(Ok((&b""[..], 100)), id(b"[100]"));
        assert_eq!(Ok((&b""[..], 9)), id(b"[9]"));
    }

    #[test]
    fn test_escaped() {
        assert_eq!(Ok((&b""[..], &b"\\\\"[..])), escape(b"\\\\"));
        assert_eq!(Ok((&b""[..], &b"\\_"[..])), escape(b"\\_"));
        assert_eq!(Ok((&b""[..], &b"\\@"[..])), escape(b"\\@"));
    }

    #[test]
    fn test_message() {
        assert_eq!(
            Message::new(MessageKind::Request, "set-rate", None, vec![b"5.1".to_vec()]).unwrap(),
            message(b"?set-rate 5.1").unwrap().1
        );
        assert_eq!(
            Message::new(MessageKind::Request, "set-rate", None, vec![b"5.1".to_vec()]).unwrap(),
            message(b"?set-rate 5.1\n").unwrap().1
        );
        assert_eq!(
            Message::new(MessageKind::Reply, "set-rate", Some(123), vec![b"ok".to_vec()])
                .unwrap(),
            message(b"!set-rate[123] ok").unwrap().1
        );
        assert_eq!(
            Message::new(
                MessageKind::Inform,
                "sensor-list",
                None,
                vec![
                    b"drive.enable-azim".to_vec(),
                    b"Azimuth drive enable signal status".to_vec(),
                    b"".to_vec(),
                    b"boolean".to_vec(),
                ]
            )
            .unwrap(),
            message(
                b"#sensor-list drive.enable-azim Azimuth\\_drive\\_enable\\_signal\\_status \\@ boolean"
            )
            .unwrap()
            .1
        );
    }

    #[test]
    fn test_message_id_out_of_range_rejected() {
        assert!(Message::new(MessageKind::Request, "foo", Some(1_000_000_000_000), vec![])
            .is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_range_message_id() {
        assert!(Message::parse(b"!ok[1000000000000]\n").is_err());
    }

    #[test]
    fn test_hash_agrees_with_equality() {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        fn hash_of(m: &Message) -> u64 {
            let mut hasher = DefaultHasher::new();
            m.hash(&mut hasher);
            hasher.finish()
        }

        let a = Message::new(MessageKind::Request, "foo", Some(7), vec![b"bar".to_vec()]).unwrap();
        let b = Message::new(MessageKind::Request, "foo", Some(7), vec![b"bar".to_vec()]).unwrap();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_raw_byte_argument_is_preserved() {
        let raw = vec![0xffu8];
        let msg = Message::new(MessageKind::Inform, "foo", None, vec![raw.clone()]).unwrap();
        assert_eq!(msg.arguments()[0], raw);
        let bytes = msg.to_bytes();
        assert!(bytes.contains(&0xff));
    }
}

#[cfg(test)]
mod there_and_back_tests {
    use super::*;

    #[test]
    fn struct_and_back() {
        let msg = Message::new(MessageKind::Inform, "foo-bar", Some(123), vec![
            b"foo".to_vec(),
            b"bar".to_vec(),
        ])
        .unwrap();
        assert_eq!(Message::parse(&msg.to_bytes()).unwrap(), msg);
    }

    #[test]
    fn bytes_and_back() {
        let msg_bytes = b"#foo-bar[123] foo bar\n";
        assert_eq!(&Message::parse(msg_bytes).unwrap().to_bytes(), msg_bytes);
    }
}
