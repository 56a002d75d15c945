use chrono::{DateTime, TimeZone, Utc};
use katcp_derive::KatcpDiscrete;

use crate::{
    error::KatcpError,
    protocol::{Message, MessageResult},
    utils::{escape, unescape},
};

/// The trait that specific katcp messages should implement.
pub trait KatcpMessage: TryFrom<Message> {
    fn to_message(&self, id: Option<u64>) -> MessageResult;
}

/// The trait implemented for every type that can fill a single katcp argument slot.
pub trait ToKatcpArgument {
    fn to_argument(&self) -> Vec<u8>;
}

/// The trait implemented for every type that can be parsed out of a single katcp argument slot.
pub trait FromKatcpArgument
where
    Self: Sized,
{
    type Err; // Not Error, so it doesn't clash with Self being an enum with an `Error` variant.
    fn from_argument(s: &[u8]) -> Result<Self, Self::Err>;
}

pub trait KatcpArgument: ToKatcpArgument + FromKatcpArgument {}

impl<T> KatcpArgument for T where T: ToKatcpArgument + FromKatcpArgument {}

/// The trait implemented for message payloads that span more than one argument slot (replies and
/// informs whose fields are flattened directly onto the message's argument list).
pub trait ToKatcpArguments {
    fn to_arguments(&self) -> Vec<Vec<u8>>;
}

pub trait FromKatcpArguments
where
    Self: Sized,
{
    type Err;
    fn from_arguments(args: &mut dyn Iterator<Item = Vec<u8>>) -> Result<Self, Self::Err>;
}

// ---- Implementations for the core katcp argument types

impl ToKatcpArgument for str {
    fn to_argument(&self) -> Vec<u8> {
        escape(self.as_bytes())
    }
}

impl ToKatcpArgument for String {
    fn to_argument(&self) -> Vec<u8> {
        escape(self.as_bytes())
    }
}

impl FromKatcpArgument for String {
    type Err = KatcpError;

    fn from_argument(s: &[u8]) -> Result<Self, Self::Err> {
        String::from_utf8(unescape(s)).map_err(|e| KatcpError::ValueDecodeError(e.to_string()))
    }
}

/// Opaque-bytes katcp argument type: escapes/unescapes but performs no UTF-8 validation.
impl ToKatcpArgument for Vec<u8> {
    fn to_argument(&self) -> Vec<u8> {
        escape(self)
    }
}

impl FromKatcpArgument for Vec<u8> {
    type Err = KatcpError;

    fn from_argument(s: &[u8]) -> Result<Self, Self::Err> {
        Ok(unescape(s))
    }
}

impl ToKatcpArgument for bool {
    fn to_argument(&self) -> Vec<u8> {
        if *self { b"1".to_vec() } else { b"0".to_vec() }
    }
}

impl FromKatcpArgument for bool {
    type Err = KatcpError;

    fn from_argument(s: &[u8]) -> Result<Self, Self::Err> {
        match s {
            b"1" => Ok(true),
            b"0" => Ok(false),
            _ => Err(KatcpError::ValueDecodeError(format!(
                "{:?} is not a valid boolean",
                String::from_utf8_lossy(s)
            ))),
        }
    }
}

macro_rules! impl_integer_argument {
    ($ty:ty) => {
        impl ToKatcpArgument for $ty {
            fn to_argument(&self) -> Vec<u8> {
                self.to_string().into_bytes()
            }
        }

        impl FromKatcpArgument for $ty {
            type Err = KatcpError;

            fn from_argument(s: &[u8]) -> Result<Self, Self::Err> {
                let s = std::str::from_utf8(s)
                    .map_err(|e| KatcpError::ValueDecodeError(e.to_string()))?;
                if s.contains('.') {
                    return Err(KatcpError::ValueDecodeError(format!(
                        "{s:?} is not an integer"
                    )));
                }
                s.parse::<$ty>()
                    .map_err(|e| KatcpError::ValueDecodeError(e.to_string()))
            }
        }
    };
}

impl_integer_argument!(u32);
impl_integer_argument!(u64);
impl_integer_argument!(i32);
impl_integer_argument!(i64);

macro_rules! impl_float_argument {
    ($ty:ty) => {
        impl ToKatcpArgument for $ty {
            fn to_argument(&self) -> Vec<u8> {
                self.to_string().into_bytes()
            }
        }

        impl FromKatcpArgument for $ty {
            type Err = KatcpError;

            fn from_argument(s: &[u8]) -> Result<Self, Self::Err> {
                let s = std::str::from_utf8(s)
                    .map_err(|e| KatcpError::ValueDecodeError(e.to_string()))?;
                if s.is_empty() {
                    return Err(KatcpError::ValueDecodeError("empty float".to_owned()));
                }
                s.parse::<$ty>()
                    .map_err(|e| KatcpError::ValueDecodeError(e.to_string()))
            }
        }
    };
}

impl_float_argument!(f32);
impl_float_argument!(f64);

impl ToKatcpArgument for DateTime<Utc> {
    fn to_argument(&self) -> Vec<u8> {
        let secs = self.timestamp() as f64;
        let nano = self.timestamp_subsec_nanos();
        let frac = nano as f64 / 1e9;
        (secs + frac).to_string().into_bytes()
    }
}

impl FromKatcpArgument for DateTime<Utc> {
    type Err = KatcpError;

    fn from_argument(s: &[u8]) -> Result<Self, Self::Err> {
        let s = std::str::from_utf8(s).map_err(|e| KatcpError::ValueDecodeError(e.to_string()))?;
        let fractional: f64 = s
            .parse()
            .map_err(|_| KatcpError::ValueDecodeError(format!("{s:?} is not a timestamp")))?;
        let secs = fractional as i64;
        let nanos = (fractional.fract() * 1e9) as u32;
        Utc.timestamp_opt(secs, nanos)
            .single()
            .ok_or_else(|| KatcpError::ValueDecodeError(format!("{s:?} is out of range")))
    }
}

impl<T> ToKatcpArgument for Option<T>
where
    T: ToKatcpArgument,
{
    fn to_argument(&self) -> Vec<u8> {
        match self {
            Some(v) => v.to_argument(),
            None => b"\\@".to_vec(),
        }
    }
}

impl<E, T> FromKatcpArgument for Option<T>
where
    T: FromKatcpArgument<Err = E>,
{
    type Err = E;

    fn from_argument(s: &[u8]) -> Result<Self, Self::Err> {
        match s {
            b"\\@" => Ok(None),
            _ => Ok(Some(T::from_argument(s)?)),
        }
    }
}

#[derive(KatcpDiscrete, Debug, PartialEq, Eq, Copy, Clone)]
/// Return codes that form the first parameter of a reply message.
pub enum RetCode {
    /// Request successfully processed. Further arguments are request-specific.
    Ok,
    /// Request malformed. Second argument is a human-readable description of the error.
    Invalid,
    /// Valid request that could not be processed. Second argument is a human-readable
    /// description of the error.
    Fail,
}

/// Convenience helper for round-trip testing a [`KatcpMessage`].
pub fn roundtrip_test<T, E>(message: T)
where
    E: std::fmt::Debug,
    T: KatcpMessage + PartialEq + std::fmt::Debug + TryFrom<Message, Error = E>,
{
    let raw = message.to_message(None).unwrap();
    let bytes = raw.to_bytes();
    println!("Katcp Payload:\n{}", String::from_utf8_lossy(&bytes));
    let raw_test = Message::parse(&bytes).unwrap();
    let message_test = raw_test.try_into().unwrap();
    assert_eq!(message, message_test)
}

#[cfg(test)]
mod test_arguments {
    use super::*;

    #[test]
    fn test_string() {
        let s = "This is a message with spaces\n";
        assert_eq!(
            s,
            String::from_argument(&s.to_owned().to_argument()).unwrap()
        );
    }

    #[test]
    fn test_timestamp() {
        let ts = Utc.timestamp_opt(42069, 42069000).unwrap();
        assert_eq!(ts, DateTime::<Utc>::from_argument(&ts.to_argument()).unwrap());
    }

    #[test]
    fn test_option() {
        let s = Some("\tFoo a bar\n".to_owned());
        assert_eq!(s, Option::<String>::from_argument(&s.to_argument()).unwrap())
    }

    #[test]
    fn test_ret_code() {
        let code = RetCode::Invalid;
        assert_eq!(code, RetCode::from_argument(&code.to_argument()).unwrap())
    }

    #[test]
    fn test_raw_bytes_round_trip() {
        let raw = vec![0xffu8, 0x00, b'x'];
        assert_eq!(raw, Vec::<u8>::from_argument(&raw.to_argument()).unwrap());
    }
}
