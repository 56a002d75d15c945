//! Concrete wire types (`Address`, `Timestamp`) and the runtime-extensible type registry.
//!
//! Most message fields round-trip through the static `ToKatcpArgument`/`FromKatcpArgument`
//! traits in [`crate::messages::common`]. The registry here exists alongside that static
//! mechanism for the cases where a host type is only known at runtime -- mirroring the
//! `register_type`/`get_type` entry points of the protocol this crate implements.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt::Display,
    net::IpAddr,
    str::FromStr,
    sync::{Mutex, OnceLock},
};

use crate::{error::KatcpError, messages::common::{FromKatcpArgument, ToKatcpArgument}};

/// A floating-point count of seconds since the Unix epoch, as katcp represents timestamps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KatcpTimestamp(pub f64);

impl KatcpTimestamp {
    pub fn now() -> Self {
        let since_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self(since_epoch.as_secs_f64())
    }
}

impl Display for KatcpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToKatcpArgument for KatcpTimestamp {
    fn to_argument(&self) -> Vec<u8> {
        self.0.to_string().into_bytes()
    }
}

impl FromKatcpArgument for KatcpTimestamp {
    type Err = KatcpError;

    fn from_argument(s: &[u8]) -> Result<Self, Self::Err> {
        let s = std::str::from_utf8(s)
            .map_err(|e| KatcpError::ValueDecodeError(e.to_string()))?;
        s.parse::<f64>()
            .map(KatcpTimestamp)
            .map_err(|e| KatcpError::ValueDecodeError(e.to_string()))
    }
}

/// An IP address plus optional port, e.g. `10.0.0.1:7148` or `[::1]:7148`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KatcpAddress {
    pub ip: IpAddr,
    pub port: Option<u16>,
}

impl KatcpAddress {
    pub fn new(ip: IpAddr, port: Option<u16>) -> Self {
        Self { ip, port }
    }
}

impl Display for KatcpAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.ip, self.port) {
            (IpAddr::V4(ip), Some(port)) => write!(f, "{ip}:{port}"),
            (IpAddr::V4(ip), None) => write!(f, "{ip}"),
            (IpAddr::V6(ip), Some(port)) => write!(f, "[{ip}]:{port}"),
            (IpAddr::V6(ip), None) => write!(f, "[{ip}]"),
        }
    }
}

impl FromStr for KatcpAddress {
    type Err = KatcpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(KatcpError::ValueDecodeError("empty address".to_owned()));
        }
        if let Some(rest) = s.strip_prefix('[') {
            let (addr, rest) = rest
                .split_once(']')
                .ok_or_else(|| KatcpError::ValueDecodeError(format!("unterminated bracket in {s:?}")))?;
            let ip: std::net::Ipv6Addr = addr
                .parse()
                .map_err(|e| KatcpError::ValueDecodeError(format!("{e}")))?;
            let port = match rest.strip_prefix(':') {
                Some(p) => Some(
                    p.parse::<u16>()
                        .map_err(|e| KatcpError::ValueDecodeError(format!("{e}")))?,
                ),
                None if rest.is_empty() => None,
                None => {
                    return Err(KatcpError::ValueDecodeError(format!(
                        "unexpected trailing data in {s:?}"
                    )))
                }
            };
            return Ok(Self {
                ip: IpAddr::V6(ip),
                port,
            });
        }
        // Bare (unbracketed) IPv6 is rejected: only "A.B.C.D[:port]" or "[v6][:port]" are valid.
        if s.matches(':').count() > 1 {
            return Err(KatcpError::ValueDecodeError(format!(
                "bare IPv6 address must be bracketed: {s:?}"
            )));
        }
        match s.split_once(':') {
            Some((addr, port)) => {
                let ip: std::net::Ipv4Addr = addr
                    .parse()
                    .map_err(|e| KatcpError::ValueDecodeError(format!("{e}")))?;
                let port = port
                    .parse::<u16>()
                    .map_err(|e| KatcpError::ValueDecodeError(format!("{e}")))?;
                Ok(Self {
                    ip: IpAddr::V4(ip),
                    port: Some(port),
                })
            }
            None => {
                let ip: std::net::Ipv4Addr = s
                    .parse()
                    .map_err(|e| KatcpError::ValueDecodeError(format!("{e}")))?;
                Ok(Self {
                    ip: IpAddr::V4(ip),
                    port: None,
                })
            }
        }
    }
}

impl ToKatcpArgument for KatcpAddress {
    fn to_argument(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl FromKatcpArgument for KatcpAddress {
    type Err = KatcpError;

    fn from_argument(s: &[u8]) -> Result<Self, Self::Err> {
        let s = std::str::from_utf8(s)
            .map_err(|e| KatcpError::ValueDecodeError(e.to_string()))?;
        Self::from_str(s)
    }
}

type Encoder = Box<dyn Fn(&dyn Any) -> Vec<u8> + Send + Sync>;
type Decoder = Box<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>, KatcpError> + Send + Sync>;
type DefaultFn = Box<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>;

struct RegisteredType {
    #[allow(dead_code)]
    wire_name: &'static str,
    encode: Encoder,
    decode: Decoder,
    default: DefaultFn,
}

/// A runtime-extensible handle for encoding, decoding, and defaulting a host type `T`.
///
/// Obtained from [`get_type`]. Each call re-acquires the registry lock rather than borrowing
/// from it, so a handle carries no lifetime tied to the registry's internal storage.
pub struct RegisteredTypeHandle<T> {
    _marker: std::marker::PhantomData<T>,
}

impl<T: Any + Send> RegisteredTypeHandle<T> {
    pub fn encode(&self, value: &T) -> Vec<u8> {
        let guard = registry().lock().unwrap();
        let entry = guard.get(&TypeId::of::<T>()).expect("checked present in get_type");
        (entry.encode)(value)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<T, KatcpError> {
        let boxed = {
            let guard = registry().lock().unwrap();
            let entry = guard.get(&TypeId::of::<T>()).expect("checked present in get_type");
            (entry.decode)(bytes)?
        };
        boxed
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|_| KatcpError::TypeRegistryError("decoded value had the wrong type".into()))
    }

    pub fn default(&self) -> Result<T, KatcpError> {
        let boxed = {
            let guard = registry().lock().unwrap();
            let entry = guard.get(&TypeId::of::<T>()).expect("checked present in get_type");
            (entry.default)()
        };
        boxed
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|_| KatcpError::TypeRegistryError("default value had the wrong type".into()))
    }
}

fn registry() -> &'static Mutex<HashMap<TypeId, RegisteredType>> {
    static REGISTRY: OnceLock<Mutex<HashMap<TypeId, RegisteredType>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(base_registry()))
}

fn base_registry() -> HashMap<TypeId, RegisteredType> {
    let mut map = HashMap::new();
    map.insert(
        TypeId::of::<i64>(),
        RegisteredType {
            wire_name: "integer",
            encode: Box::new(|v| v.downcast_ref::<i64>().unwrap().to_string().into_bytes()),
            decode: Box::new(|b| {
                let s = std::str::from_utf8(b).map_err(|e| KatcpError::ValueDecodeError(e.to_string()))?;
                if s.contains('.') {
                    return Err(KatcpError::ValueDecodeError(format!(
                        "{s:?} is not an integer"
                    )));
                }
                s.parse::<i64>()
                    .map(|v| Box::new(v) as Box<dyn Any + Send>)
                    .map_err(|e| KatcpError::ValueDecodeError(e.to_string()))
            }),
            default: Box::new(|| Box::new(0i64)),
        },
    );
    map.insert(
        TypeId::of::<f64>(),
        RegisteredType {
            wire_name: "float",
            encode: Box::new(|v| v.downcast_ref::<f64>().unwrap().to_string().into_bytes()),
            decode: Box::new(|b| {
                let s = std::str::from_utf8(b).map_err(|e| KatcpError::ValueDecodeError(e.to_string()))?;
                if s.is_empty() {
                    return Err(KatcpError::ValueDecodeError("empty float".into()));
                }
                s.parse::<f64>()
                    .map(|v| Box::new(v) as Box<dyn Any + Send>)
                    .map_err(|e| KatcpError::ValueDecodeError(e.to_string()))
            }),
            default: Box::new(|| Box::new(0.0f64)),
        },
    );
    map.insert(
        TypeId::of::<bool>(),
        RegisteredType {
            wire_name: "boolean",
            encode: Box::new(|v| {
                if *v.downcast_ref::<bool>().unwrap() {
                    b"1".to_vec()
                } else {
                    b"0".to_vec()
                }
            }),
            decode: Box::new(|b| match b {
                b"1" => Ok(Box::new(true)),
                b"0" => Ok(Box::new(false)),
                _ => Err(KatcpError::ValueDecodeError(format!(
                    "{:?} is not a valid boolean",
                    String::from_utf8_lossy(b)
                ))),
            }),
            default: Box::new(|| Box::new(false)),
        },
    );
    map.insert(
        TypeId::of::<String>(),
        RegisteredType {
            wire_name: "string",
            encode: Box::new(|v| v.downcast_ref::<String>().unwrap().clone().into_bytes()),
            decode: Box::new(|b| {
                String::from_utf8(b.to_vec())
                    .map(|s| Box::new(s) as Box<dyn Any + Send>)
                    .map_err(|e| KatcpError::ValueDecodeError(e.to_string()))
            }),
            default: Box::new(|| Box::new(String::new())),
        },
    );
    map.insert(
        TypeId::of::<Vec<u8>>(),
        RegisteredType {
            wire_name: "discrete",
            encode: Box::new(|v| v.downcast_ref::<Vec<u8>>().unwrap().clone()),
            decode: Box::new(|b| Ok(Box::new(b.to_vec()))),
            default: Box::new(|| Box::new(Vec::<u8>::new())),
        },
    );
    map.insert(
        TypeId::of::<KatcpTimestamp>(),
        RegisteredType {
            wire_name: "timestamp",
            encode: Box::new(|v| v.downcast_ref::<KatcpTimestamp>().unwrap().to_string().into_bytes()),
            decode: Box::new(|b| {
                KatcpTimestamp::from_argument(b)
                    .map(|v| Box::new(v) as Box<dyn Any + Send>)
            }),
            default: Box::new(|| Box::new(KatcpTimestamp(0.0))),
        },
    );
    map.insert(
        TypeId::of::<KatcpAddress>(),
        RegisteredType {
            wire_name: "address",
            encode: Box::new(|v| v.downcast_ref::<KatcpAddress>().unwrap().to_string().into_bytes()),
            decode: Box::new(|b| {
                KatcpAddress::from_argument(b).map(|v| Box::new(v) as Box<dyn Any + Send>)
            }),
            default: Box::new(|| {
                Box::new(KatcpAddress::new(IpAddr::from([0, 0, 0, 0]), None))
            }),
        },
    );
    map
}

/// Registers a new host type with the process-wide type registry. Fails if `T` is already
/// registered, matching the write-once-per-type lifecycle.
pub fn register_type<T, E, D>(
    wire_name: &'static str,
    encode: E,
    decode: D,
    default: impl Fn() -> T + Send + Sync + 'static,
) -> Result<(), KatcpError>
where
    T: Any + Send,
    E: Fn(&T) -> Vec<u8> + Send + Sync + 'static,
    D: Fn(&[u8]) -> Result<T, KatcpError> + Send + Sync + 'static,
{
    let mut guard = registry().lock().unwrap();
    let id = TypeId::of::<T>();
    if guard.contains_key(&id) {
        return Err(KatcpError::TypeRegistryError(format!(
            "type {} is already registered",
            std::any::type_name::<T>()
        )));
    }
    guard.insert(
        id,
        RegisteredType {
            wire_name,
            encode: Box::new(move |v| encode(v.downcast_ref::<T>().unwrap())),
            decode: Box::new(move |b| decode(b).map(|v| Box::new(v) as Box<dyn Any + Send>)),
            default: Box::new(move || Box::new(default())),
        },
    );
    Ok(())
}

/// Looks up a registered type's codec, failing if it was never registered.
pub fn get_type<T: Any + Send>() -> Result<RegisteredTypeHandle<T>, KatcpError> {
    let guard = registry().lock().unwrap();
    if !guard.contains_key(&TypeId::of::<T>()) {
        return Err(KatcpError::TypeRegistryError(format!(
            "type {} is not registered",
            std::any::type_name::<T>()
        )));
    }
    Ok(RegisteredTypeHandle {
        _marker: std::marker::PhantomData,
    })
}

/// Encodes `value` using the registry's handler for `T`.
pub fn encode<T: Any + Send>(value: &T) -> Result<Vec<u8>, KatcpError> {
    Ok(get_type::<T>()?.encode(value))
}

/// Decodes `bytes` using the registry's handler for `T`.
pub fn decode<T: Any + Send>(bytes: &[u8]) -> Result<T, KatcpError> {
    get_type::<T>()?.decode(bytes)
}
