//! Messages dealing with connecting to a device, halting it or restarting it and querying basic
//! information.

use std::{collections::HashSet, fmt::Display};

use katcp_derive::{KatcpDiscrete, KatcpMessage};

use crate::prelude::*;

#[derive(Debug, PartialEq, Eq, Clone)]
/// A reply that carries no data in the Ok branch, or a message in the error branch.
pub enum GenericReply {
    Ok,
    Error { ret_code: RetCode, message: String },
}

impl ToKatcpArguments for GenericReply {
    fn to_arguments(&self) -> Vec<Vec<u8>> {
        match self {
            Self::Ok => vec![RetCode::Ok.to_argument()],
            Self::Error { ret_code, message } => {
                vec![ret_code.to_argument(), message.to_argument()]
            }
        }
    }
}

impl FromKatcpArguments for GenericReply {
    type Err = KatcpError;

    fn from_arguments(args: &mut dyn Iterator<Item = Vec<u8>>) -> Result<Self, Self::Err> {
        let ret_code = RetCode::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?;
        Ok(match ret_code {
            RetCode::Ok => Self::Ok,
            _ => Self::Error {
                ret_code,
                message: String::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?,
            },
        })
    }
}

#[derive(KatcpMessage, Debug, PartialEq, Eq, Clone)]
/// Requesting a halt should trigger a software halt. It is expected to close the connection and
/// put the software and hardware into a state where it is safe to power down. The reply message
/// should be sent just before the halt occurs.
pub enum Halt {
    Request,
    Reply(GenericReply),
}

#[derive(Debug, PartialEq, Eq, Clone)]
/// A reply that carries an integer in the Ok branch, or a message in the error branch.
pub enum IntReply {
    Ok { num: u32 },
    Error { ret_code: RetCode, message: String },
}

impl ToKatcpArguments for IntReply {
    fn to_arguments(&self) -> Vec<Vec<u8>> {
        match self {
            Self::Ok { num } => vec![RetCode::Ok.to_argument(), num.to_argument()],
            Self::Error { ret_code, message } => {
                vec![ret_code.to_argument(), message.to_argument()]
            }
        }
    }
}

impl FromKatcpArguments for IntReply {
    type Err = KatcpError;

    fn from_arguments(args: &mut dyn Iterator<Item = Vec<u8>>) -> Result<Self, Self::Err> {
        let ret_code = RetCode::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?;
        let num_or_msg = args.next().ok_or(KatcpError::MissingArgument)?;
        Ok(match ret_code {
            RetCode::Ok => Self::Ok {
                num: u32::from_argument(&num_or_msg)?,
            },
            _ => Self::Error {
                ret_code,
                message: String::from_argument(&num_or_msg)?,
            },
        })
    }
}

#[derive(KatcpMessage, Debug, PartialEq, Eq, Clone)]
/// The core help message type.
pub enum Help {
    /// Although the description is not intended to be machine readable, the preferred convention
    /// for describing parameters and return values is a BNF-like syntax (brackets for optional
    /// arguments, vertical bars for choices, ellipses for repetition).
    Inform { name: String, description: String },
    /// Before sending a reply, the help request sends a number of `#help` informs. If no name
    /// parameter is given, one inform is sent per request available on the device; otherwise
    /// only the named request's inform is sent.
    Request { name: Option<String> },
    Reply(IntReply),
}

#[derive(KatcpMessage, Debug, PartialEq, Eq, Clone)]
/// Requesting a restart should trigger a software reset: close the connection, reload the
/// software, and begin execution again without changing the hardware configuration if possible.
pub enum Restart {
    Request,
    Reply(GenericReply),
}

#[derive(KatcpMessage, Debug, PartialEq, Eq, Clone)]
/// A watchdog request may be sent occasionally to check that the connection to the device is
/// still active. The device responds with a success reply if it receives it.
pub enum Watchdog {
    Request,
    Reply(GenericReply),
}

#[derive(KatcpMessage, Debug, PartialEq, Eq, Clone)]
/// Before sending a reply, `?version-list` sends a series of `#version-list` informs covering
/// all the roles and components returned via `#version-connect`, and possibly more.
pub enum VersionList {
    Inform {
        /// The name of the role or component the version information applies to.
        name: String,
        /// An opaque string identifying the version of the component.
        version: String,
        /// A unique identifier for a particular instance of a component.
        uuid: String,
    },
    Request,
    /// The Ok branch carries the number of informs sent.
    Reply(IntReply),
}

#[derive(KatcpMessage, Debug, PartialEq, Eq, Clone)]
/// Sent to the client shortly before it is disconnected. If the client is being disconnected in
/// favor of a new one, the message should include the new client's address.
pub enum Disconnect {
    Inform { message: String },
}

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
/// Flags from `#version-connect`'s `katcp-protocol` inform that indicate device features.
pub enum ProtocolFlags {
    /// The server supports multiple clients. Absence indicates only a single client is
    /// supported.
    MultiClient,
    /// The server supports message identifiers.
    MessageIds,
    /// The server provides request timeout hints.
    TimeoutHints,
    /// The server supports setting sensor sampling in bulk.
    BulkSampling,
}

impl Display for ProtocolFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", match self {
            ProtocolFlags::MultiClient => "M",
            ProtocolFlags::MessageIds => "I",
            ProtocolFlags::TimeoutHints => "T",
            ProtocolFlags::BulkSampling => "B",
        })
    }
}

impl TryFrom<char> for ProtocolFlags {
    type Error = KatcpError;

    fn try_from(value: char) -> Result<Self, Self::Error> {
        match value {
            'M' => Ok(Self::MultiClient),
            'I' => Ok(Self::MessageIds),
            'T' => Ok(Self::TimeoutHints),
            'B' => Ok(Self::BulkSampling),
            _ => Err(KatcpError::BadArgument(format!(
                "{value:?} is not a valid protocol flag"
            ))),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
/// The three different shapes of `#version-connect` inform.
pub enum VersionConnectInform {
    /// The version of katcp and the options it supports.
    KatcpProtocol {
        major: u32,
        minor: u32,
        flags: HashSet<ProtocolFlags>,
    },
    /// The specific katcp library the device is using.
    KatcpLibrary { version: String, build_state: String },
    /// API version and build state.
    KatcpDevice {
        api_version: String,
        device: KatcpAddress,
        build_state: String,
    },
    /// Fallback for other, custom roles/components.
    Custom {
        name: String,
        version: String,
        info: Option<String>,
    },
}

impl ToKatcpArguments for VersionConnectInform {
    fn to_arguments(&self) -> Vec<Vec<u8>> {
        match self {
            VersionConnectInform::KatcpProtocol {
                major,
                minor,
                flags,
            } => {
                let flags_str = flags
                    .iter()
                    .map(|f| f.to_string())
                    .reduce(|current, next| current + &next);
                let flag_str = flags_str.map_or(String::new(), |s| format!("-{s}"));
                vec![
                    b"katcp-protocol".to_vec(),
                    format!("{major}.{minor}{flag_str}").into_bytes(),
                ]
            }
            VersionConnectInform::KatcpLibrary {
                version,
                build_state,
            } => vec![
                b"katcp-library".to_vec(),
                version.to_argument(),
                build_state.to_argument(),
            ],
            VersionConnectInform::KatcpDevice {
                api_version,
                device,
                build_state,
            } => vec![
                b"katcp-device".to_vec(),
                api_version.to_argument(),
                device.to_argument(),
                build_state.to_argument(),
            ],
            VersionConnectInform::Custom {
                name,
                version,
                info,
            } => {
                let mut prelude = vec![name.to_argument(), version.to_argument()];
                if let Some(s) = info {
                    prelude.push(s.to_argument());
                }
                prelude
            }
        }
    }
}

impl FromKatcpArguments for VersionConnectInform {
    type Err = KatcpError;

    fn from_arguments(args: &mut dyn Iterator<Item = Vec<u8>>) -> Result<Self, Self::Err> {
        let inform_type = String::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?;
        match inform_type.as_str() {
            "katcp-protocol" => {
                let version_str =
                    String::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?;
                let (major, minor_and_flags) = version_str
                    .split_once('.')
                    .ok_or_else(|| KatcpError::BadArgument(version_str.clone()))?;
                let major = major
                    .parse()
                    .map_err(|_| KatcpError::BadArgument(version_str.clone()))?;
                let (minor, flags) = match minor_and_flags.split_once('-') {
                    Some((minor, flagset)) => {
                        let flags = flagset
                            .chars()
                            .map(ProtocolFlags::try_from)
                            .collect::<Result<HashSet<_>, _>>()?;
                        (
                            minor
                                .parse()
                                .map_err(|_| KatcpError::BadArgument(version_str.clone()))?,
                            flags,
                        )
                    }
                    None => (
                        minor_and_flags
                            .parse()
                            .map_err(|_| KatcpError::BadArgument(version_str.clone()))?,
                        HashSet::new(),
                    ),
                };
                Ok(Self::KatcpProtocol {
                    major,
                    minor,
                    flags,
                })
            }
            "katcp-library" => Ok(Self::KatcpLibrary {
                version: String::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?,
                build_state: String::from_argument(
                    &args.next().ok_or(KatcpError::MissingArgument)?,
                )?,
            }),
            "katcp-device" => Ok(Self::KatcpDevice {
                api_version: String::from_argument(
                    &args.next().ok_or(KatcpError::MissingArgument)?,
                )?,
                device: KatcpAddress::from_argument(
                    &args.next().ok_or(KatcpError::MissingArgument)?,
                )?,
                build_state: String::from_argument(
                    &args.next().ok_or(KatcpError::MissingArgument)?,
                )?,
            }),
            _ => Ok(Self::Custom {
                name: inform_type,
                version: String::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?,
                info: args.next().map(|a| String::from_argument(&a)).transpose()?,
            }),
        }
    }
}

#[derive(KatcpMessage, Debug, PartialEq, Eq, Clone)]
/// Sent to the client when it connects. Uses the same argument format as `#version-list`, and
/// every role/component declared here should also be included in `?version-list`'s informs.
pub enum VersionConnect {
    Inform(VersionConnectInform),
}

impl VersionConnect {
    /// Returns the `katcp-library` inform identifying this crate and the rustc that built it.
    pub fn library() -> Self {
        let version = env!("CARGO_PKG_VERSION");
        let target = rustc_version::version().unwrap();
        Self::Inform(VersionConnectInform::KatcpLibrary {
            version: format!("katcp-{version}"),
            build_state: format!("rustc-{target}"),
        })
    }
}

#[derive(KatcpDiscrete, Debug, PartialEq, Eq, Clone)]
/// On specific `#interface-changed` informs, how precisely the interface was changed.
pub enum ChangeSpecificationAction {
    Added,
    Removed,
    Modified,
}

#[derive(Debug, PartialEq, Eq, Clone)]
/// The sum type of the different `#interface-changed` informs.
pub enum InterfaceChangeInform {
    SensorList,
    RequestList,
    Sensor {
        name: String,
        action: ChangeSpecificationAction,
    },
    Request {
        name: String,
        action: ChangeSpecificationAction,
    },
}

impl ToKatcpArguments for InterfaceChangeInform {
    fn to_arguments(&self) -> Vec<Vec<u8>> {
        match self {
            Self::SensorList => vec![b"sensor-list".to_vec()],
            Self::RequestList => vec![b"request-list".to_vec()],
            Self::Sensor { name, action } => {
                vec![b"sensor".to_vec(), name.to_argument(), action.to_argument()]
            }
            Self::Request { name, action } => {
                vec![b"request".to_vec(), name.to_argument(), action.to_argument()]
            }
        }
    }
}

impl FromKatcpArguments for InterfaceChangeInform {
    type Err = KatcpError;

    fn from_arguments(args: &mut dyn Iterator<Item = Vec<u8>>) -> Result<Self, Self::Err> {
        let inform_type = String::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?;
        match inform_type.as_str() {
            "sensor-list" => Ok(Self::SensorList),
            "request-list" => Ok(Self::RequestList),
            "sensor" => Ok(Self::Sensor {
                name: String::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?,
                action: ChangeSpecificationAction::from_argument(
                    &args.next().ok_or(KatcpError::MissingArgument)?,
                )?,
            }),
            "request" => Ok(Self::Request {
                name: String::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?,
                action: ChangeSpecificationAction::from_argument(
                    &args.next().ok_or(KatcpError::MissingArgument)?,
                )?,
            }),
            other => Err(KatcpError::BadArgument(other.to_owned())),
        }
    }
}

#[derive(KatcpMessage, Debug, PartialEq, Eq, Clone)]
/// Only required for dynamic devices whose katcp interface may change during a connection.
/// Passing no arguments implies the whole interface may have changed.
pub enum InterfaceChanged {
    Inform(InterfaceChangeInform),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::common::roundtrip_test;

    #[test]
    fn test_halt() {
        roundtrip_test(Halt::Request);
        roundtrip_test(Halt::Reply(GenericReply::Ok));
        roundtrip_test(Halt::Reply(GenericReply::Error {
            ret_code: RetCode::Fail,
            message: "You Messed Up".to_owned(),
        }));
    }

    #[test]
    fn test_help() {
        roundtrip_test(Help::Request { name: None });
        roundtrip_test(Help::Request {
            name: Some("my_special_message".to_owned()),
        });
        roundtrip_test(Help::Reply(IntReply::Ok { num: 10 }));
        roundtrip_test(Help::Reply(IntReply::Error {
            ret_code: RetCode::Fail,
            message: "Something went wrong".to_owned(),
        }));
    }

    #[test]
    fn test_restart() {
        roundtrip_test(Restart::Request);
        roundtrip_test(Restart::Reply(GenericReply::Ok));
    }

    #[test]
    fn test_watchdog() {
        roundtrip_test(Watchdog::Request);
        roundtrip_test(Watchdog::Reply(GenericReply::Ok));
    }

    #[test]
    fn test_version_list() {
        roundtrip_test(VersionList::Request);
        roundtrip_test(VersionList::Inform {
            name: "my-special-device".to_owned(),
            version: "0.1.2.3rev10".to_owned(),
            uuid: "asdb132b34j".to_owned(),
        });
        roundtrip_test(VersionList::Reply(IntReply::Ok { num: 300 }));
        roundtrip_test(VersionList::Reply(IntReply::Error {
            ret_code: RetCode::Invalid,
            message: "Please fix me\nThis is bad".to_owned(),
        }))
    }

    #[test]
    fn test_disconnect() {
        roundtrip_test(Disconnect::Inform {
            message: "New client connected from 192.168.1.100:24500".to_owned(),
        });
    }

    #[test]
    fn test_version_connect() {
        roundtrip_test(VersionConnect::library());
        roundtrip_test(VersionConnect::Inform(
            VersionConnectInform::KatcpProtocol {
                major: 5,
                minor: 1,
                flags: HashSet::from([ProtocolFlags::MultiClient, ProtocolFlags::BulkSampling]),
            },
        ));
        roundtrip_test(VersionConnect::Inform(
            VersionConnectInform::KatcpProtocol {
                major: 5,
                minor: 0,
                flags: HashSet::new(),
            },
        ));
        roundtrip_test(VersionConnect::Inform(VersionConnectInform::Custom {
            name: "kernel".to_owned(),
            version: "4.4.9-v7+".to_owned(),
            info: Some("#884 SMP Fri May 6 17:28:59 BST 2016".to_owned()),
        }));
    }

    #[test]
    fn test_interface_changed() {
        roundtrip_test(InterfaceChanged::Inform(InterfaceChangeInform::SensorList));
        roundtrip_test(InterfaceChanged::Inform(InterfaceChangeInform::RequestList));
        roundtrip_test(InterfaceChanged::Inform(InterfaceChangeInform::Sensor {
            name: "name.of.fancy.sensor".to_owned(),
            action: ChangeSpecificationAction::Added,
        }));
        roundtrip_test(InterfaceChanged::Inform(InterfaceChangeInform::Request {
            name: "name.of.fancy.sensor".to_owned(),
            action: ChangeSpecificationAction::Removed,
        }));
    }
}
