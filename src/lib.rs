//! This crate provides a rust implementation of the [KATCP](https://katcp-python.readthedocs.io/en/latest/_downloads/361189acb383a294be20d6c10c257cb4/NRF-KAT7-6.0-IFCE-002-Rev5-1.pdf)
//! monitor and control protocol, as described by the Karoo Array Telescope (KAT) project from the Square Kilometer Array (SKA) South Africa group.
//!
//! ## Description
//!
//! From the official specification:
//! > Broadly speaking, KATCP consists of newline-separated text messages sent asynchronously over a TCP/IP
//! > stream. There are three categories of messages: requests, replies and informs. Request messages expect some
//! > sort of acknowledgement. Reply messages acknowledge requests. Inform messages require no acknowledgement.
//! > Inform messages are of two types: those sent synchronously as part of a reply and those sent asynchronously.
//!
//! This crate provides both the core [Message](protocol::Message) type and the required message
//! formats, and the client/server transports that turn those messages into a running protocol
//! engine: a [`Sensor`](sensor::Sensor) model with observers and [`AggregateSensor`](aggregate::AggregateSensor)s,
//! [`Sampler`](sampler::Sampler) strategies that turn sensor changes into `#sensor-status`
//! informs, a line-framing [connection](connection) engine, and [`Server`](server::Server) /
//! [`Client`](client::Client) endpoints built on top of it.
//!
//! ## Messages
//!
//! Usually, you will interact with specific message types, these are organized in the same way they are presented in the spec, but will be reiteraeted here:
//!
//!
//! |                         Core                         |                 Log                 |                       Sensors                       |                        Multi-Client                        |
//! |------------------------------------------------------|-------------------------------------|-----------------------------------------------------|------------------------------------------------------------|
//! |             [Halt](messages::core::Halt)             |      [Log](messages::log::Log)      |     [SensorList](messages::sensors::SensorList)     |      [ClientList](messages::multi_client::ClientList)      |
//! |             [Help](messages::core::Help)             | [LogLevel](messages::log::LogLevel) | [SensorSampling](messages::sensors::SensorSampling) | [ClientConnected](messages::multi_client::ClientConnected) |
//! |          [Restart](messages::core::Restart)          |                                     |    [SensorValue](messages::sensors::SensorValue)    |                                                            |
//! |         [Watchdog](messages::core::Watchdog)         |                                     |   [SensorStatus](messages::sensors::SensorStatus)   |                                                            |
//! |      [VersionList](messages::core::VersionList)      |                                     |                                                     |                                                            |
//! |       [Disconnect](messages::core::Disconnect)       |                                     |                                                     |                                                            |
//! |   [VersionConnect](messages::core::VersionConnect)   |                                     |                                                     |                                                            |
//! | [InterfaceChanged](messages::core::InterfaceChanged) |                                     |                                                     |                                                            |

pub mod aggregate;
pub mod client;
pub mod connection;
pub mod error;
pub mod messages;
pub mod prelude;
pub mod protocol;
pub mod sampler;
pub mod sensor;
pub mod server;
pub mod types;
mod utils;
