//! The core katcp message type [`Log`].
//!
//! # Examples
//! ```rust
//! use katcp::{messages::log::Log, protocol::Message};
//! let log: Log = r"#log warn 10000 device.sub-system Something\_may\_be\_wrong"
//!     .try_into()
//!     .unwrap();
//! ```
use katcp_derive::{KatcpDiscrete, KatcpMessage};

use crate::prelude::*;

#[derive(KatcpDiscrete, Debug, PartialEq, Eq, Copy, Clone)]
/// Katcp log level, these match the typical log level hierarchy of log4j, syslog, etc.
pub enum Level {
    /// The highest possible logging level, intended to turn logging off. Devices should never
    /// log messages directly to this level.
    Off,
    /// The device has failed with no possible workaround.
    Fatal,
    /// An operation did not complete successfully. A workaround may be possible; the device can
    /// continue, potentially with degraded functionality.
    Error,
    /// A condition was detected which may lead to functional degradation, but the device is
    /// still fully functional.
    Warn,
    /// Coarse-grained workflow information, useful for tracking process flow.
    Info,
    /// Verbose output for detailed analysis and debugging.
    Debug,
    /// Extremely verbose output, including call stacks.
    Trace,
    /// The lowest possible logging level, intended to turn on all logging. Devices should never
    /// log messages directly to this level.
    All,
}

#[derive(KatcpMessage, Debug, PartialEq, Eq, Clone)]
/// Messages for setting the device's log level.
pub enum LogLevel {
    Request { level: Level },
    Reply { ret_code: RetCode, level: Level },
}

#[derive(KatcpMessage, Debug, PartialEq, Eq, Clone)]
/// Log messages.
pub enum Log {
    Inform {
        level: Level,
        timestamp: KatcpTimestamp,
        name: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::common::roundtrip_test;

    #[test]
    fn test_log() {
        roundtrip_test(Log::Inform {
            level: Level::Error,
            timestamp: KatcpTimestamp(420.000000003),
            name: "foo.bar.baz".to_owned(),
            message: "This is a test message".to_owned(),
        });
        roundtrip_test(LogLevel::Reply {
            ret_code: RetCode::Ok,
            level: Level::Trace,
        });
        roundtrip_test(LogLevel::Request { level: Level::Info });
    }
}
