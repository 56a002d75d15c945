//! Messages for querying and configuring sensors.
//!
//! The wire-level shapes of sensor update messages ([`SensorValue`] and [`SensorStatus`]) carry
//! values whose Rust type depends on which sensor they describe, so this module stops at parsing
//! a [`SensorReading`]'s value as a raw string. Mapping a named sensor to its concrete value type,
//! and keeping the observer bookkeeping that [`crate::sensor::Sensor`] needs to turn one of these
//! readings into a typed update, lives outside this module.
use std::fmt::Display;

use katcp_derive::{KatcpDiscrete, KatcpMessage};

use crate::prelude::*;

/// The katcp sensor statuses.
#[derive(KatcpDiscrete, Debug, PartialEq, Eq, Clone, Copy)]
pub enum Status {
    /// The sensor is in the process of being initialized and no value has yet been
    /// seen. Sensors should not remain in this state indefinitely.
    Unknown,
    /// The sensor reading is within the expected range of nominal operating values.
    Nominal,
    /// The sensor reading is outside the nominal operating range.
    Warn,
    /// The sensor reading indicates a critical condition for the device.
    Error,
    /// Taking a sensor reading failed and seems unlikely to succeed in future
    /// without maintenance.
    Failure,
    /// The sensor could not be reached. This should only be used by a server that
    /// is proxying the sensor for another katcp device. A sensor that is read by
    /// the server from a source other than another katcp device should not be set
    /// to this status.
    Unreachable,
    /// The sensor is inactive; while the sensor does not provide a valid value, this
    /// status does not represent a failure condition. It could indicate that optional
    /// sensing hardware is not connected; in multi-mode devices it may indicate
    /// that a particular sensor is not applicable to the current mode of operation.
    Inactive,
}

impl Status {
    /// Returns if a given [`Status`] is valid according to the spec, i.e. represents an actual
    /// reading rather than an absence of one.
    pub fn is_valid(self) -> bool {
        matches!(self, Self::Nominal | Self::Warn | Self::Error)
    }
}

/// The wire type tag that precedes a [`SensorListInform`]'s extra parameters.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ArgumentType {
    Integer,
    Float,
    Boolean,
    Timestamp,
    Discrete,
    Address,
    String,
}

impl Display for ArgumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
            Self::Discrete => "discrete",
            Self::Address => "address",
            Self::String => "string",
        })
    }
}

impl ToKatcpArgument for ArgumentType {
    fn to_argument(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl FromKatcpArgument for ArgumentType {
    type Err = KatcpError;

    fn from_argument(s: &[u8]) -> Result<Self, Self::Err> {
        let s = std::str::from_utf8(s).map_err(|e| KatcpError::ValueDecodeError(e.to_string()))?;
        Ok(match s {
            "integer" => Self::Integer,
            "float" => Self::Float,
            "boolean" => Self::Boolean,
            "timestamp" => Self::Timestamp,
            "discrete" => Self::Discrete,
            "address" => Self::Address,
            "string" => Self::String,
            other => {
                return Err(KatcpError::BadArgument(format!(
                    "{other:?} is not a valid sensor type"
                )))
            }
        })
    }
}

/// The optional nominal/warn range (for integer and float sensors) or option list (for discrete
/// sensors) that follows a [`SensorListInform`]'s type tag. Boolean, timestamp, address, and
/// string sensors carry no extra parameters.
#[derive(Debug, PartialEq, Clone)]
pub enum ArgumentVec {
    /// `[nominal-min nominal-max [warn-min warn-max]]`, may be empty.
    Integer(Vec<i64>),
    /// `[nominal-min nominal-max [warn-min warn-max]]`, may be empty.
    Float(Vec<f64>),
    /// The list of available discrete options.
    Discrete(Vec<String>),
    /// No extra parameters; carries the type tag so it can be round-tripped.
    Empty(ArgumentType),
}

impl ArgumentVec {
    pub fn argument_type(&self) -> ArgumentType {
        match self {
            Self::Integer(_) => ArgumentType::Integer,
            Self::Float(_) => ArgumentType::Float,
            Self::Discrete(_) => ArgumentType::Discrete,
            Self::Empty(ty) => *ty,
        }
    }
}

impl ToKatcpArgument for ArgumentVec {
    fn to_argument(&self) -> Vec<u8> {
        self.argument_type().to_argument()
    }
}

impl ToKatcpArguments for ArgumentVec {
    fn to_arguments(&self) -> Vec<Vec<u8>> {
        match self {
            Self::Integer(v) => v.iter().map(|i| i.to_argument()).collect(),
            Self::Float(v) => v.iter().map(|f| f.to_argument()).collect(),
            Self::Discrete(v) => v.iter().map(|s| s.to_argument()).collect(),
            Self::Empty(_) => vec![],
        }
    }
}

/// Consumes the remainder of a message's arguments as the extra parameters belonging to `ty`.
pub fn from_argument_vec(
    ty: &ArgumentType,
    args: &mut dyn Iterator<Item = Vec<u8>>,
) -> Result<ArgumentVec, KatcpError> {
    Ok(match ty {
        ArgumentType::Integer => ArgumentVec::Integer(
            args.map(|a| i64::from_argument(&a))
                .collect::<Result<_, _>>()?,
        ),
        ArgumentType::Float => ArgumentVec::Float(
            args.map(|a| f64::from_argument(&a))
                .collect::<Result<_, _>>()?,
        ),
        ArgumentType::Discrete => ArgumentVec::Discrete(
            args.map(|a| String::from_argument(&a))
                .collect::<Result<_, _>>()?,
        ),
        other => ArgumentVec::Empty(*other),
    })
}

#[derive(Debug, PartialEq)]
/// The data of a [`SensorList`] inform message. You would use this information to decide how to
/// interpret the values reported for a given sensor by name.
pub struct SensorListInform {
    /// is the name of the sensor in dotted notation. This notation allows a virtual hierarchy of sensors to
    /// be represented; e.g. a name might be rfe0.temperature.
    pub name: String,
    /// is a human-readable description of the information provided by the sensor.
    pub description: String,
    /// is a human-readable string containing a short form of the units for the sensor value. May be blank
    /// if there are no suitable units. Examples: "kg", "packet count", "m/s". Should be suitable for display
    /// next to the value in a user interface.
    pub units: String,
    /// The params themselves. The meaning of the params depend on the sensor's type.
    ///
    /// # Notes
    /// Note that specifying the optional error and warning ranges for integer or float sensors does
    /// not relieve the device from setting the correct status on sensors itself; it is only meant to provide
    /// extra information to users of a device. The device exposing the sensor must ensure that the way it
    /// reports sensor status is consistent with the ranges reported by the [`SensorList`] inform. If it is not
    /// possible to do so, the ranges should be omitted.
    ///
    /// Any sensor value (assuming the sensor status is not unknown, failure, unreachable or inactive) x :
    /// nominal-min ≤ x ≤ nominal-max should be accompanied by a nominal sensor state. If only
    /// nominal-min and nominal-max are specified, values outside this range may be accompanied
    /// by warning or error states. If warn-min and warn-max are also specified, values of x such that
    /// warn-min ≤ x < nominal-min or nominal-max < x ≤ warn-max should be accompanied by a
    /// warning status, while values outside these ranges should be accompanied by an error status.
    pub params: ArgumentVec,
}

impl ToKatcpArguments for SensorListInform {
    fn to_arguments(&self) -> Vec<Vec<u8>> {
        let mut prelude = vec![
            self.name.to_argument(),
            self.description.to_argument(),
            self.units.to_argument(),
            self.params.to_argument(),
        ];
        prelude.append(&mut self.params.to_arguments());
        prelude
    }
}

impl FromKatcpArguments for SensorListInform {
    type Err = KatcpError;

    fn from_arguments(args: &mut dyn Iterator<Item = Vec<u8>>) -> Result<Self, Self::Err> {
        let name = String::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?;
        let description = String::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?;
        let units = String::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?;
        let ty = ArgumentType::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?;
        let params = from_argument_vec(&ty, args)?;
        Ok(Self {
            name,
            description,
            units,
            params,
        })
    }
}

#[derive(KatcpMessage, Debug, PartialEq)]
/// The messages to query the available sensors.
pub enum SensorList {
    /// Before sending a reply, the sensor-list request will send a number of sensor-list inform messages. If no
    /// name parameter is sent the sensor-list request will return a sensor-list inform message for each sensor
    /// available on the device. If a name parameter is specified, only an inform message for that sensor will
    /// be sent. On success the first reply parameter after the status code will contain the number of inform
    /// messages generated by this request. If the name parameter does not correspond to a sensor on the device,
    /// a fail reply should be sent.
    Request { name: Option<String> },
    Inform(SensorListInform),
    Reply(IntReply),
}

#[derive(Debug, PartialEq, Clone, Copy)]
/// The sampling strategy (and associated params) for [`SensorSampling`].
pub enum SamplingStrategy {
    /// Report the sensor value when convenient for the device. This should never be equivalent
    /// to the none strategy.
    Auto,
    /// Do not report the sensor value.
    None,
    /// Report the value approximately every `period` seconds.
    /// May be implemented for sensors of any type.
    Period { period: f32 },
    /// Report the value whenever it changes. May be implemented for sensors of any type. For
    /// float sensors the device will have to determine how much of a shift constitutes a real
    /// change.
    Event,
    /// Report the value when it changes by more than `difference` from the last reported value.
    /// May only be implemented for float and integer sensors.
    Differential { difference: f32 },
    /// Report the value whenever it changes or if more than `longest_period` seconds have passed
    /// since the last reported update. However, do not report the value until at least
    /// `shortest_period` seconds have passed since the last reported update. The behaviour if
    /// `shortest_period` is greater than `longest_period` is undefined.
    EventRate {
        shortest_period: f32,
        longest_period: f32,
    },
    /// Report the value whenever it changes by more than `difference` from the last reported
    /// value or if more than `longest_period` seconds have passed since the last reported update.
    /// However, do not report the value until at least `shortest_period` seconds have passed
    /// since the last reported update. May only be implemented for float and integer sensors.
    DifferentialRate {
        difference: f32,
        shortest_period: f32,
        longest_period: f32,
    },
}

impl ToKatcpArguments for SamplingStrategy {
    fn to_arguments(&self) -> Vec<Vec<u8>> {
        match self {
            SamplingStrategy::Auto => vec![b"auto".to_vec()],
            SamplingStrategy::None => vec![b"none".to_vec()],
            SamplingStrategy::Period { period } => {
                vec![b"period".to_vec(), period.to_argument()]
            }
            SamplingStrategy::Event => vec![b"event".to_vec()],
            SamplingStrategy::Differential { difference } => {
                vec![b"differential".to_vec(), difference.to_argument()]
            }
            SamplingStrategy::EventRate {
                shortest_period,
                longest_period,
            } => vec![
                b"event-rate".to_vec(),
                shortest_period.to_argument(),
                longest_period.to_argument(),
            ],
            SamplingStrategy::DifferentialRate {
                difference,
                shortest_period,
                longest_period,
            } => vec![
                b"differential-rate".to_vec(),
                difference.to_argument(),
                shortest_period.to_argument(),
                longest_period.to_argument(),
            ],
        }
    }
}

impl FromKatcpArguments for SamplingStrategy {
    type Err = KatcpError;

    fn from_arguments(args: &mut dyn Iterator<Item = Vec<u8>>) -> Result<Self, Self::Err> {
        let strat = String::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?;
        Ok(match strat.as_str() {
            "auto" => SamplingStrategy::Auto,
            "none" => SamplingStrategy::None,
            "period" => SamplingStrategy::Period {
                period: f32::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?,
            },
            "event" => SamplingStrategy::Event,
            "differential" => SamplingStrategy::Differential {
                difference: f32::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?,
            },
            "event-rate" => SamplingStrategy::EventRate {
                shortest_period: f32::from_argument(
                    &args.next().ok_or(KatcpError::MissingArgument)?,
                )?,
                longest_period: f32::from_argument(
                    &args.next().ok_or(KatcpError::MissingArgument)?,
                )?,
            },
            "differential-rate" => SamplingStrategy::DifferentialRate {
                difference: f32::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?,
                shortest_period: f32::from_argument(
                    &args.next().ok_or(KatcpError::MissingArgument)?,
                )?,
                longest_period: f32::from_argument(
                    &args.next().ok_or(KatcpError::MissingArgument)?,
                )?,
            },
            other => {
                return Err(KatcpError::BadArgument(format!(
                    "{other:?} is not a valid sampling strategy"
                )))
            }
        })
    }
}

#[derive(Debug, PartialEq)]
/// The type representing a sensor sampling request.
pub struct SamplingRequest {
    /// is the name of a single sensor. For bulk setting a comma-separated list of many sensor names can be used if the server supports the `B` flag.
    pub names: String,
    /// Specifies a sampling strategy and is one of the strategies described in [`SamplingStrategy`].
    /// If no strategy is specified, the current strategy and parameters are left unchanged and
    /// just reported in the reply. This querying of a strategy is only applicable when
    /// specifying a single sensor name, not a list of names.
    pub strategy: Option<SamplingStrategy>,
}

impl ToKatcpArguments for SamplingRequest {
    fn to_arguments(&self) -> Vec<Vec<u8>> {
        let mut prelude = vec![self.names.to_argument()];
        if let Some(strat) = &self.strategy {
            prelude.append(&mut strat.to_arguments());
        }
        prelude
    }
}

impl FromKatcpArguments for SamplingRequest {
    type Err = KatcpError;

    fn from_arguments(args: &mut dyn Iterator<Item = Vec<u8>>) -> Result<Self, Self::Err> {
        let names = String::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?;
        // If there's nothing left, there's no strategy to report; any other error is real.
        match SamplingStrategy::from_arguments(args) {
            Ok(strategy) => Ok(Self {
                names,
                strategy: Some(strategy),
            }),
            Err(KatcpError::MissingArgument) => Ok(Self {
                names,
                strategy: None,
            }),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, PartialEq)]
/// The reply type for [`SensorSampling`].
pub struct SamplingReply {
    pub names: String,
    pub strategy: SamplingStrategy,
}

impl ToKatcpArguments for SamplingReply {
    fn to_arguments(&self) -> Vec<Vec<u8>> {
        let mut prelude = vec![self.names.to_argument()];
        prelude.append(&mut self.strategy.to_arguments());
        prelude
    }
}

impl FromKatcpArguments for SamplingReply {
    type Err = KatcpError;

    fn from_arguments(args: &mut dyn Iterator<Item = Vec<u8>>) -> Result<Self, Self::Err> {
        let names = String::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?;
        let strategy = SamplingStrategy::from_arguments(args)?;
        Ok(Self { names, strategy })
    }
}

#[derive(KatcpMessage, Debug, PartialEq)]
/// The messages that control how sensors are sampled.
pub enum SensorSampling {
    Request(SamplingRequest),
    Reply(SamplingReply),
}

#[derive(Debug, PartialEq, Eq)]
/// A complete sensor reading, returned by [`SensorValue`] and [`SensorStatus`].
pub struct SensorReading {
    pub name: String,
    pub status: Status,
    /// A bare sensor reading is kept as raw bytes since its type is determined by `name`, which
    /// this module has no way to resolve.
    pub value: Vec<u8>,
}

impl FromKatcpArguments for SensorReading {
    type Err = KatcpError;

    fn from_arguments(args: &mut dyn Iterator<Item = Vec<u8>>) -> Result<Self, Self::Err> {
        let name = String::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?;
        let status = Status::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?;
        let value = Vec::<u8>::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?;
        Ok(Self {
            name,
            status,
            value,
        })
    }
}

impl ToKatcpArguments for SensorReading {
    fn to_arguments(&self) -> Vec<Vec<u8>> {
        vec![
            self.name.to_argument(),
            self.status.to_argument(),
            self.value.to_argument(),
        ]
    }
}

#[derive(Debug, PartialEq, Eq)]
/// A timestamped collection of [`SensorReading`]s.
pub struct SensorUpdates {
    pub timestamp: KatcpTimestamp,
    pub readings: Vec<SensorReading>,
}

impl FromKatcpArguments for SensorUpdates {
    type Err = KatcpError;

    fn from_arguments(args: &mut dyn Iterator<Item = Vec<u8>>) -> Result<Self, Self::Err> {
        let timestamp =
            KatcpTimestamp::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?;
        let num_sensors = u32::from_argument(&args.next().ok_or(KatcpError::MissingArgument)?)?;
        let mut readings = vec![];
        for _ in 0..num_sensors {
            readings.push(SensorReading::from_arguments(args)?);
        }
        Ok(Self {
            timestamp,
            readings,
        })
    }
}

impl ToKatcpArguments for SensorUpdates {
    fn to_arguments(&self) -> Vec<Vec<u8>> {
        let mut prelude = vec![
            self.timestamp.to_argument(),
            (self.readings.len() as u32).to_argument(),
        ];
        prelude.extend(self.readings.iter().flat_map(|r| r.to_arguments()));
        prelude
    }
}

#[derive(KatcpMessage, Debug, PartialEq, Eq)]
/// The messages involving directly querying a sensor's value.
pub enum SensorValue {
    /// Before sending a reply, the sensor-value request will send a number of sensor-value inform messages. If
    /// no name parameter is sent the sensor-value request will return a sensor value for each sensor available on
    /// the device using a set of sensor-value inform messages. If a name parameter is specified, only an inform
    /// message for that sensor will be sent. On success the first reply parameter after the status code will contain
    /// the number of inform messages generated by this request. If the name parameter does not correspond to
    /// a sensor on the device, a fail reply should be sent.
    Request { name: Option<String> },
    Reply(IntReply),
    /// The sensor-value inform message has the same structure as the asynchronous sensor-status
    /// inform except for the message name. The message name is used to determine whether the
    /// sensor value is being reported in response to a sensor-value request or as a result of
    /// sensor sampling.
    Inform(SensorUpdates),
}

#[derive(KatcpMessage, Debug, PartialEq, Eq)]
/// The async sensor status update message.
pub enum SensorStatus {
    /// A sensor-status inform should be sent whenever the sensor sampling set up by the client
    /// dictates. The sensor-status inform message has the same structure as the [`SensorValue`]
    /// inform except for the message name. The message name is used to determine whether the
    /// sensor value is being reported in response to a sensor-value request or as a result of
    /// sensor sampling.
    Inform(SensorUpdates),
}

#[cfg(test)]
mod sensor_tests {
    use super::*;
    use crate::messages::common::roundtrip_test;

    #[test]
    fn status_validity() {
        assert!(!Status::Unknown.is_valid());
        assert!(Status::Nominal.is_valid());
        assert!(Status::Warn.is_valid());
        assert!(Status::Error.is_valid());
        assert!(!Status::Failure.is_valid());
        assert!(!Status::Unreachable.is_valid());
        assert!(!Status::Inactive.is_valid());
    }

    #[test]
    fn test_sensor_list() {
        roundtrip_test(SensorList::Request { name: None });
        roundtrip_test(SensorList::Request {
            name: Some("rfe0.temperature".to_owned()),
        });
        roundtrip_test(SensorList::Reply(IntReply::Ok { num: 420 }));
        roundtrip_test(SensorList::Inform(SensorListInform {
            name: "rfe0.temperature".to_owned(),
            description: "The temperature of rfe0".to_owned(),
            units: "Kelvin".to_owned(),
            params: ArgumentVec::Float(vec![123.234, 0.2, 12., -122e05]),
        }));
        roundtrip_test(SensorList::Inform(SensorListInform {
            name: "drive.enable-azim".to_owned(),
            description: "Azimuth drive enable signal status".to_owned(),
            units: "".to_owned(),
            params: ArgumentVec::Empty(ArgumentType::Boolean),
        }));
    }

    #[test]
    fn test_sensor_sampling() {
        roundtrip_test(SensorSampling::Request(SamplingRequest {
            names: "wind-speed".to_owned(),
            strategy: Some(SamplingStrategy::Auto),
        }));
        roundtrip_test(SensorSampling::Request(SamplingRequest {
            names: "wind-speed".to_owned(),
            strategy: Some(SamplingStrategy::None),
        }));
        roundtrip_test(SensorSampling::Request(SamplingRequest {
            names: "wind-speed".to_owned(),
            strategy: None,
        }));
        roundtrip_test(SensorSampling::Request(SamplingRequest {
            names: "wind-speed".to_owned(),
            strategy: Some(SamplingStrategy::Period { period: 1.0 }),
        }));
        roundtrip_test(SensorSampling::Request(SamplingRequest {
            names: "wind-speed".to_owned(),
            strategy: Some(SamplingStrategy::DifferentialRate {
                difference: 10.5,
                shortest_period: 3.1,
                longest_period: 15.0,
            }),
        }));
        roundtrip_test(SensorSampling::Reply(SamplingReply {
            names: "wind-speed".to_owned(),
            strategy: SamplingStrategy::EventRate {
                shortest_period: 3.15,
                longest_period: 2.71,
            },
        }));
        roundtrip_test(SensorSampling::Reply(SamplingReply {
            names: "wind-speed".to_owned(),
            strategy: SamplingStrategy::Differential { difference: 420.69 },
        }));
    }

    #[test]
    fn test_sensor_value() {
        roundtrip_test(SensorValue::Request { name: None });
        roundtrip_test(SensorValue::Request {
            name: Some("antennas.1.pitch".to_owned()),
        });
        roundtrip_test(SensorValue::Reply(IntReply::Ok { num: 10 }));
        roundtrip_test(SensorValue::Reply(IntReply::Error {
            ret_code: RetCode::Invalid,
            message: "Uh oh".to_owned(),
        }));
        roundtrip_test(SensorValue::Inform(SensorUpdates {
            timestamp: KatcpTimestamp(1654553033.0),
            readings: vec![
                SensorReading {
                    name: "big-fat-motor.current".to_owned(),
                    status: Status::Nominal,
                    value: b"0.813".to_vec(),
                },
                SensorReading {
                    name: "big-fat-motor.voltage".to_owned(),
                    status: Status::Nominal,
                    value: b"24.1".to_vec(),
                },
            ],
        }));
    }

    #[test]
    fn test_sensor_status() {
        roundtrip_test(SensorStatus::Inform(SensorUpdates {
            timestamp: KatcpTimestamp(1654553033.0),
            readings: vec![
                SensorReading {
                    name: "big-fat-motor.current".to_owned(),
                    status: Status::Nominal,
                    value: b"0.813".to_vec(),
                },
                SensorReading {
                    name: "big-fat-motor.voltage".to_owned(),
                    status: Status::Nominal,
                    value: b"24.1".to_vec(),
                },
            ],
        }));
    }
}
