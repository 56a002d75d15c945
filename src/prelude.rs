//! Standard set of imports for katcp.
//!
//! `use katcp::prelude::*;` pulls in everything a message module needs to satisfy
//! `#[derive(KatcpMessage)]` / `#[derive(KatcpDiscrete)]` from `katcp_derive`.

pub use crate::{
    error::{KatcpError, KatcpResult},
    messages::{
        common::{
            FromKatcpArgument, FromKatcpArguments, KatcpArgument, KatcpMessage, RetCode,
            ToKatcpArgument, ToKatcpArguments,
        },
        core::IntReply,
    },
    protocol::{Message, MessageKind, MessageResult},
    types::{KatcpAddress, KatcpTimestamp},
};
