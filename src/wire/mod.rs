//! Byte-exact codecs for the AMT messages of RFC 7450 and the IPv4 / IGMPv3 structures that
//!  are tunneled inside them.
//!
//! All numbers are in network byte order (BE). Frame layouts:
//!
//! ```ascii
//! Discovery          (1)  type | reserved(3) | nonce(4)                                    8 bytes
//! Advertisement      (2)  type | reserved(3) | nonce(4) | relay IPv4(4)                   12 bytes
//! Request            (3)  type | reserved(3) | nonce(4) | 0                                9 bytes
//! Membership Query   (4)  type | flags(1) | MAC(6) | nonce(4) | IPv4+RA(24) | IGMPv3(12) 48 bytes
//! Membership Update  (5)  type | reserved(1) | MAC(6) | nonce(4) | IPv4+RA(24) | report    variable
//! Data               (6)  type | reserved(1) | IPv4(20) | UDP(8) | payload                 variable
//! ```
//!
//! Decoders validate the total length up front and read fields through `Buf::try_get_*`, so
//!  no offset is ever dereferenced without a prior bounds check.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

pub mod checksum;
pub mod relay_messages;
pub mod membership_update;
pub mod data_frame;

/// UDP port an AMT relay listens on
pub const AMT_PORT: u16 = 2268;

pub const MAC_LEN: usize = 6;
pub const NONCE_LEN: usize = 4;
/// type + reserved byte in front of the MAC for query, update and data
pub const AMT_HDR_LEN: usize = 2;
pub const IP_HDR_LEN: usize = 20;
/// IPv4 header including the 4 byte router alert option
pub const IP_HDR_RA_LEN: usize = 24;
pub const UDP_HDR_LEN: usize = 8;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum AmtMessageType {
    RelayDiscovery = 1,
    RelayAdvertisement = 2,
    Request = 3,
    MembershipQuery = 4,
    MembershipUpdate = 5,
    MulticastData = 6,
    /// recognised so it can be reported - teardown is never sent
    Teardown = 7,
}
impl AmtMessageType {
    /// Peeks at the leading discriminant of a received frame
    pub fn of(buf: &[u8]) -> Option<AmtMessageType> {
        buf.first()
            .and_then(|&b| AmtMessageType::try_from(b).ok())
    }
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum DecodeError {
    #[error("not a relay advertisement")]
    NotAdvertisement,
    #[error("not a membership query")]
    NotQuery,
    #[error("not a membership update")]
    NotUpdate,
    #[error("not a multicast data frame")]
    NotData,
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("checksum mismatch")]
    ChecksumInvalid,
}

/// Maps the underflow of a `try_get_*` call (which the up-front length checks should make
///  impossible) to the decode error reported for the frame
pub(crate) fn underflow<E>(expected: usize, actual: usize) -> impl FnOnce(E) -> DecodeError {
    move |_| DecodeError::TooShort { expected, actual }
}
