use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util::safe_converter::PrecheckedCast;
use crate::wire::checksum::{checksum16, patch_checksum};
use crate::wire::{underflow, AmtMessageType, DecodeError, AMT_HDR_LEN, IP_HDR_RA_LEN, MAC_LEN, NONCE_LEN};

pub const IGMPV3_MEMBERSHIP_REPORT: u8 = 0x22;

/// IGMPv3 reports are sent to the 'all IGMPv3-capable routers' group
pub const MCAST_ALL_IGMPV3_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 22);

/// RFC 2113 router alert: copied flag + option 20, length 4, value 0
const ROUTER_ALERT_OPTION: u32 = 0x9404_0000;

const UPDATE_HDR_LEN: usize = AMT_HDR_LEN + MAC_LEN + NONCE_LEN;
const REPORT_HDR_LEN: usize = 8;
const GROUP_RECORD_HDR_LEN: usize = 8;

/// IGMPv3 group record types (RFC 3376 section 4.2.12)
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum GroupRecordType {
    ModeIsInclude = 1,
    ModeIsExclude = 2,
    ChangeToInclude = 3,
    ChangeToExclude = 4,
    AllowNewSources = 5,
    BlockOldSources = 6,
}
impl GroupRecordType {
    /// The record that joins or leaves a group: SSM pins the source with INCLUDE / BLOCK,
    ///  ASM switches the filter mode with an empty source list
    pub fn for_membership(is_ssm: bool, leave: bool) -> GroupRecordType {
        match (is_ssm, leave) {
            (true, false) => GroupRecordType::ModeIsInclude,
            (true, true) => GroupRecordType::BlockOldSources,
            (false, false) => GroupRecordType::ChangeToExclude,
            (false, true) => GroupRecordType::ChangeToInclude,
        }
    }

    pub fn is_leave(&self) -> bool {
        matches!(self, GroupRecordType::BlockOldSources | GroupRecordType::ChangeToInclude)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GroupRecord {
    pub record_type: GroupRecordType,
    pub group: Ipv4Addr,
    pub sources: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MembershipUpdate {
    pub response_mac: [u8; MAC_LEN],
    pub nonce: u32,
    pub record: GroupRecord,
}

/// Synthetic IPv4 header with router alert option as used for encapsulated IGMP, with a
///  zero checksum that the caller patches once the header is complete
pub(crate) fn put_router_alert_ip_header(buf: &mut impl BufMut, payload_len: usize, destination: Ipv4Addr) {
    buf.put_u8(0x46);                                      // version 4, IHL 6
    buf.put_u8(0xc0);                                      // TOS: internetwork control
    buf.put_u16((IP_HDR_RA_LEN + payload_len).prechecked_cast());
    buf.put_u16(0);                                        // id
    buf.put_u16(0);                                        // flags / fragment offset
    buf.put_u8(1);                                         // TTL
    buf.put_u8(crate::wire::relay_messages::IGMP_PROTOCOL);
    buf.put_u16(0);                                        // checksum
    buf.put_u32(Ipv4Addr::UNSPECIFIED.to_bits());
    buf.put_u32(destination.to_bits());
    buf.put_u32(ROUTER_ALERT_OPTION);
}

/// Builds a membership update carrying an IGMPv3 report with a single group record.
///
/// `source == 0.0.0.0` means any-source multicast; otherwise the record pins `source`.
pub fn encode_membership_update(response_mac: [u8; MAC_LEN], nonce: u32, group: Ipv4Addr, source: Ipv4Addr, leave: bool) -> Bytes {
    let is_ssm = !source.is_unspecified();
    let record_type = GroupRecordType::for_membership(is_ssm, leave);
    let num_sources: u16 = if is_ssm { 1 } else { 0 };

    let mut report = BytesMut::with_capacity(REPORT_HDR_LEN + GROUP_RECORD_HDR_LEN + 4);
    report.put_u8(IGMPV3_MEMBERSHIP_REPORT);
    report.put_u8(0);
    report.put_u16(0);                                     // checksum
    report.put_u16(0);
    report.put_u16(1);                                     // number of group records
    report.put_u8(record_type.into());
    report.put_u8(0);                                      // aux data len
    report.put_u16(num_sources);
    report.put_u32(group.to_bits());
    // ASM keeps the source slot, zeroed, so the report has the same size either way
    report.put_u32(source.to_bits());
    patch_checksum(&mut report, 2);

    let mut ip = BytesMut::with_capacity(IP_HDR_RA_LEN);
    put_router_alert_ip_header(&mut ip, report.len(), MCAST_ALL_IGMPV3_ROUTERS);
    patch_checksum(&mut ip, 10);

    let mut buf = BytesMut::with_capacity(UPDATE_HDR_LEN + ip.len() + report.len());
    buf.put_u8(AmtMessageType::MembershipUpdate.into());
    buf.put_u8(0);
    buf.put_slice(&response_mac);
    buf.put_u32(nonce);
    buf.put_slice(&ip);
    buf.put_slice(&report);
    buf.freeze()
}

/// Relay side: parses a membership update, returning the first group record of its report
pub fn decode_membership_update(buf: &[u8]) -> Result<MembershipUpdate, DecodeError> {
    if AmtMessageType::of(buf) != Some(AmtMessageType::MembershipUpdate) {
        return Err(DecodeError::NotUpdate);
    }
    let min_len = UPDATE_HDR_LEN + IP_HDR_RA_LEN + REPORT_HDR_LEN + GROUP_RECORD_HDR_LEN;
    if buf.len() < min_len {
        return Err(DecodeError::TooShort { expected: min_len, actual: buf.len() });
    }

    let on_underflow = || underflow(min_len, buf.len());
    let mut parse_buf = &buf[AMT_HDR_LEN..];

    let mut response_mac = [0u8; MAC_LEN];
    parse_buf.try_copy_to_slice(&mut response_mac).map_err(on_underflow())?;
    let nonce = parse_buf.try_get_u32().map_err(on_underflow())?;

    let ip_start = UPDATE_HDR_LEN;
    let report_start = ip_start + IP_HDR_RA_LEN;
    if parse_buf.try_get_u8().map_err(on_underflow())? != 0x46 {
        return Err(DecodeError::Malformed("encapsulated report must be IPv4 with router alert"));
    }
    parse_buf.advance(IP_HDR_RA_LEN - 1);

    if parse_buf.try_get_u8().map_err(on_underflow())? != IGMPV3_MEMBERSHIP_REPORT {
        return Err(DecodeError::Malformed("encapsulated message is not an IGMPv3 report"));
    }
    parse_buf.advance(5);
    if parse_buf.try_get_u16().map_err(on_underflow())? == 0 {
        return Err(DecodeError::Malformed("report without group records"));
    }

    let record_type = GroupRecordType::try_from(parse_buf.try_get_u8().map_err(on_underflow())?)
        .map_err(|_| DecodeError::Malformed("unknown group record type"))?;
    let _aux_data_len = parse_buf.try_get_u8().map_err(on_underflow())?;
    let num_sources = parse_buf.try_get_u16().map_err(on_underflow())? as usize;
    let group = Ipv4Addr::from(parse_buf.try_get_u32().map_err(on_underflow())?);

    let report_end = min_len + 4 * num_sources;
    if buf.len() < report_end {
        return Err(DecodeError::TooShort { expected: report_end, actual: buf.len() });
    }
    let mut sources = Vec::with_capacity(num_sources);
    for _ in 0..num_sources {
        sources.push(Ipv4Addr::from(parse_buf.try_get_u32().map_err(underflow(report_end, buf.len()))?));
    }

    // the report checksum covers the whole IGMP message, i.e. everything after the IP header
    if checksum16(&buf[ip_start..report_start]) != 0 || checksum16(&buf[report_start..]) != 0 {
        return Err(DecodeError::ChecksumInvalid);
    }

    Ok(MembershipUpdate {
        response_mac,
        nonce,
        record: GroupRecord {
            record_type,
            group,
            sources,
        },
    })
}
