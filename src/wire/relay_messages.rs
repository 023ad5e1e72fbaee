use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::wire::checksum::{checksum16, patch_checksum};
use crate::wire::{underflow, AmtMessageType, DecodeError, AMT_HDR_LEN, IP_HDR_RA_LEN, MAC_LEN, NONCE_LEN};

pub const DISCOVERY_LEN: usize = 8;
pub const ADVERTISEMENT_LEN: usize = 12;
pub const REQUEST_LEN: usize = 9;
pub const MEMBERSHIP_QUERY_LEN: usize = AMT_HDR_LEN + MAC_LEN + NONCE_LEN + IP_HDR_RA_LEN + IGMP_QUERY_LEN;

/// IGMPv3 general query without sources
const IGMP_QUERY_LEN: usize = 12;
const IGMP_QUERY_OFFSET: usize = AMT_HDR_LEN + MAC_LEN + NONCE_LEN + IP_HDR_RA_LEN;
const IP_OFFSET: usize = AMT_HDR_LEN + MAC_LEN + NONCE_LEN;

pub const IGMPV3_MEMBERSHIP_QUERY: u8 = 0x11;
pub const IGMP_PROTOCOL: u8 = 2;

/// The querier's query interval that applies when a relay sends QQIC 0 (RFC 3376 default)
pub const DEFAULT_QQIC: u8 = 125;

pub fn encode_discovery(nonce: u32) -> [u8; DISCOVERY_LEN] {
    let mut buf = [0u8; DISCOVERY_LEN];
    buf[0] = AmtMessageType::RelayDiscovery.into();
    buf[4..8].copy_from_slice(&nonce.to_be_bytes());
    buf
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Advertisement {
    pub nonce: u32,
    pub relay: Ipv4Addr,
}

pub fn encode_advertisement(nonce: u32, relay: Ipv4Addr) -> [u8; ADVERTISEMENT_LEN] {
    let mut buf = [0u8; ADVERTISEMENT_LEN];
    buf[0] = AmtMessageType::RelayAdvertisement.into();
    buf[4..8].copy_from_slice(&nonce.to_be_bytes());
    buf[8..12].copy_from_slice(&relay.octets());
    buf
}

pub fn decode_advertisement(buf: &[u8]) -> Result<Advertisement, DecodeError> {
    if AmtMessageType::of(buf) != Some(AmtMessageType::RelayAdvertisement) {
        return Err(DecodeError::NotAdvertisement);
    }
    if buf.len() < ADVERTISEMENT_LEN {
        return Err(DecodeError::TooShort { expected: ADVERTISEMENT_LEN, actual: buf.len() });
    }

    let on_underflow = || underflow(ADVERTISEMENT_LEN, buf.len());
    let mut parse_buf = &buf[4..];
    let nonce = parse_buf.try_get_u32().map_err(on_underflow())?;
    let relay = parse_buf.try_get_u32().map_err(on_underflow())?;

    Ok(Advertisement {
        nonce,
        relay: Ipv4Addr::from(relay),
    })
}

/// NB: The P flag (second byte) stays cleared, requesting an IGMPv3 rather than an MLDv2 query
pub fn encode_request(nonce: u32) -> [u8; REQUEST_LEN] {
    let mut buf = [0u8; REQUEST_LEN];
    buf[0] = AmtMessageType::Request.into();
    buf[4..8].copy_from_slice(&nonce.to_be_bytes());
    buf
}

/// What the gateway learns from a relay's membership query, and needs for all subsequent
///  membership updates
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RelayParameters {
    pub response_mac: [u8; MAC_LEN],
    pub request_nonce: u32,
    pub max_resp_code: u8,
    pub ssm_group: Ipv4Addr,
    pub s_qrv: u8,
    /// already normalized: never 0
    pub qqic: u8,
    pub num_sources: u16,
}
impl RelayParameters {
    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(normalize_qqic(self.qqic) as u64)
    }
}

pub fn normalize_qqic(raw: u8) -> u8 {
    if raw == 0 {
        DEFAULT_QQIC
    }
    else {
        raw
    }
}

pub fn decode_membership_query(buf: &[u8]) -> Result<RelayParameters, DecodeError> {
    if AmtMessageType::of(buf) != Some(AmtMessageType::MembershipQuery) {
        return Err(DecodeError::NotQuery);
    }
    if buf.len() < MEMBERSHIP_QUERY_LEN {
        return Err(DecodeError::TooShort { expected: MEMBERSHIP_QUERY_LEN, actual: buf.len() });
    }

    let on_underflow = || underflow(MEMBERSHIP_QUERY_LEN, buf.len());
    let mut parse_buf = &buf[AMT_HDR_LEN..];

    let mut response_mac = [0u8; MAC_LEN];
    parse_buf.try_copy_to_slice(&mut response_mac).map_err(on_underflow())?;
    let request_nonce = parse_buf.try_get_u32().map_err(on_underflow())?;

    let ver_ihl = parse_buf.try_get_u8().map_err(on_underflow())?;
    if ver_ihl != 0x46 {
        return Err(DecodeError::Malformed("encapsulated query must be IPv4 with router alert"));
    }
    parse_buf.advance(IP_HDR_RA_LEN - 1);

    let igmp_type = parse_buf.try_get_u8().map_err(on_underflow())?;
    if igmp_type != IGMPV3_MEMBERSHIP_QUERY {
        return Err(DecodeError::Malformed("encapsulated message is not an IGMPv3 query"));
    }
    let max_resp_code = parse_buf.try_get_u8().map_err(on_underflow())?;
    let _checksum = parse_buf.try_get_u16().map_err(on_underflow())?;
    let ssm_group = Ipv4Addr::from(parse_buf.try_get_u32().map_err(on_underflow())?);
    let s_qrv = parse_buf.try_get_u8().map_err(on_underflow())?;
    let qqic = normalize_qqic(parse_buf.try_get_u8().map_err(on_underflow())?);
    let num_sources = parse_buf.try_get_u16().map_err(on_underflow())?;

    let query_end = MEMBERSHIP_QUERY_LEN + 4 * num_sources as usize;
    if buf.len() < query_end {
        return Err(DecodeError::TooShort { expected: query_end, actual: buf.len() });
    }
    if checksum16(&buf[IP_OFFSET..IGMP_QUERY_OFFSET]) != 0 || checksum16(&buf[IGMP_QUERY_OFFSET..query_end]) != 0 {
        return Err(DecodeError::ChecksumInvalid);
    }

    Ok(RelayParameters {
        response_mac,
        request_nonce,
        max_resp_code,
        ssm_group,
        s_qrv,
        qqic,
        num_sources,
    })
}

/// Relay side of the membership query, carrying a general query without sources. The
///  encapsulated IPv4 header is addressed from the relay's unspecified address to all-hosts.
pub fn encode_membership_query(mac: [u8; MAC_LEN], nonce: u32, max_resp_code: u8, ssm_group: Ipv4Addr, s_qrv: u8, raw_qqic: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(MEMBERSHIP_QUERY_LEN);
    buf.put_u8(AmtMessageType::MembershipQuery.into());
    buf.put_u8(0);
    buf.put_slice(&mac);
    buf.put_u32(nonce);

    let mut ip = BytesMut::with_capacity(IP_HDR_RA_LEN);
    crate::wire::membership_update::put_router_alert_ip_header(&mut ip, IGMP_QUERY_LEN, Ipv4Addr::new(224, 0, 0, 1));
    patch_checksum(&mut ip, 10);
    buf.put_slice(&ip);

    let mut igmp = BytesMut::with_capacity(IGMP_QUERY_LEN);
    igmp.put_u8(IGMPV3_MEMBERSHIP_QUERY);
    igmp.put_u8(max_resp_code);
    igmp.put_u16(0); // checksum
    igmp.put_u32(ssm_group.to_bits());
    igmp.put_u8(s_qrv);
    igmp.put_u8(raw_qqic);
    igmp.put_u16(0);
    patch_checksum(&mut igmp, 2);
    buf.put_slice(&igmp);

    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_encode_discovery() {
        assert_eq!(encode_discovery(0x1234_5678), [1, 0, 0, 0, 0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn test_encode_request() {
        assert_eq!(encode_request(0xdead_beef), [3, 0, 0, 0, 0xde, 0xad, 0xbe, 0xef, 0]);
    }

    #[rstest]
    #[case::exact(vec![2, 0, 0, 0, 0, 0, 0, 9, 10, 1, 2, 3], Ok(Advertisement { nonce: 9, relay: Ipv4Addr::new(10, 1, 2, 3) }))]
    #[case::trailing_bytes(vec![2, 0, 0, 0, 0xab, 0xcd, 0xef, 0x01, 127, 0, 0, 1, 99, 99], Ok(Advertisement { nonce: 0xabcd_ef01, relay: Ipv4Addr::LOCALHOST }))]
    #[case::eleven_bytes(vec![2, 0, 0, 0, 0, 0, 0, 9, 10, 1, 2], Err(DecodeError::TooShort { expected: 12, actual: 11 }))]
    #[case::type_only(vec![2], Err(DecodeError::TooShort { expected: 12, actual: 1 }))]
    #[case::empty(vec![], Err(DecodeError::NotAdvertisement))]
    #[case::discovery(vec![1, 0, 0, 0, 0, 0, 0, 9, 10, 1, 2, 3], Err(DecodeError::NotAdvertisement))]
    #[case::query(vec![4, 0, 0, 0, 0, 0, 0, 9, 10, 1, 2, 3], Err(DecodeError::NotAdvertisement))]
    fn test_decode_advertisement(#[case] buf: Vec<u8>, #[case] expected: Result<Advertisement, DecodeError>) {
        assert_eq!(decode_advertisement(&buf), expected);
    }

    #[test]
    fn test_advertisement_layout() {
        assert_eq!(encode_advertisement(7, Ipv4Addr::new(192, 0, 2, 1)), [2, 0, 0, 0, 0, 0, 0, 7, 192, 0, 2, 1]);
    }

    fn query(raw_qqic: u8) -> Bytes {
        encode_membership_query([1, 2, 3, 4, 5, 6], 0x0102_0304, 100, Ipv4Addr::UNSPECIFIED, 0x02, raw_qqic)
    }

    #[test]
    fn test_membership_query_layout() {
        let buf = query(60);
        assert_eq!(buf.len(), 48);
        assert_eq!(&buf[..12], &[4, 0, 1, 2, 3, 4, 5, 6, 1, 2, 3, 4]);
        assert_eq!(buf[12], 0x46);
        assert_eq!(buf[21], IGMP_PROTOCOL);
        assert_eq!(&buf[32..36], &[0x94, 0x04, 0, 0]);
        assert_eq!(buf[36], 0x11);
        assert_eq!(buf[37], 100);
        assert_eq!(buf[44], 0x02);
        assert_eq!(buf[45], 60);
        assert_eq!(&buf[46..48], &[0, 0]);
    }

    #[rstest]
    #[case::explicit(60, 60)]
    #[case::one(1, 1)]
    #[case::max(255, 255)]
    #[case::zero_means_default(0, 125)]
    fn test_decode_membership_query_qqic(#[case] raw_qqic: u8, #[case] expected_qqic: u8) {
        let params = decode_membership_query(&query(raw_qqic)).unwrap();
        assert_eq!(params, RelayParameters {
            response_mac: [1, 2, 3, 4, 5, 6],
            request_nonce: 0x0102_0304,
            max_resp_code: 100,
            ssm_group: Ipv4Addr::UNSPECIFIED,
            s_qrv: 0x02,
            qqic: expected_qqic,
            num_sources: 0,
        });
        assert_eq!(params.renewal_interval(), Duration::from_secs(expected_qqic as u64));
    }

    #[test]
    fn test_normalized_interval_is_never_zero() {
        for raw in 0..=u8::MAX {
            assert!(normalize_qqic(raw) > 0);
        }
    }

    #[test]
    fn test_decode_membership_query_rejects_every_short_length() {
        let buf = query(10);
        for len in 1..MEMBERSHIP_QUERY_LEN {
            assert_eq!(decode_membership_query(&buf[..len]), Err(DecodeError::TooShort { expected: 48, actual: len }));
        }
    }

    #[rstest]
    #[case::wrong_type(0, 5, DecodeError::NotQuery)]
    #[case::ipv6_header(12, 0x60, DecodeError::Malformed("encapsulated query must be IPv4 with router alert"))]
    #[case::not_a_query(36, 0x22, DecodeError::Malformed("encapsulated message is not an IGMPv3 query"))]
    #[case::igmp_checksum(45, 61, DecodeError::ChecksumInvalid)]
    #[case::ip_checksum(20, 2, DecodeError::ChecksumInvalid)]
    #[case::sources_missing(47, 2, DecodeError::TooShort { expected: 56, actual: 48 })]
    fn test_decode_membership_query_invalid(#[case] offset: usize, #[case] value: u8, #[case] expected: DecodeError) {
        let mut buf = query(60).to_vec();
        buf[offset] = value;
        assert_eq!(decode_membership_query(&buf), Err(expected));
    }
}
