use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::util::safe_converter::PrecheckedCast;
use crate::wire::checksum::patch_checksum;
use crate::wire::{AmtMessageType, DecodeError, AMT_HDR_LEN, IP_HDR_LEN, UDP_HDR_LEN};

/// Everything in front of the multicast UDP payload in a data frame
pub const TUNNEL_HEADER_LEN: usize = AMT_HDR_LEN + IP_HDR_LEN + UDP_HDR_LEN;

const UDP_PROTOCOL: u8 = 17;

#[derive(Debug, Eq, PartialEq)]
pub struct DataFrame<'a> {
    pub payload: &'a [u8],
    /// The frame ended before the tunnel header was complete, or before the length announced
    ///  in the encapsulated IP header. Such frames are still handed on.
    pub truncated: bool,
}

/// Strips AMT, IPv4 and UDP headers from a multicast data frame. IP options are skipped as
///  announced by the IHL field.
///
/// A frame shorter than its tunnel header is returned whole and flagged as truncated
///  since there is no reliable payload boundary.
pub fn decode_data(buf: &[u8]) -> Result<DataFrame<'_>, DecodeError> {
    if AmtMessageType::of(buf) != Some(AmtMessageType::MulticastData) {
        return Err(DecodeError::NotData);
    }
    if buf.len() < TUNNEL_HEADER_LEN {
        return Ok(DataFrame {
            payload: buf,
            truncated: true,
        });
    }

    let ver_ihl = buf[AMT_HDR_LEN];
    if ver_ihl >> 4 != 4 {
        return Err(DecodeError::Malformed("tunneled data is not IPv4"));
    }
    let ip_hdr_len = (ver_ihl & 0x0f) as usize * 4;
    if ip_hdr_len < IP_HDR_LEN {
        return Err(DecodeError::Malformed("IP header length below minimum"));
    }

    let header_end = AMT_HDR_LEN + ip_hdr_len + UDP_HDR_LEN;
    if buf.len() < header_end {
        return Ok(DataFrame {
            payload: buf,
            truncated: true,
        });
    }

    let total_len = u16::from_be_bytes([buf[AMT_HDR_LEN + 2], buf[AMT_HDR_LEN + 3]]) as usize;
    let Some(declared_payload_len) = total_len.checked_sub(ip_hdr_len + UDP_HDR_LEN) else {
        return Err(DecodeError::Malformed("IP total length shorter than IP and UDP headers"));
    };

    let payload = &buf[header_end..];
    if declared_payload_len > payload.len() {
        return Ok(DataFrame {
            payload,
            truncated: true,
        });
    }

    Ok(DataFrame {
        payload: &payload[..declared_payload_len],
        truncated: false,
    })
}

/// Relay side: encapsulates a UDP datagram from `source` to `group:port` in a data frame
pub fn encode_data(source: Ipv4Addr, group: Ipv4Addr, port: u16, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(TUNNEL_HEADER_LEN + payload.len());
    buf.put_u8(AmtMessageType::MulticastData.into());
    buf.put_u8(0);

    let mut ip = BytesMut::with_capacity(IP_HDR_LEN);
    ip.put_u8(0x45);
    ip.put_u8(0);
    ip.put_u16((IP_HDR_LEN + UDP_HDR_LEN + payload.len()).prechecked_cast());
    ip.put_u16(0);
    ip.put_u16(0x4000); // don't fragment
    ip.put_u8(64);
    ip.put_u8(UDP_PROTOCOL);
    ip.put_u16(0);
    ip.put_u32(source.to_bits());
    ip.put_u32(group.to_bits());
    patch_checksum(&mut ip, 10);
    buf.put_slice(&ip);

    buf.put_u16(port);
    buf.put_u16(port);
    buf.put_u16((UDP_HDR_LEN + payload.len()).prechecked_cast());
    buf.put_u16(0); // no UDP checksum
    buf.put_slice(payload);

    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const SOURCE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const GROUP: Ipv4Addr = Ipv4Addr::new(239, 1, 1, 1);

    #[test]
    fn test_tunnel_header_len() {
        assert_eq!(TUNNEL_HEADER_LEN, 30);
    }

    #[rstest]
    #[case::empty_payload(b"".as_slice())]
    #[case::short(b"hello".as_slice())]
    #[case::ts_packet(&[0x47u8; 188])]
    fn test_decode_data(#[case] payload: &[u8]) {
        let frame = encode_data(SOURCE, GROUP, 1234, payload);
        assert_eq!(frame.len(), 30 + payload.len());
        assert_eq!(decode_data(&frame), Ok(DataFrame { payload, truncated: false }));
    }

    #[test]
    fn test_decode_data_drops_padding() {
        let mut frame = encode_data(SOURCE, GROUP, 1234, b"abc").to_vec();
        frame.extend_from_slice(&[0, 0, 0]);
        assert_eq!(decode_data(&frame), Ok(DataFrame { payload: b"abc", truncated: false }));
    }

    #[test]
    fn test_decode_data_shorter_than_ip_length() {
        let frame = encode_data(SOURCE, GROUP, 1234, b"abcdef");
        assert_eq!(decode_data(&frame[..33]), Ok(DataFrame { payload: b"abc", truncated: true }));
    }

    /// re-encodes an encoded frame with a single 4 byte IP option (NOP padding)
    fn with_ip_option(frame: &[u8]) -> Vec<u8> {
        let mut result = frame[..AMT_HDR_LEN + IP_HDR_LEN].to_vec();
        result[AMT_HDR_LEN] = 0x46;
        let total_len = u16::from_be_bytes([result[4], result[5]]) + 4;
        result[4..6].copy_from_slice(&total_len.to_be_bytes());
        result.extend_from_slice(&[1, 1, 1, 0]);
        result.extend_from_slice(&frame[AMT_HDR_LEN + IP_HDR_LEN..]);
        result
    }

    #[test]
    fn test_decode_data_skips_ip_options() {
        let frame = with_ip_option(&encode_data(SOURCE, GROUP, 1234, b"hello"));
        assert_eq!(frame.len(), 34 + 5);
        assert_eq!(decode_data(&frame), Ok(DataFrame { payload: b"hello", truncated: false }));
    }

    #[test]
    fn test_decode_data_with_ip_options_truncated() {
        let frame = with_ip_option(&encode_data(SOURCE, GROUP, 1234, b"hello"));
        assert_eq!(decode_data(&frame[..37]), Ok(DataFrame { payload: b"hel", truncated: true }));
        assert_eq!(decode_data(&frame[..32]), Ok(DataFrame { payload: &frame[..32], truncated: true }));
    }

    #[rstest]
    #[case::type_only(1)]
    #[case::amt_header(2)]
    #[case::partial_ip(15)]
    #[case::partial_udp(29)]
    fn test_decode_data_truncated_header(#[case] len: usize) {
        let frame = encode_data(SOURCE, GROUP, 1234, b"payload");
        let decoded = decode_data(&frame[..len]).unwrap();
        assert!(decoded.truncated);
        assert_eq!(decoded.payload, &frame[..len]);
    }

    #[rstest]
    #[case::not_data(0, 4, DecodeError::NotData)]
    #[case::ipv6(2, 0x60, DecodeError::Malformed("tunneled data is not IPv4"))]
    #[case::ihl_below_minimum(2, 0x44, DecodeError::Malformed("IP header length below minimum"))]
    #[case::total_len(5, 20, DecodeError::Malformed("IP total length shorter than IP and UDP headers"))]
    fn test_decode_data_invalid(#[case] offset: usize, #[case] value: u8, #[case] expected: DecodeError) {
        let mut frame = encode_data(SOURCE, GROUP, 1234, b"payload").to_vec();
        frame[offset] = value;
        assert_eq!(decode_data(&frame), Err(expected));
    }
}
