/// The Internet checksum of RFC 1071: one's complement of the one's complement sum of all
///  16 bit words, an odd trailing byte being padded with zero.
///
/// Words are taken in network byte order, and the result is meant to be written back in
///  network byte order (`put_u16`). Verifying a region that already contains its checksum
///  yields zero.
pub fn checksum16(buf: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut words = buf.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = words.remainder() {
        sum += (*last as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

/// Writes the checksum of `buf` into `buf[offset..offset+2]`, which must be zero beforehand
pub fn patch_checksum(buf: &mut [u8], offset: usize) {
    let checksum = checksum16(buf);
    buf[offset..offset + 2].copy_from_slice(&checksum.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(&[], 0xffff)]
    #[case::zeros(&[0, 0, 0, 0], 0xffff)]
    #[case::single_word(&[0x12, 0x34], 0xedcb)]
    #[case::odd(&[0x12], 0xedff)]
    #[case::carry(&[0xff, 0xff, 0x00, 0x01], 0xfffe)]
    // the example from RFC 1071 section 3: sum 0xddf2, checksum is its complement
    #[case::rfc1071(&[0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7], 0x220d)]
    // IPv4 header from the wikipedia article on the IPv4 header checksum
    #[case::ip_header(&[0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8, 0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7], 0xb861)]
    fn test_checksum16(#[case] buf: &[u8], #[case] expected: u16) {
        assert_eq!(checksum16(buf), expected);
    }

    #[rstest]
    #[case::even(vec![0x46, 0xc0, 0x00, 0x2c, 0, 0, 0, 0, 0x01, 0x02, 0, 0, 0, 0, 0, 0, 0xe0, 0, 0, 0x16, 0x94, 0x04, 0, 0], 10)]
    #[case::odd_trailing(vec![0x22, 0x00, 0, 0, 0x12, 0x34, 0x56], 2)]
    #[case::all_ones(vec![0xff, 0xff, 0, 0, 0xff, 0xff], 2)]
    fn test_checksum16_verifies_to_zero(#[case] mut buf: Vec<u8>, #[case] offset: usize) {
        patch_checksum(&mut buf, offset);
        assert_eq!(checksum16(&buf), 0);
    }
}
