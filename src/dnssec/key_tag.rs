/// Compute the key tag of a DNSKEY from its rdata fields (RFC 4034
/// Appendix B): a ones-complement-style checksum over the wire rdata.
pub fn calculate_key_tag(flags: u16, protocol: u8, algorithm: u8, public_key: &[u8]) -> u16 {
    // RSAMD5 keys use the low 16 bits of the modulus instead (Appendix B.1).
    if algorithm == 1 {
        let len = public_key.len();
        if len >= 3 {
            return u16::from_be_bytes([public_key[len - 3], public_key[len - 2]]);
        }
        return 0;
    }

    let mut acc: u32 = 0;
    let header = [
        (flags >> 8) as u8,
        flags as u8,
        protocol,
        algorithm,
    ];
    for (i, &byte) in header.iter().chain(public_key.iter()).enumerate() {
        if i & 1 == 0 {
            acc += u32::from(byte) << 8;
        } else {
            acc += u32::from(byte);
        }
    }
    acc += acc >> 16;
    (acc & 0xFFFF) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc4034_test_vector() {
        // DNSKEY from RFC 4034 Appendix B.5: flags 257, protocol 3, RSASHA1.
        let public_key = hex::decode(
            "030101a80020a95566ba42e886bb804cda84e47ef56dbd7aec612615552c\
             ec906d3e9b72dc4f90d3fc09b8e9d0ff2ae8ee5ed8cd61d7622c39ee2d76\
             a2153bc0ac8b9e254125c46e0a224507fb358d7f6b5d7a42f75e60b9748e\
             7c0747e2447f4bd7d10ca24bb1498de34a504406bbeb3b041fe48d0ad2b1\
             de5adadb87d0c8824e7cc4dc3e5b7f0b3e8ac72c3d3d8aa7251abcaad82a\
             d5ececed8cd83825d19ffd95e93bca729fdd88901b20fc598fb6a0779ddf\
             a95e3e42ca9d0a7739d3c4ad3a7a5a30b3c60a73a6f09fdb812746e0d69e\
             dfba06754465f2e1dd5e3802e6d05bd6148e38fd8ca1632b71f6559fe9b6\
             e18d73c5a750e3e2f2f205972e7b28ae04ddae5e27915a08d217db5ce090\
             c119d23f79fb",
        )
        .unwrap();
        assert_eq!(calculate_key_tag(0x0101, 3, 5, &public_key), 55495);
    }

    #[test]
    fn rsamd5_uses_modulus_tail() {
        let public_key = vec![0x12, 0x34, 0x56, 0x78];
        // leading 16 bits of the trailing 24 bits of the key material
        assert_eq!(calculate_key_tag(0x0101, 3, 1, &public_key), 0x3456);
    }
}
