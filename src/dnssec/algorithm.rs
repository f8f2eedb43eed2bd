use crate::error::{MimirError, Result};
use ring::signature;
use std::fmt;

/// DNSSEC signing algorithm numbers (RFC 4034, 5155, 5702, 6605, 8080).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    RsaMd5,
    Dsa,
    RsaSha1,
    DsaNsec3Sha1,
    RsaSha1Nsec3Sha1,
    RsaSha256,
    RsaSha512,
    EcdsaP256Sha256,
    EcdsaP384Sha384,
    Ed25519,
    Ed448,
    Unknown(u8),
}

impl From<u8> for Algorithm {
    fn from(value: u8) -> Self {
        match value {
            1 => Algorithm::RsaMd5,
            3 => Algorithm::Dsa,
            5 => Algorithm::RsaSha1,
            6 => Algorithm::DsaNsec3Sha1,
            7 => Algorithm::RsaSha1Nsec3Sha1,
            8 => Algorithm::RsaSha256,
            10 => Algorithm::RsaSha512,
            13 => Algorithm::EcdsaP256Sha256,
            14 => Algorithm::EcdsaP384Sha384,
            15 => Algorithm::Ed25519,
            16 => Algorithm::Ed448,
            other => Algorithm::Unknown(other),
        }
    }
}

impl From<Algorithm> for u8 {
    fn from(alg: Algorithm) -> Self {
        match alg {
            Algorithm::RsaMd5 => 1,
            Algorithm::Dsa => 3,
            Algorithm::RsaSha1 => 5,
            Algorithm::DsaNsec3Sha1 => 6,
            Algorithm::RsaSha1Nsec3Sha1 => 7,
            Algorithm::RsaSha256 => 8,
            Algorithm::RsaSha512 => 10,
            Algorithm::EcdsaP256Sha256 => 13,
            Algorithm::EcdsaP384Sha384 => 14,
            Algorithm::Ed25519 => 15,
            Algorithm::Ed448 => 16,
            Algorithm::Unknown(other) => other,
        }
    }
}

impl Algorithm {
    /// Whether signatures made with this algorithm can be verified here.
    pub fn is_supported(&self) -> bool {
        matches!(
            self,
            Algorithm::RsaSha1
                | Algorithm::RsaSha1Nsec3Sha1
                | Algorithm::RsaSha256
                | Algorithm::RsaSha512
                | Algorithm::EcdsaP256Sha256
                | Algorithm::EcdsaP384Sha384
                | Algorithm::Ed25519
        )
    }

    /// Verify `signature_bytes` over `message` with a public key in DNSKEY
    /// wire encoding.
    ///
    /// RSA keys are re-encoded from RFC 3110 form into the DER RSAPublicKey
    /// layout ring expects; ECDSA keys gain the uncompressed-point prefix and
    /// use fixed-width r||s signatures, which is what RRSIG carries.
    pub fn verify(&self, public_key: &[u8], message: &[u8], signature_bytes: &[u8]) -> Result<()> {
        let verify_with = |alg: &'static dyn signature::VerificationAlgorithm,
                           key: &[u8]|
         -> Result<()> {
            signature::UnparsedPublicKey::new(alg, key)
                .verify(message, signature_bytes)
                .map_err(|_| MimirError::SignatureVerificationFailed)
        };

        match self {
            Algorithm::RsaSha1 | Algorithm::RsaSha1Nsec3Sha1 => {
                let der = rsa_dnskey_to_der(public_key)?;
                verify_with(
                    &signature::RSA_PKCS1_1024_8192_SHA1_FOR_LEGACY_USE_ONLY,
                    &der,
                )
            }
            Algorithm::RsaSha256 => {
                let der = rsa_dnskey_to_der(public_key)?;
                verify_with(&signature::RSA_PKCS1_1024_8192_SHA256_FOR_LEGACY_USE_ONLY, &der)
            }
            Algorithm::RsaSha512 => {
                let der = rsa_dnskey_to_der(public_key)?;
                verify_with(&signature::RSA_PKCS1_1024_8192_SHA512_FOR_LEGACY_USE_ONLY, &der)
            }
            Algorithm::EcdsaP256Sha256 => {
                let point = ecdsa_uncompressed_point(public_key, 64)?;
                verify_with(&signature::ECDSA_P256_SHA256_FIXED, &point)
            }
            Algorithm::EcdsaP384Sha384 => {
                let point = ecdsa_uncompressed_point(public_key, 96)?;
                verify_with(&signature::ECDSA_P384_SHA384_FIXED, &point)
            }
            Algorithm::Ed25519 => verify_with(&signature::ED25519, public_key),
            other => Err(MimirError::UnsupportedAlgorithm(u8::from(*other))),
        }
    }
}

/// Convert an RFC 3110 RSA DNSKEY public key (exponent length, exponent,
/// modulus) to the DER `RSAPublicKey` structure.
fn rsa_dnskey_to_der(key: &[u8]) -> Result<Vec<u8>> {
    if key.is_empty() {
        return Err(MimirError::InvalidPublicKey);
    }
    let (exp_len, exp_start) = if key[0] != 0 {
        (key[0] as usize, 1)
    } else {
        if key.len() < 3 {
            return Err(MimirError::InvalidPublicKey);
        }
        (u16::from_be_bytes([key[1], key[2]]) as usize, 3)
    };
    let mod_start = exp_start + exp_len;
    if exp_len == 0 || mod_start >= key.len() {
        return Err(MimirError::InvalidPublicKey);
    }
    let exponent = &key[exp_start..mod_start];
    let modulus = &key[mod_start..];

    let mut body = Vec::with_capacity(key.len() + 16);
    der_integer(&mut body, modulus);
    der_integer(&mut body, exponent);
    let mut der = Vec::with_capacity(body.len() + 4);
    der.push(0x30);
    der_length(&mut der, body.len());
    der.extend_from_slice(&body);
    Ok(der)
}

fn der_integer(out: &mut Vec<u8>, value: &[u8]) {
    let mut v = value;
    while v.len() > 1 && v[0] == 0 {
        v = &v[1..];
    }
    let pad = (v[0] & 0x80) != 0;
    out.push(0x02);
    der_length(out, v.len() + pad as usize);
    if pad {
        out.push(0);
    }
    out.extend_from_slice(v);
}

fn der_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else if len < 0x100 {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.push((len >> 8) as u8);
        out.push(len as u8);
    }
}

/// DNSKEY ECDSA keys are the bare x||y coordinates; ring wants the SEC 1
/// uncompressed form with the 0x04 prefix.
fn ecdsa_uncompressed_point(key: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    if key.len() != expected_len {
        return Err(MimirError::InvalidPublicKey);
    }
    let mut point = Vec::with_capacity(expected_len + 1);
    point.push(0x04);
    point.extend_from_slice(key);
    Ok(point)
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::RsaMd5 => write!(f, "RSAMD5"),
            Algorithm::Dsa => write!(f, "DSA"),
            Algorithm::RsaSha1 => write!(f, "RSASHA1"),
            Algorithm::DsaNsec3Sha1 => write!(f, "DSA-NSEC3-SHA1"),
            Algorithm::RsaSha1Nsec3Sha1 => write!(f, "RSASHA1-NSEC3-SHA1"),
            Algorithm::RsaSha256 => write!(f, "RSASHA256"),
            Algorithm::RsaSha512 => write!(f, "RSASHA512"),
            Algorithm::EcdsaP256Sha256 => write!(f, "ECDSAP256SHA256"),
            Algorithm::EcdsaP384Sha384 => write!(f, "ECDSAP384SHA384"),
            Algorithm::Ed25519 => write!(f, "ED25519"),
            Algorithm::Ed448 => write!(f, "ED448"),
            Algorithm::Unknown(v) => write!(f, "ALG{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_numbers_round_trip() {
        for v in [1u8, 3, 5, 6, 7, 8, 10, 13, 14, 15, 16, 200] {
            assert_eq!(u8::from(Algorithm::from(v)), v);
        }
    }

    #[test]
    fn unsupported_algorithms_rejected() {
        assert!(!Algorithm::RsaMd5.is_supported());
        assert!(!Algorithm::Unknown(99).is_supported());
        assert!(Algorithm::RsaSha256.is_supported());
        let err = Algorithm::Dsa.verify(&[0; 32], b"msg", &[0; 40]).unwrap_err();
        assert!(matches!(err, MimirError::UnsupportedAlgorithm(3)));
    }

    #[test]
    fn rsa_der_reencoding() {
        // exponent 65537, tiny modulus with high bit set
        let key = [3u8, 0x01, 0x00, 0x01, 0x81, 0x23, 0x45];
        let der = rsa_dnskey_to_der(&key).unwrap();
        // SEQUENCE { INTEGER 00 81 23 45, INTEGER 01 00 01 }
        assert_eq!(
            der,
            vec![0x30, 0x0B, 0x02, 0x04, 0x00, 0x81, 0x23, 0x45, 0x02, 0x03, 0x01, 0x00, 0x01]
        );
    }

    #[test]
    fn ecdsa_point_gets_prefix() {
        let key = [0xAB; 64];
        let point = ecdsa_uncompressed_point(&key, 64).unwrap();
        assert_eq!(point[0], 0x04);
        assert_eq!(point.len(), 65);
        assert!(ecdsa_uncompressed_point(&key, 96).is_err());
    }
}
