use ring::digest;
use std::fmt;

/// DS digest type numbers (RFC 4034, 4509, 6605).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestType {
    Sha1,
    Sha256,
    Gost94,
    Sha384,
    Unknown(u8),
}

impl From<u8> for DigestType {
    fn from(value: u8) -> Self {
        match value {
            1 => DigestType::Sha1,
            2 => DigestType::Sha256,
            3 => DigestType::Gost94,
            4 => DigestType::Sha384,
            other => DigestType::Unknown(other),
        }
    }
}

impl From<DigestType> for u8 {
    fn from(dt: DigestType) -> Self {
        match dt {
            DigestType::Sha1 => 1,
            DigestType::Sha256 => 2,
            DigestType::Gost94 => 3,
            DigestType::Sha384 => 4,
            DigestType::Unknown(other) => other,
        }
    }
}

impl DigestType {
    pub fn is_supported(&self) -> bool {
        matches!(self, DigestType::Sha1 | DigestType::Sha256 | DigestType::Sha384)
    }

    pub fn digest_len(&self) -> usize {
        match self {
            DigestType::Sha1 => 20,
            DigestType::Sha256 | DigestType::Gost94 => 32,
            DigestType::Sha384 => 48,
            DigestType::Unknown(_) => 0,
        }
    }

    /// Hash `data`, or `None` for digest types without an implementation.
    pub fn digest(&self, data: &[u8]) -> Option<Vec<u8>> {
        let alg = match self {
            DigestType::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
            DigestType::Sha256 => &digest::SHA256,
            DigestType::Sha384 => &digest::SHA384,
            _ => return None,
        };
        Some(digest::digest(alg, data).as_ref().to_vec())
    }
}

impl fmt::Display for DigestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestType::Sha1 => write!(f, "SHA1"),
            DigestType::Sha256 => write!(f, "SHA256"),
            DigestType::Gost94 => write!(f, "GOST94"),
            DigestType::Sha384 => write!(f, "SHA384"),
            DigestType::Unknown(v) => write!(f, "DIGEST{}", v),
        }
    }
}
