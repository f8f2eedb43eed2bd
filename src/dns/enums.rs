use serde::{Deserialize, Serialize};
use std::fmt;

/// DNS resource record types handled by the resolver core.
///
/// Types the core does not interpret are carried as `Unknown` and treated as
/// opaque rdata end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    A,
    Ns,
    Cname,
    Soa,
    Ptr,
    Mx,
    Txt,
    Aaaa,
    Srv,
    Opt,
    Ds,
    Rrsig,
    Nsec,
    Dnskey,
    Nsec3,
    Nsec3Param,
    Dname,
    Any,
    Unknown(u16),
}

impl From<u16> for RecordType {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordType::A,
            2 => RecordType::Ns,
            5 => RecordType::Cname,
            6 => RecordType::Soa,
            12 => RecordType::Ptr,
            15 => RecordType::Mx,
            16 => RecordType::Txt,
            28 => RecordType::Aaaa,
            33 => RecordType::Srv,
            39 => RecordType::Dname,
            41 => RecordType::Opt,
            43 => RecordType::Ds,
            46 => RecordType::Rrsig,
            47 => RecordType::Nsec,
            48 => RecordType::Dnskey,
            50 => RecordType::Nsec3,
            51 => RecordType::Nsec3Param,
            255 => RecordType::Any,
            other => RecordType::Unknown(other),
        }
    }
}

impl From<RecordType> for u16 {
    fn from(rtype: RecordType) -> Self {
        match rtype {
            RecordType::A => 1,
            RecordType::Ns => 2,
            RecordType::Cname => 5,
            RecordType::Soa => 6,
            RecordType::Ptr => 12,
            RecordType::Mx => 15,
            RecordType::Txt => 16,
            RecordType::Aaaa => 28,
            RecordType::Srv => 33,
            RecordType::Dname => 39,
            RecordType::Opt => 41,
            RecordType::Ds => 43,
            RecordType::Rrsig => 46,
            RecordType::Nsec => 47,
            RecordType::Dnskey => 48,
            RecordType::Nsec3 => 50,
            RecordType::Nsec3Param => 51,
            RecordType::Any => 255,
            RecordType::Unknown(other) => other,
        }
    }
}

impl RecordType {
    /// DNSSEC metadata types are never cached under the plain discriminator.
    pub fn is_dnssec(&self) -> bool {
        matches!(
            self,
            RecordType::Ds
                | RecordType::Rrsig
                | RecordType::Nsec
                | RecordType::Dnskey
                | RecordType::Nsec3
                | RecordType::Nsec3Param
        )
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::A => write!(f, "A"),
            RecordType::Ns => write!(f, "NS"),
            RecordType::Cname => write!(f, "CNAME"),
            RecordType::Soa => write!(f, "SOA"),
            RecordType::Ptr => write!(f, "PTR"),
            RecordType::Mx => write!(f, "MX"),
            RecordType::Txt => write!(f, "TXT"),
            RecordType::Aaaa => write!(f, "AAAA"),
            RecordType::Srv => write!(f, "SRV"),
            RecordType::Dname => write!(f, "DNAME"),
            RecordType::Opt => write!(f, "OPT"),
            RecordType::Ds => write!(f, "DS"),
            RecordType::Rrsig => write!(f, "RRSIG"),
            RecordType::Nsec => write!(f, "NSEC"),
            RecordType::Dnskey => write!(f, "DNSKEY"),
            RecordType::Nsec3 => write!(f, "NSEC3"),
            RecordType::Nsec3Param => write!(f, "NSEC3PARAM"),
            RecordType::Any => write!(f, "ANY"),
            RecordType::Unknown(v) => write!(f, "TYPE{}", v),
        }
    }
}

/// DNS record classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordClass {
    In,
    Ch,
    Hs,
    None,
    Any,
    Unknown(u16),
}

impl From<u16> for RecordClass {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordClass::In,
            3 => RecordClass::Ch,
            4 => RecordClass::Hs,
            254 => RecordClass::None,
            255 => RecordClass::Any,
            other => RecordClass::Unknown(other),
        }
    }
}

impl From<RecordClass> for u16 {
    fn from(class: RecordClass) -> Self {
        match class {
            RecordClass::In => 1,
            RecordClass::Ch => 3,
            RecordClass::Hs => 4,
            RecordClass::None => 254,
            RecordClass::Any => 255,
            RecordClass::Unknown(other) => other,
        }
    }
}

impl fmt::Display for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordClass::In => write!(f, "IN"),
            RecordClass::Ch => write!(f, "CH"),
            RecordClass::Hs => write!(f, "HS"),
            RecordClass::None => write!(f, "NONE"),
            RecordClass::Any => write!(f, "ANY"),
            RecordClass::Unknown(v) => write!(f, "CLASS{}", v),
        }
    }
}

/// DNS response codes (RFC 1035 plus common extensions)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    NoError,
    FormatError,
    ServerFailure,
    NameError,
    NotImplemented,
    Refused,
    YxDomain,
    YxRrSet,
    NxRrSet,
    NotAuth,
    NotZone,
    Unknown(u8),
}

impl From<u8> for ResponseCode {
    fn from(value: u8) -> Self {
        match value {
            0 => ResponseCode::NoError,
            1 => ResponseCode::FormatError,
            2 => ResponseCode::ServerFailure,
            3 => ResponseCode::NameError,
            4 => ResponseCode::NotImplemented,
            5 => ResponseCode::Refused,
            6 => ResponseCode::YxDomain,
            7 => ResponseCode::YxRrSet,
            8 => ResponseCode::NxRrSet,
            9 => ResponseCode::NotAuth,
            10 => ResponseCode::NotZone,
            other => ResponseCode::Unknown(other),
        }
    }
}

impl From<ResponseCode> for u8 {
    fn from(rcode: ResponseCode) -> Self {
        match rcode {
            ResponseCode::NoError => 0,
            ResponseCode::FormatError => 1,
            ResponseCode::ServerFailure => 2,
            ResponseCode::NameError => 3,
            ResponseCode::NotImplemented => 4,
            ResponseCode::Refused => 5,
            ResponseCode::YxDomain => 6,
            ResponseCode::YxRrSet => 7,
            ResponseCode::NxRrSet => 8,
            ResponseCode::NotAuth => 9,
            ResponseCode::NotZone => 10,
            ResponseCode::Unknown(other) => other,
        }
    }
}

/// Extended DNS error codes (RFC 8914) attached to SERVFAIL diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedErrorCode {
    Other,
    DnssecIndeterminate,
    DnssecBogus,
    SignatureExpired,
    SignatureNotYetValid,
    DnskeyMissing,
    RrsigsMissing,
    NsecMissing,
    NoReachableAuthority,
    NetworkError,
}

impl From<ExtendedErrorCode> for u16 {
    fn from(code: ExtendedErrorCode) -> Self {
        match code {
            ExtendedErrorCode::Other => 0,
            ExtendedErrorCode::DnssecIndeterminate => 5,
            ExtendedErrorCode::DnssecBogus => 6,
            ExtendedErrorCode::SignatureExpired => 7,
            ExtendedErrorCode::SignatureNotYetValid => 8,
            ExtendedErrorCode::DnskeyMissing => 9,
            ExtendedErrorCode::RrsigsMissing => 10,
            ExtendedErrorCode::NsecMissing => 11,
            ExtendedErrorCode::NoReachableAuthority => 22,
            ExtendedErrorCode::NetworkError => 23,
        }
    }
}

impl From<u16> for ExtendedErrorCode {
    fn from(value: u16) -> Self {
        match value {
            5 => ExtendedErrorCode::DnssecIndeterminate,
            6 => ExtendedErrorCode::DnssecBogus,
            7 => ExtendedErrorCode::SignatureExpired,
            8 => ExtendedErrorCode::SignatureNotYetValid,
            9 => ExtendedErrorCode::DnskeyMissing,
            10 => ExtendedErrorCode::RrsigsMissing,
            11 => ExtendedErrorCode::NsecMissing,
            22 => ExtendedErrorCode::NoReachableAuthority,
            23 => ExtendedErrorCode::NetworkError,
            _ => ExtendedErrorCode::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_type_round_trip() {
        for v in [1u16, 2, 5, 6, 28, 39, 43, 46, 47, 48, 50, 51, 255, 64] {
            let rtype = RecordType::from(v);
            assert_eq!(u16::from(rtype), v);
        }
    }

    #[test]
    fn dnssec_types_flagged() {
        assert!(RecordType::Rrsig.is_dnssec());
        assert!(RecordType::Ds.is_dnssec());
        assert!(!RecordType::A.is_dnssec());
        assert!(!RecordType::Cname.is_dnssec());
    }
}
