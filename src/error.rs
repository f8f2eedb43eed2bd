use std::sync::Arc;
use thiserror::Error;

/// Unified error type for the mimir resolver core
#[derive(Debug, Clone, Error)]
pub enum MimirError {
    // IO errors
    #[error("IO error: {0}")]
    Io(String),
    #[error("IO error: {0}")]
    IoError(Arc<std::io::Error>),

    // Wire format errors
    #[error("Invalid DNS header")]
    InvalidHeader,
    #[error("Invalid DNS label")]
    InvalidLabel,
    #[error("Invalid compression pointer")]
    InvalidPointer,
    #[error("Record data extends past end of packet")]
    UnexpectedEnd,
    #[error("Parse error: {0}")]
    ParseError(String),

    // Resolution errors
    #[error("Operation timed out")]
    Timeout,
    #[error("Request deadline expired")]
    DeadlineExpired,
    #[error("Network error: {0}")]
    Network(String),
    #[error("No usable name server for zone {0}")]
    NoNameServer(String),
    #[error("Record not found")]
    NotFound,
    #[error("Query loop detected: {0}")]
    QueryLoop(String),
    #[error("CNAME chain length limit exceeded")]
    ChainLimitExceeded,
    #[error("Resolution plan depth limit exceeded")]
    PlanDepthExceeded,
    #[error("Retry budget exhausted")]
    RetryBudgetExhausted,
    #[error("Delegation does not match queried zone: {0}")]
    DelegationMismatch(String),

    // Cache errors
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("Cache transaction is no longer open")]
    TransactionClosed,

    // DNSSEC errors
    #[error("No DNSKEY record found for validation")]
    NoDnsKey,
    #[error("No DS record found at parent zone")]
    NoDs,
    #[error("No RRSIG record found for RRset")]
    NoRrsig,
    #[error("DNSSEC signature has expired")]
    SignatureExpired,
    #[error("DNSSEC signature is not yet valid")]
    SignatureNotYetValid,
    #[error("Unsupported DNSSEC algorithm: {0}")]
    UnsupportedAlgorithm(u8),
    #[error("Unsupported digest type: {0}")]
    UnsupportedDigestType(u8),
    #[error("DNSSEC signature verification failed")]
    SignatureVerificationFailed,
    #[error("DS record digest does not match DNSKEY")]
    DsDigestMismatch,
    #[error("Invalid DNSKEY public key format")]
    InvalidPublicKey,
    #[error("Invalid RRSIG format")]
    InvalidSignature,
    #[error("NSEC/NSEC3 denial of existence validation failed")]
    DenialOfExistenceFailed,
    #[error("NSEC3 iteration count exceeds limit")]
    TooManyIterations,
    #[error("Invalid NSEC3 parameters")]
    InvalidNsec3Parameters,
    #[error("Trust anchor not found for validation")]
    TrustAnchorNotFound,
    #[error("Delegation is provably insecure")]
    ProvablyInsecure,

    // Configuration errors
    #[error("Invalid address literal: {0}")]
    InvalidAddress(String),
    #[error("Invalid subnet: {0}")]
    InvalidSubnet(String),
    #[error("Configuration parse error: {0}")]
    ConfigParse(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Coarse classification used by recovery policy.
///
/// Recovery is decided on the kind, never on the concrete variant:
/// `Timeout` and `Network` trigger name-server reselection, `NotFound` and
/// `Parse` on a single response trigger an alternate server, `Loop`,
/// `LimitExceeded` and `CryptoBogus` surface to the parent query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    Parse,
    Timeout,
    Network,
    NoResources,
    NotFound,
    Loop,
    Mismatch,
    CryptoBogus,
    CryptoInsecure,
    LimitExceeded,
}

impl MimirError {
    /// Classify this error for recovery decisions.
    pub fn kind(&self) -> ErrorKind {
        use MimirError::*;
        match self {
            Io(_) | IoError(_) | Network(_) => ErrorKind::Network,
            InvalidHeader | InvalidLabel | InvalidPointer | UnexpectedEnd | ParseError(_)
            | InvalidSignature | InvalidPublicKey | InvalidNsec3Parameters => ErrorKind::Parse,
            Timeout | DeadlineExpired => ErrorKind::Timeout,
            NoNameServer(_) | Cache(_) | TransactionClosed => ErrorKind::NoResources,
            NotFound | NoDnsKey | NoDs | NoRrsig | TrustAnchorNotFound => ErrorKind::NotFound,
            QueryLoop(_) => ErrorKind::Loop,
            DelegationMismatch(_) | DsDigestMismatch => ErrorKind::Mismatch,
            SignatureExpired | SignatureNotYetValid | SignatureVerificationFailed
            | DenialOfExistenceFailed | UnsupportedAlgorithm(_) | UnsupportedDigestType(_) => {
                ErrorKind::CryptoBogus
            }
            ProvablyInsecure => ErrorKind::CryptoInsecure,
            ChainLimitExceeded | PlanDepthExceeded | RetryBudgetExhausted | TooManyIterations => {
                ErrorKind::LimitExceeded
            }
            InvalidAddress(_) | InvalidSubnet(_) | ConfigParse(_) | InvalidArgument(_) => {
                ErrorKind::InvalidArgument
            }
        }
    }

    /// Whether the failing sub-query may be retried against another server.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::Network | ErrorKind::NotFound | ErrorKind::Parse
        )
    }
}

impl From<std::io::Error> for MimirError {
    fn from(err: std::io::Error) -> Self {
        MimirError::IoError(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, MimirError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_drive_recovery() {
        assert!(MimirError::Timeout.is_recoverable());
        assert!(MimirError::Network("refused".into()).is_recoverable());
        assert!(!MimirError::QueryLoop("a. A IN".into()).is_recoverable());
        assert!(!MimirError::ChainLimitExceeded.is_recoverable());
        assert_eq!(MimirError::SignatureExpired.kind(), ErrorKind::CryptoBogus);
        assert_eq!(MimirError::ProvablyInsecure.kind(), ErrorKind::CryptoInsecure);
    }
}
