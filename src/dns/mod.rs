pub mod edns;
pub mod enums;
pub mod header;
pub mod name;
pub mod packet;
pub mod question;
pub mod record;
pub mod rrset;

pub use edns::{EdnsOpt, EdnsOption};
pub use enums::{ExtendedErrorCode, RecordClass, RecordType, ResponseCode};
pub use header::DnsHeader;
pub use name::Name;
pub use packet::{DnsPacket, Section};
pub use question::DnsQuestion;
pub use record::{Dnskey, DnsRecord, Ds, Nsec, Nsec3, Rrsig};
pub use rrset::{group_records, RrKey, RrSet};
