use super::enums::{RecordClass, RecordType};
use super::name::Name;
use crate::error::{MimirError, Result};

/// One entry of the question section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub qname: Name,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}

impl DnsQuestion {
    pub fn new(qname: Name, qtype: RecordType, qclass: RecordClass) -> Self {
        DnsQuestion {
            qname,
            qtype,
            qclass,
        }
    }

    pub fn parse(data: &[u8], start: usize) -> Result<(Self, usize)> {
        let (qname, offset) = Name::parse(data, start)?;
        if offset + 4 > data.len() {
            return Err(MimirError::UnexpectedEnd);
        }
        let qtype = RecordType::from(u16::from_be_bytes([data[offset], data[offset + 1]]));
        let qclass = RecordClass::from(u16::from_be_bytes([data[offset + 2], data[offset + 3]]));
        Ok((
            DnsQuestion {
                qname,
                qtype,
                qclass,
            },
            offset + 4,
        ))
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.qname.as_wire());
        out.extend_from_slice(&u16::from(self.qtype).to_be_bytes());
        out.extend_from_slice(&u16::from(self.qclass).to_be_bytes());
    }
}
