use super::enums::{RecordClass, RecordType};
use super::name::Name;
use crate::error::{MimirError, Result};
use std::net::{Ipv4Addr, Ipv6Addr};

/// A single resource record with rdata held in uncompressed wire form.
///
/// Compression pointers inside rdata are expanded at parse time so records
/// can be copied, cached and fed to the canonical signing input without a
/// back-reference to the packet buffer they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: Name,
    pub rtype: RecordType,
    pub rclass: RecordClass,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsRecord {
    pub fn new(name: Name, rtype: RecordType, rclass: RecordClass, ttl: u32, rdata: Vec<u8>) -> Self {
        DnsRecord {
            name,
            rtype,
            rclass,
            ttl,
            rdata,
        }
    }

    /// Parse one record starting at `start`, expanding any compressed names
    /// inside the rdata. Returns the record and the offset past it.
    pub fn parse(data: &[u8], start: usize) -> Result<(Self, usize)> {
        let (name, offset) = Name::parse(data, start)?;
        if offset + 10 > data.len() {
            return Err(MimirError::UnexpectedEnd);
        }
        let rtype = RecordType::from(u16::from_be_bytes([data[offset], data[offset + 1]]));
        let rclass = RecordClass::from(u16::from_be_bytes([data[offset + 2], data[offset + 3]]));
        let ttl = u32::from_be_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]);
        let rdlen = u16::from_be_bytes([data[offset + 8], data[offset + 9]]) as usize;
        let rdata_start = offset + 10;
        let rdata_end = rdata_start + rdlen;
        if rdata_end > data.len() {
            return Err(MimirError::UnexpectedEnd);
        }
        let rdata = expand_rdata(data, rdata_start, rdata_end, rtype)?;
        Ok((
            DnsRecord {
                name,
                rtype,
                rclass,
                ttl,
                rdata,
            },
            rdata_end,
        ))
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.name.as_wire());
        out.extend_from_slice(&u16::from(self.rtype).to_be_bytes());
        out.extend_from_slice(&u16::from(self.rclass).to_be_bytes());
        out.extend_from_slice(&self.ttl.to_be_bytes());
        out.extend_from_slice(&(self.rdata.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.rdata);
    }

    /// The single name making up the rdata of NS, CNAME, PTR and DNAME.
    pub fn rdata_name(&self) -> Result<Name> {
        let (name, end) = Name::parse(&self.rdata, 0)?;
        if end != self.rdata.len() {
            return Err(MimirError::ParseError("trailing rdata after name".into()));
        }
        Ok(name)
    }

    pub fn a_addr(&self) -> Option<Ipv4Addr> {
        if self.rtype == RecordType::A && self.rdata.len() == 4 {
            Some(Ipv4Addr::new(
                self.rdata[0],
                self.rdata[1],
                self.rdata[2],
                self.rdata[3],
            ))
        } else {
            None
        }
    }

    pub fn aaaa_addr(&self) -> Option<Ipv6Addr> {
        if self.rtype == RecordType::Aaaa && self.rdata.len() == 16 {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&self.rdata);
            Some(Ipv6Addr::from(octets))
        } else {
            None
        }
    }

    pub fn as_rrsig(&self) -> Result<Rrsig> {
        Rrsig::parse(&self.rdata)
    }

    pub fn as_dnskey(&self) -> Result<Dnskey> {
        Dnskey::parse(&self.rdata)
    }

    pub fn as_ds(&self) -> Result<Ds> {
        Ds::parse(&self.rdata)
    }

    pub fn as_nsec(&self) -> Result<Nsec> {
        Nsec::parse(&self.rdata)
    }

    pub fn as_nsec3(&self) -> Result<Nsec3> {
        Nsec3::parse(&self.rdata)
    }

    /// For RRSIG records, the covered type in the leading two rdata bytes.
    pub fn rrsig_covered(&self) -> Option<RecordType> {
        if self.rtype == RecordType::Rrsig && self.rdata.len() >= 2 {
            Some(RecordType::from(u16::from_be_bytes([
                self.rdata[0],
                self.rdata[1],
            ])))
        } else {
            None
        }
    }
}

/// Expand compressed names embedded in rdata into plain wire form.
///
/// Only the record types whose rdata carries names are rewritten; everything
/// else is copied verbatim.
fn expand_rdata(data: &[u8], start: usize, end: usize, rtype: RecordType) -> Result<Vec<u8>> {
    let raw = &data[start..end];
    match rtype {
        RecordType::Ns | RecordType::Cname | RecordType::Ptr | RecordType::Dname => {
            let (name, _) = Name::parse(data, start)?;
            Ok(name.as_wire().to_vec())
        }
        RecordType::Mx => {
            if raw.len() < 3 {
                return Err(MimirError::UnexpectedEnd);
            }
            let (name, _) = Name::parse(data, start + 2)?;
            let mut out = raw[..2].to_vec();
            out.extend_from_slice(name.as_wire());
            Ok(out)
        }
        RecordType::Srv => {
            if raw.len() < 7 {
                return Err(MimirError::UnexpectedEnd);
            }
            let (name, _) = Name::parse(data, start + 6)?;
            let mut out = raw[..6].to_vec();
            out.extend_from_slice(name.as_wire());
            Ok(out)
        }
        RecordType::Soa => {
            let (mname, after_mname) = Name::parse(data, start)?;
            let (rname, after_rname) = Name::parse(data, after_mname)?;
            if after_rname + 20 > end {
                return Err(MimirError::UnexpectedEnd);
            }
            let mut out = Vec::with_capacity(mname.as_wire().len() + rname.as_wire().len() + 20);
            out.extend_from_slice(mname.as_wire());
            out.extend_from_slice(rname.as_wire());
            out.extend_from_slice(&data[after_rname..after_rname + 20]);
            Ok(out)
        }
        _ => Ok(raw.to_vec()),
    }
}

/// Parsed RRSIG rdata (RFC 4034 §3.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rrsig {
    pub type_covered: RecordType,
    pub algorithm: u8,
    pub labels: u8,
    pub original_ttl: u32,
    pub expiration: u32,
    pub inception: u32,
    pub key_tag: u16,
    pub signer: Name,
    pub signature: Vec<u8>,
}

impl Rrsig {
    pub fn parse(rdata: &[u8]) -> Result<Self> {
        if rdata.len() < 18 {
            return Err(MimirError::InvalidSignature);
        }
        let (signer, sig_start) = Name::parse(rdata, 18).map_err(|_| MimirError::InvalidSignature)?;
        if sig_start >= rdata.len() {
            return Err(MimirError::InvalidSignature);
        }
        Ok(Rrsig {
            type_covered: RecordType::from(u16::from_be_bytes([rdata[0], rdata[1]])),
            algorithm: rdata[2],
            labels: rdata[3],
            original_ttl: u32::from_be_bytes([rdata[4], rdata[5], rdata[6], rdata[7]]),
            expiration: u32::from_be_bytes([rdata[8], rdata[9], rdata[10], rdata[11]]),
            inception: u32::from_be_bytes([rdata[12], rdata[13], rdata[14], rdata[15]]),
            key_tag: u16::from_be_bytes([rdata[16], rdata[17]]),
            signer,
            signature: rdata[sig_start..].to_vec(),
        })
    }

    /// The rdata prefix covered by the signature: everything up to and
    /// including the signer name, with the signer lowercased.
    pub fn signed_prefix(&self, rdata: &[u8]) -> Vec<u8> {
        let mut out = rdata[..18].to_vec();
        out.extend_from_slice(&self.signer.to_lowercase_wire());
        out
    }
}

/// Parsed DNSKEY rdata (RFC 4034 §2.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dnskey {
    pub flags: u16,
    pub protocol: u8,
    pub algorithm: u8,
    pub public_key: Vec<u8>,
}

impl Dnskey {
    pub fn parse(rdata: &[u8]) -> Result<Self> {
        if rdata.len() < 5 {
            return Err(MimirError::InvalidPublicKey);
        }
        Ok(Dnskey {
            flags: u16::from_be_bytes([rdata[0], rdata[1]]),
            protocol: rdata[2],
            algorithm: rdata[3],
            public_key: rdata[4..].to_vec(),
        })
    }

    /// Zone Key flag (RFC 4034 §2.1.1).
    pub fn is_zsk(&self) -> bool {
        self.flags & 0x0100 != 0
    }

    /// Secure Entry Point flag.
    pub fn is_ksk(&self) -> bool {
        self.flags & 0x0001 != 0
    }

    /// REVOKE flag (RFC 5011).
    pub fn is_revoked(&self) -> bool {
        self.flags & 0x0080 != 0
    }

    pub fn key_tag(&self) -> u16 {
        crate::dnssec::key_tag::calculate_key_tag(
            self.flags,
            self.protocol,
            self.algorithm,
            &self.public_key,
        )
    }
}

/// Parsed DS rdata (RFC 4034 §5.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ds {
    pub key_tag: u16,
    pub algorithm: u8,
    pub digest_type: u8,
    pub digest: Vec<u8>,
}

impl Ds {
    pub fn parse(rdata: &[u8]) -> Result<Self> {
        if rdata.len() < 5 {
            return Err(MimirError::ParseError("DS rdata too short".into()));
        }
        Ok(Ds {
            key_tag: u16::from_be_bytes([rdata[0], rdata[1]]),
            algorithm: rdata[2],
            digest_type: rdata[3],
            digest: rdata[4..].to_vec(),
        })
    }
}

/// Parsed NSEC rdata (RFC 4034 §4.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nsec {
    pub next: Name,
    pub type_bitmap: Vec<u8>,
}

impl Nsec {
    pub fn parse(rdata: &[u8]) -> Result<Self> {
        let (next, offset) = Name::parse(rdata, 0)?;
        Ok(Nsec {
            next,
            type_bitmap: rdata[offset..].to_vec(),
        })
    }

    pub fn has_type(&self, rtype: RecordType) -> bool {
        type_bitmap_contains(&self.type_bitmap, u16::from(rtype))
    }
}

/// Parsed NSEC3 rdata (RFC 5155 §3.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nsec3 {
    pub hash_algorithm: u8,
    pub flags: u8,
    pub iterations: u16,
    pub salt: Vec<u8>,
    pub next_hashed: Vec<u8>,
    pub type_bitmap: Vec<u8>,
}

impl Nsec3 {
    pub fn parse(rdata: &[u8]) -> Result<Self> {
        if rdata.len() < 5 {
            return Err(MimirError::InvalidNsec3Parameters);
        }
        let salt_len = rdata[4] as usize;
        let hash_off = 5 + salt_len;
        if hash_off + 1 > rdata.len() {
            return Err(MimirError::InvalidNsec3Parameters);
        }
        let hash_len = rdata[hash_off] as usize;
        let bitmap_off = hash_off + 1 + hash_len;
        if bitmap_off > rdata.len() {
            return Err(MimirError::InvalidNsec3Parameters);
        }
        Ok(Nsec3 {
            hash_algorithm: rdata[0],
            flags: rdata[1],
            iterations: u16::from_be_bytes([rdata[2], rdata[3]]),
            salt: rdata[5..5 + salt_len].to_vec(),
            next_hashed: rdata[hash_off + 1..bitmap_off].to_vec(),
            type_bitmap: rdata[bitmap_off..].to_vec(),
        })
    }

    pub fn has_type(&self, rtype: RecordType) -> bool {
        type_bitmap_contains(&self.type_bitmap, u16::from(rtype))
    }

    /// Opt-Out flag: the range may skip unsigned delegations.
    pub fn opt_out(&self) -> bool {
        self.flags & 0x01 != 0
    }
}

/// Test membership in an NSEC/NSEC3 windowed type bitmap (RFC 4034 §4.1.2).
pub fn type_bitmap_contains(bitmap: &[u8], rtype: u16) -> bool {
    let window = (rtype >> 8) as u8;
    let bit = (rtype & 0xFF) as usize;
    let mut pos = 0;
    while pos + 2 <= bitmap.len() {
        let win = bitmap[pos];
        let len = bitmap[pos + 1] as usize;
        pos += 2;
        if pos + len > bitmap.len() {
            return false;
        }
        if win == window {
            let byte = bit / 8;
            if byte >= len {
                return false;
            }
            return bitmap[pos + byte] & (0x80 >> (bit % 8)) != 0;
        }
        pos += len;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rrsig_field_parse() {
        let signer: Name = "example.com".parse().unwrap();
        let mut rdata = Vec::new();
        rdata.extend_from_slice(&1u16.to_be_bytes()); // covers A
        rdata.push(8); // RSASHA256
        rdata.push(2);
        rdata.extend_from_slice(&3600u32.to_be_bytes());
        rdata.extend_from_slice(&1700003600u32.to_be_bytes());
        rdata.extend_from_slice(&1700000000u32.to_be_bytes());
        rdata.extend_from_slice(&20326u16.to_be_bytes());
        rdata.extend_from_slice(signer.as_wire());
        rdata.extend_from_slice(&[0xAA; 16]);
        let rrsig = Rrsig::parse(&rdata).unwrap();
        assert_eq!(rrsig.type_covered, RecordType::A);
        assert_eq!(rrsig.labels, 2);
        assert_eq!(rrsig.key_tag, 20326);
        assert_eq!(rrsig.signer, signer);
        assert_eq!(rrsig.signature.len(), 16);
    }

    #[test]
    fn dnskey_flag_bits() {
        let mut rdata = vec![0x01, 0x01, 3, 8];
        rdata.extend_from_slice(&[1, 2, 3]);
        let key = Dnskey::parse(&rdata).unwrap();
        assert!(key.is_zsk());
        assert!(key.is_ksk());
        assert!(!key.is_revoked());

        let revoked = Dnskey::parse(&[0x01, 0x81, 3, 8, 0]).unwrap();
        assert!(revoked.is_revoked());
    }

    #[test]
    fn type_bitmap_lookup() {
        // window 0, bitmap covering A (1) and NS (2): bits 1 and 2 of byte 0
        let bitmap = vec![0, 1, 0b0110_0000];
        assert!(type_bitmap_contains(&bitmap, 1));
        assert!(type_bitmap_contains(&bitmap, 2));
        assert!(!type_bitmap_contains(&bitmap, 5));
        assert!(!type_bitmap_contains(&bitmap, 256));
    }

    #[test]
    fn nsec3_rdata_parse() {
        // alg 1, opt-out, 2 iterations, 2-byte salt, 4-byte hash, bitmap
        let rdata = vec![
            1, 1, 0, 2, 2, 0xAA, 0xBB, 4, 1, 2, 3, 4, 0, 1, 0b0010_0000,
        ];
        let nsec3 = Nsec3::parse(&rdata).unwrap();
        assert!(nsec3.opt_out());
        assert_eq!(nsec3.iterations, 2);
        assert_eq!(nsec3.salt, vec![0xAA, 0xBB]);
        assert_eq!(nsec3.next_hashed, vec![1, 2, 3, 4]);
        assert!(nsec3.has_type(RecordType::Ns));
        assert!(!nsec3.has_type(RecordType::Ds));
    }

    #[test]
    fn compressed_rdata_expanded() {
        // Packet-like buffer: name "ns.example" at offset 0, then an NS
        // record whose rdata is a pointer to it.
        let mut buf = Vec::new();
        let target: Name = "ns.example".parse().unwrap();
        buf.extend_from_slice(target.as_wire());
        let record_start = buf.len();
        let owner: Name = "example".parse().unwrap();
        buf.extend_from_slice(owner.as_wire());
        buf.extend_from_slice(&2u16.to_be_bytes()); // NS
        buf.extend_from_slice(&1u16.to_be_bytes()); // IN
        buf.extend_from_slice(&300u32.to_be_bytes());
        buf.extend_from_slice(&2u16.to_be_bytes()); // rdlen: one pointer
        buf.extend_from_slice(&[0xC0, 0x00]);
        let (record, _) = DnsRecord::parse(&buf, record_start).unwrap();
        assert_eq!(record.rdata_name().unwrap(), target);
    }
}
