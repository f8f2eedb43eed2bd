use super::enums::{RecordClass, RecordType};
use super::name::Name;
use super::record::DnsRecord;

/// Identity of an RR set: (owner, class, type), extended by the covered type
/// for RRSIG so signatures over different sets never collapse into one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RrKey {
    pub owner: Vec<u8>,
    pub rclass: RecordClass,
    pub rtype: RecordType,
    pub covered: u16,
}

/// Records sharing (owner, class, type), with the minimum TTL of the members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RrSet {
    pub owner: Name,
    pub rtype: RecordType,
    pub rclass: RecordClass,
    pub ttl: u32,
    pub rdatas: Vec<Vec<u8>>,
}

impl RrSet {
    pub fn from_record(record: &DnsRecord) -> Self {
        RrSet {
            owner: record.name.clone(),
            rtype: record.rtype,
            rclass: record.rclass,
            ttl: record.ttl,
            rdatas: vec![record.rdata.clone()],
        }
    }

    /// Whether `record` belongs to this set. RRSIGs group by covered type.
    pub fn matches(&self, record: &DnsRecord) -> bool {
        if self.rtype != record.rtype || self.rclass != record.rclass {
            return false;
        }
        if self.rtype == RecordType::Rrsig {
            let covered = |rdata: &[u8]| {
                if rdata.len() >= 2 {
                    u16::from_be_bytes([rdata[0], rdata[1]])
                } else {
                    0
                }
            };
            if self.rdatas.first().map(|r| covered(r)) != Some(covered(&record.rdata)) {
                return false;
            }
        }
        self.owner == record.name
    }

    /// Add a record's rdata; duplicate rdata is dropped and the set TTL
    /// becomes the minimum seen.
    pub fn push(&mut self, record: &DnsRecord) {
        self.ttl = self.ttl.min(record.ttl);
        if !self.rdatas.iter().any(|r| r == &record.rdata) {
            self.rdatas.push(record.rdata.clone());
        }
    }

    /// Merge another set of the same identity.
    pub fn merge(&mut self, other: &RrSet) {
        self.ttl = self.ttl.min(other.ttl);
        for rdata in &other.rdatas {
            if !self.rdatas.iter().any(|r| r == rdata) {
                self.rdatas.push(rdata.clone());
            }
        }
    }

    pub fn key(&self) -> RrKey {
        let covered = if self.rtype == RecordType::Rrsig {
            self.rdatas
                .first()
                .filter(|r| r.len() >= 2)
                .map(|r| u16::from_be_bytes([r[0], r[1]]))
                .unwrap_or(0)
        } else {
            0
        };
        RrKey {
            owner: self.owner.to_lowercase_wire(),
            rclass: self.rclass,
            rtype: self.rtype,
            covered,
        }
    }

    /// Expand back into individual records.
    pub fn records(&self) -> Vec<DnsRecord> {
        self.rdatas
            .iter()
            .map(|rdata| {
                DnsRecord::new(
                    self.owner.clone(),
                    self.rtype,
                    self.rclass,
                    self.ttl,
                    rdata.clone(),
                )
            })
            .collect()
    }

    /// Canonical wire form of the set for signature input (RFC 4034 §6.3):
    /// owner lowercased (optionally re-owned for wildcard expansion), the
    /// RRSIG original TTL, and rdata sorted ascending as byte strings.
    pub fn canonical_wire(&self, owner_override: Option<&Name>, original_ttl: u32) -> Vec<u8> {
        let owner = owner_override.unwrap_or(&self.owner).to_lowercase_wire();
        let mut rdatas: Vec<&Vec<u8>> = self.rdatas.iter().collect();
        rdatas.sort();
        let mut out = Vec::new();
        for rdata in rdatas {
            out.extend_from_slice(&owner);
            out.extend_from_slice(&u16::from(self.rtype).to_be_bytes());
            out.extend_from_slice(&u16::from(self.rclass).to_be_bytes());
            out.extend_from_slice(&original_ttl.to_be_bytes());
            out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            out.extend_from_slice(rdata);
        }
        out
    }
}

/// Group a run of records into RR sets, preserving first-seen order.
pub fn group_records<'a, I: IntoIterator<Item = &'a DnsRecord>>(records: I) -> Vec<RrSet> {
    let mut sets: Vec<RrSet> = Vec::new();
    for record in records {
        if record.rtype == RecordType::Opt {
            continue;
        }
        match sets.iter_mut().find(|set| set.matches(record)) {
            Some(set) => set.push(record),
            None => sets.push(RrSet::from_record(record)),
        }
    }
    sets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(owner: &str, rtype: RecordType, ttl: u32, rdata: &[u8]) -> DnsRecord {
        DnsRecord::new(
            owner.parse().unwrap(),
            rtype,
            RecordClass::In,
            ttl,
            rdata.to_vec(),
        )
    }

    #[test]
    fn grouping_takes_minimum_ttl() {
        let records = vec![
            record("a.example", RecordType::A, 300, &[1, 2, 3, 4]),
            record("a.example", RecordType::A, 60, &[5, 6, 7, 8]),
            record("a.example", RecordType::Aaaa, 600, &[0; 16]),
        ];
        let sets = group_records(&records);
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].ttl, 60);
        assert_eq!(sets[0].rdatas.len(), 2);
    }

    #[test]
    fn rrsigs_group_by_covered_type() {
        let mut sig_a = vec![0u8, 1];
        sig_a.extend_from_slice(&[0; 20]);
        let mut sig_ns = vec![0u8, 2];
        sig_ns.extend_from_slice(&[0; 20]);
        let records = vec![
            record("a.example", RecordType::Rrsig, 300, &sig_a),
            record("a.example", RecordType::Rrsig, 300, &sig_ns),
        ];
        let sets = group_records(&records);
        assert_eq!(sets.len(), 2);
        assert_ne!(sets[0].key(), sets[1].key());
    }

    #[test]
    fn canonical_wire_sorts_rdata() {
        let records = vec![
            record("A.Example", RecordType::A, 300, &[9, 9, 9, 9]),
            record("a.example", RecordType::A, 300, &[1, 1, 1, 1]),
        ];
        let sets = group_records(&records);
        let wire = sets[0].canonical_wire(None, 600);
        let owner: Name = "a.example".parse().unwrap();
        // first record in canonical order is the 1.1.1.1 rdata
        let name_len = owner.as_wire().len();
        assert_eq!(&wire[..name_len], owner.as_wire());
        assert_eq!(&wire[name_len + 10..name_len + 14], &[1, 1, 1, 1]);
        // TTL is the override, not the set TTL
        assert_eq!(&wire[name_len + 4..name_len + 8], &600u32.to_be_bytes());
    }
}
