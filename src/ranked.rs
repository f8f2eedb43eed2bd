use crate::dns::packet::Section;
use crate::dns::rrset::{RrKey, RrSet};

/// Credibility rank of a stashed RR set. Higher ranks replace lower ones;
/// the order is total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Rank {
    /// Freshly created, nothing known.
    Initial,
    /// Known but not worth the wire or the cache.
    Omit,
    /// Usable answer data, not yet validated.
    Try,
    /// Validation ran and the zone is provably unsigned.
    Insecure,
    /// Validated against the chain of trust.
    Secure,
    /// Validation ran and failed.
    Bogus,
    /// Contradicts something already validated.
    Mismatch,
}

impl Rank {
    pub fn to_u8(self) -> u8 {
        match self {
            Rank::Initial => 0,
            Rank::Omit => 1,
            Rank::Try => 2,
            Rank::Insecure => 3,
            Rank::Secure => 4,
            Rank::Bogus => 5,
            Rank::Mismatch => 6,
        }
    }

    pub fn from_u8(value: u8) -> Option<Rank> {
        Some(match value {
            0 => Rank::Initial,
            1 => Rank::Omit,
            2 => Rank::Try,
            3 => Rank::Insecure,
            4 => Rank::Secure,
            5 => Rank::Bogus,
            6 => Rank::Mismatch,
            _ => return None,
        })
    }
}

/// One accumulated RR set, owned by the query that produced it.
#[derive(Debug, Clone)]
pub struct RankedEntry {
    pub rrset: RrSet,
    pub rank: Rank,
    pub qry_uid: u32,
    /// Where the set goes in the final answer.
    pub section: Section,
    pub cached: bool,
    pub yielded: bool,
    pub to_wire: bool,
    pub revalidation_count: u16,
}

impl RankedEntry {
    pub fn key(&self) -> RrKey {
        self.rrset.key()
    }
}

/// Deduplicated, ranked RR sets collected over one request, destined for
/// final answer assembly.
#[derive(Debug, Default)]
pub struct RankedRrArray {
    entries: Vec<RankedEntry>,
}

impl RankedRrArray {
    pub fn new() -> Self {
        RankedRrArray::default()
    }

    pub fn entries(&self) -> &[RankedEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add an RR set for `qry_uid`. If the query already stashed a set of
    /// the same identity the rdata is merged and the rank raised
    /// monotonically; otherwise a new entry is appended. Either way the
    /// to-wire uniqueness invariant is restored before returning.
    pub fn add(
        &mut self,
        rrset: RrSet,
        rank: Rank,
        to_wire: bool,
        qry_uid: u32,
        section: Section,
    ) {
        let key = rrset.key();
        // scan backwards only within this query's run of entries
        for i in (0..self.entries.len()).rev() {
            let entry = &mut self.entries[i];
            if entry.yielded || entry.qry_uid != qry_uid {
                break;
            }
            if entry.key() != key {
                continue;
            }
            entry.rrset.merge(&rrset);
            entry.rank = entry.rank.max(rank);
            // glue may become answer data later, never the reverse
            entry.to_wire = entry.to_wire || to_wire;
            let index = i;
            self.ensure_wire_unique(index);
            return;
        }

        self.entries.push(RankedEntry {
            rrset,
            rank,
            qry_uid,
            section,
            cached: false,
            yielded: false,
            to_wire,
            revalidation_count: 0,
        });
        self.ensure_wire_unique(self.entries.len() - 1);
    }

    /// Clear `to_wire` on entries of *other* queries that would render the
    /// same RR set, keeping at most one wire copy per identity.
    fn ensure_wire_unique(&mut self, index: usize) {
        if !self.entries[index].to_wire {
            return;
        }
        let key = self.entries[index].key();
        let uid = self.entries[index].qry_uid;
        for (i, entry) in self.entries.iter_mut().enumerate().rev() {
            if i == index || entry.qry_uid == uid || !entry.to_wire {
                continue;
            }
            if entry.key() == key {
                entry.to_wire = false;
            }
        }
    }

    /// Bulk-toggle `to_wire` for one query's entries, optionally filtered by
    /// `extra_check`, re-establishing uniqueness when switching on.
    pub fn set_wire(
        &mut self,
        qry_uid: u32,
        to_wire: bool,
        check_dups: bool,
        extra_check: Option<&dyn Fn(&RankedEntry) -> bool>,
    ) {
        for i in 0..self.entries.len() {
            if self.entries[i].qry_uid != qry_uid {
                continue;
            }
            if let Some(check) = extra_check {
                if !check(&self.entries[i]) {
                    continue;
                }
            }
            self.entries[i].to_wire = to_wire;
            if check_dups {
                self.ensure_wire_unique(i);
            }
        }
    }

    pub fn entries_for(&self, qry_uid: u32) -> impl Iterator<Item = &RankedEntry> {
        self.entries.iter().filter(move |e| e.qry_uid == qry_uid)
    }

    pub fn entries_for_mut(&mut self, qry_uid: u32) -> impl Iterator<Item = &mut RankedEntry> {
        self.entries.iter_mut().filter(move |e| e.qry_uid == qry_uid)
    }

    /// Entries destined for the final answer.
    pub fn wire_entries(&self) -> impl Iterator<Item = &RankedEntry> {
        self.entries.iter().filter(|e| e.to_wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::enums::{RecordClass, RecordType};

    fn set(owner: &str, rtype: RecordType, rdata: &[u8]) -> RrSet {
        RrSet {
            owner: owner.parse().unwrap(),
            rtype,
            rclass: RecordClass::In,
            ttl: 300,
            rdatas: vec![rdata.to_vec()],
        }
    }

    #[test]
    fn merge_within_query_raises_rank() {
        let mut array = RankedRrArray::new();
        array.add(set("a.example", RecordType::A, &[1, 1, 1, 1]), Rank::Try, true, 1, Section::Answer);
        array.add(
            set("a.example", RecordType::A, &[2, 2, 2, 2]),
            Rank::Secure,
            false,
            1,
            Section::Answer,
        );
        assert_eq!(array.len(), 1);
        let entry = &array.entries()[0];
        assert_eq!(entry.rrset.rdatas.len(), 2);
        assert_eq!(entry.rank, Rank::Secure);
        // once marked for the wire, merging keeps it there
        assert!(entry.to_wire);
    }

    #[test]
    fn rank_never_lowers_on_merge() {
        let mut array = RankedRrArray::new();
        array.add(set("a.example", RecordType::A, &[1, 1, 1, 1]), Rank::Secure, true, 1, Section::Answer);
        array.add(set("a.example", RecordType::A, &[1, 1, 1, 1]), Rank::Try, true, 1, Section::Answer);
        assert_eq!(array.entries()[0].rank, Rank::Secure);
    }

    #[test]
    fn wire_uniqueness_across_queries() {
        let mut array = RankedRrArray::new();
        array.add(set("a.example", RecordType::A, &[1, 1, 1, 1]), Rank::Try, true, 1, Section::Answer);
        // a later query stashes the same set for the wire
        array.add(set("A.EXAMPLE", RecordType::A, &[1, 1, 1, 1]), Rank::Try, true, 2, Section::Answer);
        let wired: Vec<u32> = array.wire_entries().map(|e| e.qry_uid).collect();
        assert_eq!(wired, vec![2]);

        // invariant: at most one to_wire entry per identity
        let mut seen = std::collections::HashSet::new();
        for entry in array.wire_entries() {
            assert!(seen.insert(entry.key()));
        }
    }

    #[test]
    fn different_queries_do_not_merge() {
        let mut array = RankedRrArray::new();
        array.add(set("a.example", RecordType::A, &[1, 1, 1, 1]), Rank::Try, false, 1, Section::Answer);
        array.add(set("a.example", RecordType::A, &[2, 2, 2, 2]), Rank::Try, false, 2, Section::Answer);
        assert_eq!(array.len(), 2);
        assert_eq!(array.entries_for(1).count(), 1);
        assert_eq!(array.entries_for(2).count(), 1);
    }

    #[test]
    fn set_wire_with_predicate() {
        let mut array = RankedRrArray::new();
        array.add(set("a.example", RecordType::A, &[1, 1, 1, 1]), Rank::Try, false, 1, Section::Answer);
        array.add(set("a.example", RecordType::Ns, &[0]), Rank::Try, false, 1, Section::Authority);
        array.set_wire(
            1,
            true,
            true,
            Some(&|entry: &RankedEntry| entry.rrset.rtype == RecordType::A),
        );
        let wired: Vec<RecordType> = array.wire_entries().map(|e| e.rrset.rtype).collect();
        assert_eq!(wired, vec![RecordType::A]);
    }

    #[test]
    fn rrsig_identity_includes_covered_type() {
        let mut sig_a = vec![0u8, 1];
        sig_a.extend_from_slice(&[0; 16]);
        let mut sig_ns = vec![0u8, 2];
        sig_ns.extend_from_slice(&[0; 16]);
        let mut array = RankedRrArray::new();
        array.add(set("a.example", RecordType::Rrsig, &sig_a), Rank::Try, true, 1, Section::Answer);
        array.add(set("a.example", RecordType::Rrsig, &sig_ns), Rank::Try, true, 1, Section::Answer);
        // different covered types: both stay, both may go to the wire
        assert_eq!(array.len(), 2);
        assert_eq!(array.wire_entries().count(), 2);
    }
}
