use crate::error::{MimirError, Result};
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Maximum length of an uncompressed name in wire form.
pub const MAX_NAME_LEN: usize = 255;
/// Maximum length of a single label.
pub const MAX_LABEL_LEN: usize = 63;
/// Upper bound on compression pointer chains while parsing.
const MAX_POINTER_JUMPS: usize = 16;

/// A DNS domain name held in uncompressed wire form.
///
/// Equality and hashing are label-wise case-insensitive; ordering is the
/// DNSSEC canonical order of RFC 4034 §6.1. The original spelling is kept so
/// responses echo the case the client sent.
#[derive(Clone)]
pub struct Name {
    wire: Vec<u8>,
}

impl Name {
    /// The root name.
    pub fn root() -> Self {
        Name { wire: vec![0] }
    }

    /// Parse a name out of a packet buffer, following compression pointers.
    ///
    /// Pointers must target an offset strictly before the pointer itself and
    /// chains are bounded, so malformed loops are rejected rather than
    /// followed. Returns the name and the offset just past its encoding.
    pub fn parse(data: &[u8], start: usize) -> Result<(Self, usize)> {
        let mut wire = Vec::with_capacity(32);
        let mut offset = start;
        let mut jumps = 0usize;
        let mut end_after_first_pointer = None;

        loop {
            let len = *data.get(offset).ok_or(MimirError::UnexpectedEnd)? as usize;

            if len & 0xC0 == 0xC0 {
                let second = *data.get(offset + 1).ok_or(MimirError::UnexpectedEnd)?;
                let target = ((len & 0x3F) << 8) | second as usize;
                // A pointer may only refer backwards into the packet.
                if target >= offset {
                    return Err(MimirError::InvalidPointer);
                }
                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return Err(MimirError::InvalidPointer);
                }
                if end_after_first_pointer.is_none() {
                    end_after_first_pointer = Some(offset + 2);
                }
                offset = target;
                continue;
            }

            if len & 0xC0 != 0 {
                return Err(MimirError::InvalidLabel);
            }

            if len == 0 {
                wire.push(0);
                let end = end_after_first_pointer.unwrap_or(offset + 1);
                if wire.len() > MAX_NAME_LEN {
                    return Err(MimirError::InvalidLabel);
                }
                return Ok((Name { wire }, end));
            }

            if len > MAX_LABEL_LEN {
                return Err(MimirError::InvalidLabel);
            }
            let label_end = offset + 1 + len;
            if label_end > data.len() {
                return Err(MimirError::UnexpectedEnd);
            }
            wire.push(len as u8);
            wire.extend_from_slice(&data[offset + 1..label_end]);
            if wire.len() + 1 > MAX_NAME_LEN {
                return Err(MimirError::InvalidLabel);
            }
            offset = label_end;
        }
    }

    /// Uncompressed wire form, including the terminating zero label.
    pub fn as_wire(&self) -> &[u8] {
        &self.wire
    }

    /// Wire form with every label lowercased; used for cache keys and
    /// canonical signing input.
    pub fn to_lowercase_wire(&self) -> Vec<u8> {
        self.wire.to_ascii_lowercase()
    }

    /// Iterate over the labels, root excluded.
    pub fn labels(&self) -> LabelIter<'_> {
        LabelIter {
            wire: &self.wire,
            offset: 0,
        }
    }

    /// Number of labels, root excluded.
    pub fn label_count(&self) -> usize {
        self.labels().count()
    }

    /// Label count for RRSIG purposes: the `*` label of a wildcard owner
    /// does not count (RFC 4034 §3.1.3).
    pub fn rrsig_label_count(&self) -> usize {
        let count = self.label_count();
        if self.is_wildcard() { count - 1 } else { count }
    }

    pub fn is_root(&self) -> bool {
        self.wire == [0]
    }

    /// Whether the leftmost label is the `*` wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.wire.len() >= 2 && self.wire[0] == 1 && self.wire[1] == b'*'
    }

    /// The name with its leftmost label removed; `None` for the root.
    pub fn parent(&self) -> Option<Name> {
        if self.is_root() {
            return None;
        }
        let skip = 1 + self.wire[0] as usize;
        Some(Name {
            wire: self.wire[skip..].to_vec(),
        })
    }

    /// The rightmost `count` labels of this name.
    pub fn suffix(&self, count: usize) -> Name {
        let total = self.label_count();
        let mut name = self.clone();
        for _ in count..total {
            name = name.parent().expect("suffix shorter than name");
        }
        name
    }

    /// A wildcard owner one label below this name (`*.<self>`).
    pub fn to_wildcard(&self) -> Result<Name> {
        let mut wire = Vec::with_capacity(self.wire.len() + 2);
        wire.push(1);
        wire.push(b'*');
        wire.extend_from_slice(&self.wire);
        if wire.len() > MAX_NAME_LEN {
            return Err(MimirError::InvalidLabel);
        }
        Ok(Name { wire })
    }

    /// Case-insensitive suffix test; a name ends with itself.
    pub fn ends_with(&self, suffix: &Name) -> bool {
        let n = self.label_count();
        let m = suffix.label_count();
        if m > n {
            return false;
        }
        self.suffix(m) == *suffix
    }

    /// Rewrite `self` by swapping the suffix `old` for `new`; used for DNAME
    /// substitution. Fails when `self` is not below `old` or the result
    /// overflows the name length limit.
    pub fn replace_suffix(&self, old: &Name, new: &Name) -> Result<Name> {
        if !self.ends_with(old) {
            return Err(MimirError::InvalidArgument("name not below DNAME owner"));
        }
        let keep = self.label_count() - old.label_count();
        let mut wire = Vec::new();
        for (i, label) in self.labels().enumerate() {
            if i >= keep {
                break;
            }
            wire.push(label.len() as u8);
            wire.extend_from_slice(label);
        }
        wire.extend_from_slice(&new.wire);
        if wire.len() > MAX_NAME_LEN {
            return Err(MimirError::InvalidLabel);
        }
        Ok(Name { wire })
    }

    /// Canonical DNSSEC ordering (RFC 4034 §6.1): compare label sequences
    /// right to left, each label as a lowercased byte string.
    pub fn canonical_cmp(&self, other: &Name) -> Ordering {
        let a: SmallVec<[&[u8]; 8]> = self.labels().collect();
        let b: SmallVec<[&[u8]; 8]> = other.labels().collect();
        for (la, lb) in a.iter().rev().zip(b.iter().rev()) {
            let la = la.to_ascii_lowercase();
            let lb = lb.to_ascii_lowercase();
            match la.cmp(&lb) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        a.len().cmp(&b.len())
    }

    /// Length-first form: labels lowercased, reversed (root end first),
    /// separated by zero bytes. Byte-wise comparison of LF forms yields the
    /// canonical order, which is what cache and proof code sorts by.
    pub fn to_lf(&self) -> Vec<u8> {
        let labels: SmallVec<[&[u8]; 8]> = self.labels().collect();
        let mut lf = Vec::with_capacity(self.wire.len());
        for (i, label) in labels.iter().rev().enumerate() {
            if i > 0 {
                lf.push(0);
            }
            lf.extend(label.iter().map(|b| b.to_ascii_lowercase()));
        }
        lf
    }

    /// Convert a length-first encoding back to a name.
    ///
    /// The final zero byte may be omitted. Any label of length zero or
    /// greater than 63 is rejected.
    pub fn from_lf(lf: &[u8]) -> Result<Name> {
        if lf.is_empty() {
            return Ok(Name::root());
        }
        let mut len = lf.len();
        if lf[len - 1] != 0 {
            len += 1; // virtual terminator
        }
        let mut wire = Vec::with_capacity(len + 1);
        let mut label_end = len - 1; // index of the zero after the current label
        loop {
            let mut i = label_end as isize - 1;
            while i >= 0 && lf[i as usize] != 0 {
                i -= 1;
            }
            let label_start = (i + 1) as usize;
            let label_len = label_end - label_start;
            if label_len == 0 || label_len > MAX_LABEL_LEN {
                return Err(MimirError::InvalidLabel);
            }
            wire.push(label_len as u8);
            wire.extend_from_slice(&lf[label_start..label_end]);
            if label_start == 0 {
                break;
            }
            label_end = label_start - 1;
        }
        wire.push(0);
        if wire.len() > MAX_NAME_LEN {
            return Err(MimirError::InvalidLabel);
        }
        Ok(Name { wire })
    }

    /// Lowercased copy.
    pub fn to_lowercase(&self) -> Name {
        Name {
            wire: self.to_lowercase_wire(),
        }
    }
}

pub struct LabelIter<'a> {
    wire: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for LabelIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let len = *self.wire.get(self.offset)? as usize;
        if len == 0 {
            return None;
        }
        let start = self.offset + 1;
        self.offset = start + len;
        Some(&self.wire[start..start + len])
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.wire.len() == other.wire.len()
            && self
                .wire
                .iter()
                .zip(other.wire.iter())
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }
}

impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in &self.wire {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl PartialOrd for Name {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Name {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical_cmp(other)
    }
}

impl FromStr for Name {
    type Err = MimirError;

    fn from_str(s: &str) -> Result<Name> {
        if s.is_empty() || s == "." {
            return Ok(Name::root());
        }
        let trimmed = s.strip_suffix('.').unwrap_or(s);
        let mut wire = Vec::with_capacity(trimmed.len() + 2);
        for label in trimmed.split('.') {
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return Err(MimirError::InvalidLabel);
            }
            wire.push(label.len() as u8);
            wire.extend_from_slice(label.as_bytes());
        }
        wire.push(0);
        if wire.len() > MAX_NAME_LEN {
            return Err(MimirError::InvalidLabel);
        }
        Ok(Name { wire })
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return write!(f, ".");
        }
        let mut first = true;
        for label in self.labels() {
            if !first {
                write!(f, ".")?;
            }
            first = false;
            for &b in label {
                if b.is_ascii_graphic() && b != b'.' && b != b'\\' {
                    write!(f, "{}", b as char)?;
                } else {
                    write!(f, "\\{:03}", b)?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    #[test]
    fn presentation_round_trip() {
        assert_eq!(name("example.com").to_string(), "example.com");
        assert_eq!(name("Example.COM."), name("example.com"));
        assert_eq!(Name::root().to_string(), ".");
    }

    #[test]
    fn label_counts() {
        assert_eq!(name("www.example.com").label_count(), 3);
        assert_eq!(Name::root().label_count(), 0);
        let wc = name("*.example.com");
        assert!(wc.is_wildcard());
        assert_eq!(wc.label_count(), 3);
        assert_eq!(wc.rrsig_label_count(), 2);
    }

    #[test]
    fn lf_round_trip_is_identity() {
        for s in ["example.com", "a.b.c.d.e", "x", "mail.sub.example.org"] {
            let n = name(s);
            assert_eq!(Name::from_lf(&n.to_lf()).unwrap(), n, "{}", s);
        }
        assert_eq!(Name::from_lf(&Name::root().to_lf()).unwrap(), Name::root());
    }

    #[test]
    fn lf_rejects_bad_labels() {
        // adjacent separators encode a zero-length label
        assert!(Name::from_lf(b"com\0\0a").is_err());
        // oversized label
        let lf = vec![b'a'; 64];
        assert!(Name::from_lf(&lf).is_err());
        let lf = vec![b'a'; 63];
        assert!(Name::from_lf(&lf).is_ok());
    }

    #[test]
    fn lf_order_matches_canonical_order() {
        let mut names = vec![name("z.example"), name("a.example"), name("example")];
        let mut by_lf = names.clone();
        names.sort();
        by_lf.sort_by(|a, b| a.to_lf().cmp(&b.to_lf()));
        assert_eq!(names, by_lf);
    }

    #[test]
    fn canonical_order_rfc4034() {
        // Ordering example from RFC 4034 §6.1
        let ordered = [
            "example",
            "a.example",
            "yljkjljk.a.example",
            "Z.a.example",
            "zABC.a.EXAMPLE",
            "z.example",
        ];
        for pair in ordered.windows(2) {
            assert_eq!(
                name(pair[0]).canonical_cmp(&name(pair[1])),
                Ordering::Less,
                "{} < {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn compression_pointer_limits() {
        // self-referential pointer
        let buf = [0xC0u8, 0x00];
        assert!(Name::parse(&buf, 0).is_err());
        // forward pointer
        let buf = [0xC0u8, 0x04, 0, 0, 1, b'a', 0];
        assert!(Name::parse(&buf, 0).is_err());
        // valid backwards pointer
        let buf = [3, b'c', b'o', b'm', 0, 1, b'a', 0xC0, 0x00];
        let (n, end) = Name::parse(&buf, 5).unwrap();
        assert_eq!(n, name("a.com"));
        assert_eq!(end, 9);
    }

    #[test]
    fn suffix_replacement() {
        let n = name("www.old.example");
        let out = n
            .replace_suffix(&name("old.example"), &name("new.example"))
            .unwrap();
        assert_eq!(out, name("www.new.example"));
        assert!(n.replace_suffix(&name("other.example"), &name("x")).is_err());
    }
}
