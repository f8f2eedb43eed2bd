use super::constants::MAX_NSEC3_ITERATIONS;
use crate::dns::enums::{RecordType, ResponseCode};
use crate::dns::packet::{DnsPacket, Section};
use crate::dns::record::{DnsRecord, Nsec, Nsec3};
use crate::dns::Name;
use crate::error::{MimirError, Result};
use ring::digest;
use tracing::{debug, trace};

/// Whether `name` falls strictly inside the canonical interval
/// (`owner`, `next`), honoring the wrap-around at the zone apex.
pub fn nsec_covers(owner: &Name, next: &Name, name: &Name) -> bool {
    use std::cmp::Ordering::*;
    let after_owner = owner.canonical_cmp(name) == Less;
    if next.canonical_cmp(owner) != Greater {
        // last NSEC in the zone: the interval wraps
        after_owner || name.canonical_cmp(next) == Less
    } else {
        after_owner && name.canonical_cmp(next) == Less
    }
}

fn nsec_records(pkt: &DnsPacket, section: Section) -> impl Iterator<Item = (&DnsRecord, Nsec)> {
    pkt.section(section)
        .iter()
        .filter(|rr| rr.rtype == RecordType::Nsec)
        .filter_map(|rr| rr.as_nsec().ok().map(|nsec| (rr, nsec)))
}

fn nsec3_records(pkt: &DnsPacket, section: Section) -> impl Iterator<Item = (&DnsRecord, Nsec3)> {
    pkt.section(section)
        .iter()
        .filter(|rr| rr.rtype == RecordType::Nsec3)
        .filter_map(|rr| rr.as_nsec3().ok().map(|nsec3| (rr, nsec3)))
}

/// Whether the section carries NSEC3 records, which selects the proof style.
pub fn has_nsec3(pkt: &DnsPacket, section: Section) -> bool {
    nsec3_records(pkt, section).next().is_some()
}

/// The longest common label suffix of two names.
fn common_ancestor(a: &Name, b: &Name) -> Name {
    let mut shared = 0;
    let la: Vec<&[u8]> = a.labels().collect();
    let lb: Vec<&[u8]> = b.labels().collect();
    for (x, y) in la.iter().rev().zip(lb.iter().rev()) {
        if x.eq_ignore_ascii_case(y) {
            shared += 1;
        } else {
            break;
        }
    }
    a.suffix(shared)
}

/// NSEC proof that `qname` does not exist: a covering NSEC for the name and
/// one for the wildcard at its closest encloser (RFC 4035 §3.1.3.2).
pub fn nsec_name_error_proof(pkt: &DnsPacket, section: Section, qname: &Name) -> Result<()> {
    let mut encloser = None;
    for (rr, nsec) in nsec_records(pkt, section) {
        if nsec_covers(&rr.name, &nsec.next, qname) {
            encloser = Some(common_ancestor(&rr.name, qname));
            break;
        }
    }
    let encloser = encloser.ok_or(MimirError::DenialOfExistenceFailed)?;
    let wildcard = encloser.to_wildcard()?;
    for (rr, nsec) in nsec_records(pkt, section) {
        if nsec_covers(&rr.name, &nsec.next, &wildcard) {
            debug!("NSEC proves {} does not exist", qname);
            return Ok(());
        }
    }
    trace!("no NSEC covers the wildcard {}", wildcard);
    Err(MimirError::DenialOfExistenceFailed)
}

/// NSEC proof that `qname` exists but has no `qtype` data.
pub fn nsec_no_data_proof(
    pkt: &DnsPacket,
    section: Section,
    qname: &Name,
    qtype: RecordType,
) -> Result<()> {
    for (rr, nsec) in nsec_records(pkt, section) {
        if rr.name == *qname && !nsec.has_type(qtype) && !nsec.has_type(RecordType::Cname) {
            debug!("NSEC proves no {} data at {}", qtype, qname);
            return Ok(());
        }
        // wildcard no-data: the matching wildcard lacks the type
        if rr.name.is_wildcard()
            && qname.ends_with(&rr.name.parent().expect("wildcard has a parent"))
            && !nsec.has_type(qtype)
            && !nsec.has_type(RecordType::Cname)
        {
            return Ok(());
        }
    }
    Err(MimirError::DenialOfExistenceFailed)
}

/// After a wildcard-expanded answer, require an NSEC showing no closer match
/// for the query name existed.
pub fn nsec_wildcard_answer_check(pkt: &DnsPacket, section: Section, sname: &Name) -> Result<()> {
    for (rr, nsec) in nsec_records(pkt, section) {
        if nsec_covers(&rr.name, &nsec.next, sname) {
            return Ok(());
        }
    }
    Err(MimirError::DenialOfExistenceFailed)
}

/// NSEC3 hash of a name: iterated SHA-1 over the lowercased wire form and
/// salt (RFC 5155 §5). Iteration counts over the cap are refused outright.
pub fn nsec3_hash(name: &Name, salt: &[u8], iterations: u16) -> Result<Vec<u8>> {
    if iterations > MAX_NSEC3_ITERATIONS {
        return Err(MimirError::TooManyIterations);
    }
    let mut input = name.to_lowercase_wire();
    input.extend_from_slice(salt);
    let mut hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &input)
        .as_ref()
        .to_vec();
    for _ in 0..iterations {
        let mut next = hash;
        next.extend_from_slice(salt);
        hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &next)
            .as_ref()
            .to_vec();
    }
    Ok(hash)
}

/// Decode the base32hex hash from an NSEC3 owner's first label.
fn nsec3_owner_hash(owner: &Name) -> Option<Vec<u8>> {
    let label = owner.labels().next()?;
    let text = std::str::from_utf8(label).ok()?.to_ascii_uppercase();
    base32::decode(base32::Alphabet::Rfc4648Hex { padding: false }, &text)
}

fn nsec3_interval_covers(owner_hash: &[u8], next_hash: &[u8], hash: &[u8]) -> bool {
    if next_hash <= owner_hash {
        hash > owner_hash || hash < next_hash
    } else {
        hash > owner_hash && hash < next_hash
    }
}

/// Find an NSEC3 whose owner hash equals H(`name`); returns its rdata.
fn nsec3_matching<'a>(
    pkt: &'a DnsPacket,
    section: Section,
    name: &Name,
) -> Result<Option<(&'a DnsRecord, Nsec3)>> {
    for (rr, nsec3) in nsec3_records(pkt, section) {
        if nsec3.hash_algorithm != 1 {
            continue;
        }
        let hash = nsec3_hash(name, &nsec3.salt, nsec3.iterations)?;
        if nsec3_owner_hash(&rr.name).as_deref() == Some(&hash) {
            return Ok(Some((rr, nsec3)));
        }
    }
    Ok(None)
}

/// Find an NSEC3 whose interval covers H(`name`).
fn nsec3_covering(pkt: &DnsPacket, section: Section, name: &Name) -> Result<bool> {
    for (rr, nsec3) in nsec3_records(pkt, section) {
        if nsec3.hash_algorithm != 1 {
            continue;
        }
        let hash = nsec3_hash(name, &nsec3.salt, nsec3.iterations)?;
        if let Some(owner_hash) = nsec3_owner_hash(&rr.name) {
            if nsec3_interval_covers(&owner_hash, &nsec3.next_hashed, &hash) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// NSEC3 name-error proof (RFC 5155 §8.4): a matching NSEC3 for the closest
/// encloser, a covering one for the next-closer name, and a covering one for
/// the wildcard at the encloser.
pub fn nsec3_name_error_proof(pkt: &DnsPacket, section: Section, qname: &Name) -> Result<()> {
    let qname_labels = qname.label_count();
    for depth in (0..qname_labels).rev() {
        let candidate = qname.suffix(depth);
        if nsec3_matching(pkt, section, &candidate)?.is_none() {
            continue;
        }
        // candidate is the closest encloser
        let next_closer = qname.suffix(depth + 1);
        if !nsec3_covering(pkt, section, &next_closer)? {
            return Err(MimirError::DenialOfExistenceFailed);
        }
        let wildcard = candidate.to_wildcard()?;
        if !nsec3_covering(pkt, section, &wildcard)? {
            return Err(MimirError::DenialOfExistenceFailed);
        }
        debug!("NSEC3 proves {} does not exist", qname);
        return Ok(());
    }
    Err(MimirError::DenialOfExistenceFailed)
}

/// NSEC3 no-data proof: a matching NSEC3 for `qname` whose bitmap lacks the
/// type (and CNAME).
pub fn nsec3_no_data_proof(
    pkt: &DnsPacket,
    section: Section,
    qname: &Name,
    qtype: RecordType,
) -> Result<()> {
    if let Some((_, nsec3)) = nsec3_matching(pkt, section, qname)? {
        if !nsec3.has_type(qtype) && !nsec3.has_type(RecordType::Cname) {
            return Ok(());
        }
    }
    Err(MimirError::DenialOfExistenceFailed)
}

/// After a wildcard-expanded answer, require an NSEC3 covering the
/// next-closer name derived from the expansion depth: `trim` is the label
/// count difference recorded at signature check time, so the next-closer
/// name keeps `trim - 1` fewer labels than the expanded owner.
pub fn nsec3_wildcard_answer_check(
    pkt: &DnsPacket,
    section: Section,
    sname: &Name,
    trim: usize,
) -> Result<()> {
    if trim < 1 {
        return Err(MimirError::InvalidArgument("wildcard trim must be >= 1"));
    }
    let next_closer = sname.suffix(sname.label_count() - (trim - 1));
    if nsec3_covering(pkt, section, &next_closer)? {
        Ok(())
    } else {
        Err(MimirError::DenialOfExistenceFailed)
    }
}

/// Validate the denial carried by a negative response, picking NSEC or NSEC3
/// from what the authority section offers.
pub fn validate_denial(pkt: &DnsPacket, qname: &Name, qtype: RecordType) -> Result<()> {
    let name_error = pkt.header.response_code() == ResponseCode::NameError;
    if has_nsec3(pkt, Section::Authority) {
        if name_error {
            nsec3_name_error_proof(pkt, Section::Authority, qname)
        } else {
            nsec3_no_data_proof(pkt, Section::Authority, qname, qtype)
        }
    } else if name_error {
        nsec_name_error_proof(pkt, Section::Authority, qname)
    } else {
        nsec_no_data_proof(pkt, Section::Authority, qname, qtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::enums::RecordClass;
    use crate::dns::header::DnsHeader;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    fn nsec_record(owner: &str, next: &str, types: &[RecordType]) -> DnsRecord {
        let next: Name = next.parse().unwrap();
        let mut rdata = next.as_wire().to_vec();
        // single window-0 bitmap
        let mut bits = [0u8; 32];
        let mut max_byte = 0;
        for &t in types {
            let v = u16::from(t);
            assert!(v < 256);
            let byte = (v / 8) as usize;
            bits[byte] |= 0x80 >> (v % 8);
            max_byte = max_byte.max(byte);
        }
        rdata.push(0);
        rdata.push(max_byte as u8 + 1);
        rdata.extend_from_slice(&bits[..=max_byte]);
        DnsRecord::new(owner.parse().unwrap(), RecordType::Nsec, RecordClass::In, 300, rdata)
    }

    #[test]
    fn covers_with_and_without_wraparound() {
        assert!(nsec_covers(
            &name("a.example"),
            &name("c.example"),
            &name("b.example")
        ));
        assert!(!nsec_covers(
            &name("a.example"),
            &name("c.example"),
            &name("d.example")
        ));
        // owner itself is never covered
        assert!(!nsec_covers(
            &name("a.example"),
            &name("c.example"),
            &name("a.example")
        ));
        // wrap-around at the apex
        assert!(nsec_covers(
            &name("x.example"),
            &name("example"),
            &name("z.example")
        ));
    }

    fn negative_packet(rcode: ResponseCode, authorities: Vec<DnsRecord>) -> DnsPacket {
        let mut pkt = DnsPacket::new(DnsHeader::default());
        pkt.header.set_response_code(rcode);
        pkt.authorities = authorities;
        pkt
    }

    #[test]
    fn nsec_nxdomain_proof() {
        // a.example and m.example exist; query b.example
        let pkt = negative_packet(
            ResponseCode::NameError,
            vec![
                nsec_record("a.example", "m.example", &[RecordType::A]),
                // wildcard *.example is also absent: it sorts between the
                // apex and a.example, so this range covers it
                nsec_record("example", "a.example", &[RecordType::Soa]),
            ],
        );
        assert!(nsec_name_error_proof(&pkt, Section::Authority, &name("b.example")).is_ok());
        assert!(validate_denial(&pkt, &name("b.example"), RecordType::A).is_ok());
        // a name past the covering ranges fails
        assert!(
            nsec_name_error_proof(&pkt, Section::Authority, &name("a.example")).is_err()
        );
    }

    #[test]
    fn nsec_no_data_proof_checks_bitmap() {
        let pkt = negative_packet(
            ResponseCode::NoError,
            vec![nsec_record("a.example", "b.example", &[RecordType::A, RecordType::Ns])],
        );
        assert!(nsec_no_data_proof(&pkt, Section::Authority, &name("a.example"), RecordType::Aaaa).is_ok());
        assert!(nsec_no_data_proof(&pkt, Section::Authority, &name("a.example"), RecordType::A).is_err());
    }

    #[test]
    fn nsec3_hash_changes_with_salt_and_iterations() {
        let n = name("example.com");
        let h0 = nsec3_hash(&n, &[], 0).unwrap();
        let h1 = nsec3_hash(&n, &[0xAA, 0xBB], 0).unwrap();
        let h2 = nsec3_hash(&n, &[], 5).unwrap();
        assert_eq!(h0.len(), 20);
        assert_ne!(h0, h1);
        assert_ne!(h0, h2);
        assert!(matches!(
            nsec3_hash(&n, &[], MAX_NSEC3_ITERATIONS + 1),
            Err(MimirError::TooManyIterations)
        ));
    }

    #[test]
    fn nsec3_rfc5155_appendix_vector() {
        // H(example) with salt aabbccdd, 12 iterations, from RFC 5155 App. A
        let hash = nsec3_hash(&name("example"), &hex::decode("aabbccdd").unwrap(), 12).unwrap();
        let label = base32::encode(base32::Alphabet::Rfc4648Hex { padding: false }, &hash)
            .to_ascii_lowercase();
        assert_eq!(label, "0p9mhaveqvm6t7vbl5lop2u3t2rp3tom");
    }
}
