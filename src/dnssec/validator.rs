use super::algorithm::Algorithm;
use super::denial;
use super::trust_anchor::TrustAnchor;
use crate::dns::enums::RecordType;
use crate::dns::packet::{DnsPacket, Section};
use crate::dns::record::{Dnskey, Rrsig};
use crate::dns::rrset::RrSet;
use crate::dns::Name;
use crate::error::{MimirError, Result};
use tracing::{debug, trace};

/// Flags accumulated while checking one RRSIG.
#[derive(Debug, Clone, Copy, Default)]
struct SigCheckFlags {
    /// The RRSIG label count is lower than the owner's: the answer was
    /// synthesized from a wildcard.
    wildcard_expansion: bool,
    /// Labels removed by the expansion; meaningful only with the flag set.
    trim: usize,
}

/// Check one RRSIG against the covered set and a candidate key, per the
/// bullet list of RFC 4035 §5.3.1. Signature bytes are not touched here.
fn check_rrsig_rr(
    flags: &mut SigCheckFlags,
    covered: &RrSet,
    rrsig_owner: &Name,
    rrsig: &Rrsig,
    key_owner: &Name,
    key: &Dnskey,
    zone_name: &Name,
    now: u32,
) -> Result<()> {
    // bullet 1: same class and owner
    if covered.owner != *rrsig_owner {
        return Err(MimirError::InvalidSignature);
    }
    // bullet 2: the signer is the zone cut
    if rrsig.signer != *zone_name {
        return Err(MimirError::InvalidSignature);
    }
    // bullet 3: covered type matches
    if rrsig.type_covered != covered.rtype {
        return Err(MimirError::InvalidSignature);
    }
    // bullet 4: label count; the wildcard asterisk does not count
    let owner_labels = covered.owner.rrsig_label_count();
    let sig_labels = rrsig.labels as usize;
    if sig_labels > owner_labels {
        return Err(MimirError::InvalidSignature);
    }
    if sig_labels < owner_labels {
        flags.wildcard_expansion = true;
        flags.trim = owner_labels - sig_labels;
    }
    // bullet 5 and 6: validity window
    if rrsig.expiration < now {
        return Err(MimirError::SignatureExpired);
    }
    if rrsig.inception > now {
        return Err(MimirError::SignatureNotYetValid);
    }
    // bullet 7: the key is the one the signature names
    if key_owner != &rrsig.signer
        || key.algorithm != rrsig.algorithm
        || key.key_tag() != rrsig.key_tag
    {
        return Err(MimirError::InvalidSignature);
    }
    Ok(())
}

/// The byte string the signature was computed over: the RRSIG rdata up to
/// the signature field, then the covered set in canonical form, re-owned to
/// the wildcard ancestor when expansion applies (RFC 4034 §3.1.8.1).
fn signed_data(rrsig: &Rrsig, rrsig_rdata: &[u8], covered: &RrSet, expanded: bool) -> Result<Vec<u8>> {
    let mut data = rrsig.signed_prefix(rrsig_rdata);
    let reowned;
    let owner_override = if expanded {
        reowned = covered
            .owner
            .suffix(rrsig.labels as usize)
            .to_wildcard()?;
        Some(&reowned)
    } else {
        None
    };
    data.extend_from_slice(&covered.canonical_wire(owner_override, rrsig.original_ttl));
    Ok(data)
}

/// Validate `covered` against the RRSIGs found in `section` of `pkt`, trying
/// every key of the `keys` set until one verifies.
pub fn validate_rrset(
    pkt: &DnsPacket,
    section: Section,
    covered: &RrSet,
    keys: &RrSet,
    zone_name: &Name,
    now: u32,
    has_nsec3: bool,
) -> Result<()> {
    let mut last_err = MimirError::NoDnsKey;
    for key_pos in 0..keys.rdatas.len() {
        match validate_rrset_with_key(
            pkt, section, covered, keys, key_pos, None, zone_name, now, has_nsec3,
        ) {
            Ok(()) => return Ok(()),
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

/// Validate `covered` with a specific key of the `keys` set. When `key` is
/// provided it must be the parsed form of `keys.rdatas[key_pos]`; otherwise
/// it is parsed here.
#[allow(clippy::too_many_arguments)]
pub fn validate_rrset_with_key(
    pkt: &DnsPacket,
    section: Section,
    covered: &RrSet,
    keys: &RrSet,
    key_pos: usize,
    key: Option<&Dnskey>,
    zone_name: &Name,
    now: u32,
    has_nsec3: bool,
) -> Result<()> {
    let parsed;
    let key = match key {
        Some(key) => key,
        None => {
            parsed = Dnskey::parse(
                keys.rdatas
                    .get(key_pos)
                    .ok_or(MimirError::InvalidArgument("key index out of range"))?,
            )?;
            &parsed
        }
    };
    let algorithm = Algorithm::from(key.algorithm);
    if !algorithm.is_supported() {
        return Err(MimirError::UnsupportedAlgorithm(key.algorithm));
    }

    let mut seen_rrsig = false;
    let mut last_err = MimirError::NoRrsig;
    for rr in pkt.section(section) {
        if rr.rtype != RecordType::Rrsig || rr.rclass != covered.rclass {
            continue;
        }
        let rrsig = match rr.as_rrsig() {
            Ok(rrsig) => rrsig,
            Err(_) => continue,
        };
        if rrsig.type_covered != covered.rtype {
            continue;
        }
        seen_rrsig = true;

        let mut flags = SigCheckFlags::default();
        if let Err(err) = check_rrsig_rr(
            &mut flags,
            covered,
            &rr.name,
            &rrsig,
            &keys.owner,
            key,
            zone_name,
            now,
        ) {
            last_err = err;
            continue;
        }

        let message = signed_data(&rrsig, &rr.rdata, covered, flags.wildcard_expansion)?;
        if let Err(err) = algorithm.verify(&key.public_key, &message, &rrsig.signature) {
            trace!(
                "RRSIG over {} {} failed under key tag {}",
                covered.owner, covered.rtype, rrsig.key_tag
            );
            last_err = err;
            continue;
        }

        if flags.wildcard_expansion {
            // A wildcard-expanded positive answer must carry proof that no
            // closer match existed (RFC 4035 §5.3.4).
            let check = if has_nsec3 {
                denial::nsec3_wildcard_answer_check(
                    pkt,
                    Section::Authority,
                    &covered.owner,
                    flags.trim,
                )
            } else {
                denial::nsec_wildcard_answer_check(pkt, Section::Authority, &covered.owner)
            };
            if let Err(err) = check {
                last_err = err;
                continue;
            }
        }

        debug!(
            "validated {} {} under {} (key tag {})",
            covered.owner, covered.rtype, zone_name, rrsig.key_tag
        );
        return Ok(());
    }

    if seen_rrsig { Err(last_err) } else { Err(MimirError::NoRrsig) }
}

/// Establish trust in a DNSKEY set (RFC 4035 §5.2): some member must be a
/// zone key, not revoked, match an authenticated DS or configured anchor,
/// and the set must verify under that very key.
pub fn dnskeys_trusted(
    pkt: &DnsPacket,
    section: Section,
    keys: &RrSet,
    anchors: &[TrustAnchor],
    zone_name: &Name,
    now: u32,
    has_nsec3: bool,
) -> Result<()> {
    if anchors.is_empty() {
        return Err(MimirError::TrustAnchorNotFound);
    }
    let mut last_err = MimirError::NoDnsKey;
    for (key_pos, rdata) in keys.rdatas.iter().enumerate() {
        let key = match Dnskey::parse(rdata) {
            Ok(key) => key,
            Err(_) => continue,
        };
        if !key.is_zsk() || key.is_revoked() {
            continue;
        }
        if !anchors
            .iter()
            .any(|anchor| anchor.matches_key(&keys.owner, &key))
        {
            last_err = MimirError::DsDigestMismatch;
            continue;
        }
        match validate_rrset_with_key(
            pkt,
            section,
            keys,
            keys,
            key_pos,
            Some(&key),
            zone_name,
            now,
            has_nsec3,
        ) {
            Ok(()) => {
                debug!("DNSKEY set for {} chained to trust anchor", zone_name);
                return Ok(());
            }
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

/// Whether two DNSKEY rdatas denote the same key: equal algorithm and
/// public key material, regardless of flags.
pub fn key_matches(a: &[u8], b: &[u8]) -> bool {
    match (Dnskey::parse(a), Dnskey::parse(b)) {
        (Ok(ka), Ok(kb)) => ka.algorithm == kb.algorithm && ka.public_key == kb.public_key,
        _ => false,
    }
}

/// Key tag carried by DS rdata (leading 16 bits) or computed for DNSKEY.
pub fn key_tag_from_rdata(rtype: RecordType, rdata: &[u8]) -> Result<u16> {
    match rtype {
        RecordType::Ds if rdata.len() >= 2 => Ok(u16::from_be_bytes([rdata[0], rdata[1]])),
        RecordType::Dnskey => Ok(Dnskey::parse(rdata)?.key_tag()),
        _ => Err(MimirError::InvalidArgument("not a DS or DNSKEY rdata")),
    }
}
