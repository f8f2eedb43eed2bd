use super::algorithm::Algorithm;
use super::digest::DigestType;
use crate::dns::record::{Dnskey, Ds};
use crate::dns::Name;
use crate::error::{MimirError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// A configured trust anchor, held in DS form.
///
/// DNSKEY anchors are digested on load so matching is uniform: an anchor
/// matches a DNSKEY when key tag, algorithm and digest all agree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustAnchor {
    pub owner: Name,
    pub key_tag: u16,
    pub algorithm: Algorithm,
    pub digest_type: DigestType,
    pub digest: Vec<u8>,
}

impl TrustAnchor {
    pub fn from_ds(owner: Name, ds: &Ds) -> Self {
        TrustAnchor {
            owner,
            key_tag: ds.key_tag,
            algorithm: Algorithm::from(ds.algorithm),
            digest_type: DigestType::from(ds.digest_type),
            digest: ds.digest.clone(),
        }
    }

    /// Digest a DNSKEY anchor down to DS form with SHA-256.
    pub fn from_dnskey(owner: Name, key: &Dnskey) -> Result<Self> {
        let digest = dnskey_digest(&owner, key, DigestType::Sha256)
            .ok_or(MimirError::UnsupportedDigestType(2))?;
        Ok(TrustAnchor {
            owner,
            key_tag: key.key_tag(),
            algorithm: Algorithm::from(key.algorithm),
            digest_type: DigestType::Sha256,
            digest,
        })
    }

    /// Whether `key` at `owner` is the anchored key.
    pub fn matches_key(&self, owner: &Name, key: &Dnskey) -> bool {
        if self.owner != *owner
            || self.key_tag != key.key_tag()
            || u8::from(self.algorithm) != key.algorithm
        {
            return false;
        }
        match dnskey_digest(owner, key, self.digest_type) {
            Some(digest) => digest == self.digest,
            None => false,
        }
    }
}

/// Hash `owner-wire-lowercase || DNSKEY rdata` as DS digests are defined
/// (RFC 4034 §5.1.4).
pub fn dnskey_digest(owner: &Name, key: &Dnskey, digest_type: DigestType) -> Option<Vec<u8>> {
    let mut data = owner.to_lowercase_wire();
    data.extend_from_slice(&key.flags.to_be_bytes());
    data.push(key.protocol);
    data.push(key.algorithm);
    data.extend_from_slice(&key.public_key);
    digest_type.digest(&data)
}

/// Store of configured trust anchors, reloaded atomically as a whole.
pub struct TrustAnchorStore {
    anchors: RwLock<HashMap<Name, Vec<TrustAnchor>>>,
}

/// Root zone KSK DS records published by IANA (KSK-2017 and KSK-2024).
const ROOT_ANCHORS: [(u16, u8, u8, &str); 2] = [
    (
        20326,
        8,
        2,
        "E06D44B80B8F1D39A95C0B0D7C65D08458E880409BBC683457104237C7F8EC8D",
    ),
    (
        38696,
        8,
        2,
        "683D2D0ACB8C9B712A1948B27F741219298D0A450D612C483AF444A4C0FB2B16",
    ),
];

impl TrustAnchorStore {
    /// Empty store, no anchors at all.
    pub fn empty() -> Self {
        TrustAnchorStore {
            anchors: RwLock::new(HashMap::new()),
        }
    }

    /// Store primed with the IANA root anchors.
    pub fn new() -> Self {
        let store = Self::empty();
        let root = Name::root();
        let anchors: Vec<TrustAnchor> = ROOT_ANCHORS
            .iter()
            .map(|&(key_tag, algorithm, digest_type, digest)| TrustAnchor {
                owner: root.clone(),
                key_tag,
                algorithm: Algorithm::from(algorithm),
                digest_type: DigestType::from(digest_type),
                digest: hex::decode(digest).expect("static root anchor digest"),
            })
            .collect();
        store.anchors.write().insert(root, anchors);
        store
    }

    pub fn add(&self, anchor: TrustAnchor) {
        self.anchors
            .write()
            .entry(anchor.owner.clone())
            .or_default()
            .push(anchor);
    }

    /// Anchors configured exactly at `name`.
    pub fn anchors_at(&self, name: &Name) -> Option<Vec<TrustAnchor>> {
        self.anchors.read().get(name).cloned()
    }

    /// The closest enclosing anchor set for `name`, walking toward the root.
    pub fn closest(&self, name: &Name) -> Option<(Name, Vec<TrustAnchor>)> {
        let anchors = self.anchors.read();
        let mut cursor = Some(name.clone());
        while let Some(current) = cursor {
            if let Some(found) = anchors.get(&current) {
                return Some((current, found.clone()));
            }
            cursor = current.parent();
        }
        None
    }

    pub fn domain_count(&self) -> usize {
        self.anchors.read().len()
    }

    /// Parse DS or DNSKEY records in presentation format and atomically
    /// replace the store contents. Lines that do not parse are skipped with
    /// a warning so one typo cannot drop the whole anchor set.
    pub fn reload_from_str(&self, text: &str) -> Result<usize> {
        let mut fresh: HashMap<Name, Vec<TrustAnchor>> = HashMap::new();
        let mut count = 0;
        for line in text.lines() {
            let line = line.split(';').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            match parse_anchor_line(line) {
                Ok(anchor) => {
                    fresh.entry(anchor.owner.clone()).or_default().push(anchor);
                    count += 1;
                }
                Err(err) => warn!("skipping unparseable trust anchor line: {}", err),
            }
        }
        if count == 0 {
            return Err(MimirError::ConfigParse(
                "no usable trust anchors in input".into(),
            ));
        }
        *self.anchors.write() = fresh;
        debug!("trust anchor store reloaded, {} anchors", count);
        Ok(count)
    }

    /// Reload from a file; used by the host's SIGHUP-equivalent handler.
    pub fn reload_from_file(&self, path: &Path) -> Result<usize> {
        let text = std::fs::read_to_string(path)?;
        self.reload_from_str(&text)
    }
}

impl Default for TrustAnchorStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse one `owner [TTL] [class] DS|DNSKEY <fields>` presentation line.
fn parse_anchor_line(line: &str) -> Result<TrustAnchor> {
    let mut tokens = line.split_whitespace().peekable();
    let owner: Name = tokens
        .next()
        .ok_or(MimirError::ConfigParse("empty anchor line".into()))?
        .parse()?;
    // optional TTL and class
    if tokens.peek().is_some_and(|t| t.parse::<u32>().is_ok()) {
        tokens.next();
    }
    if tokens.peek().is_some_and(|t| t.eq_ignore_ascii_case("IN")) {
        tokens.next();
    }
    let rtype = tokens
        .next()
        .ok_or(MimirError::ConfigParse("missing record type".into()))?;
    let fields: Vec<&str> = tokens.collect();
    match rtype.to_ascii_uppercase().as_str() {
        "DS" => {
            if fields.len() < 4 {
                return Err(MimirError::ConfigParse("short DS anchor".into()));
            }
            let digest_hex: String = fields[3..].concat();
            let ds = Ds {
                key_tag: fields[0]
                    .parse()
                    .map_err(|_| MimirError::ConfigParse("bad DS key tag".into()))?,
                algorithm: fields[1]
                    .parse()
                    .map_err(|_| MimirError::ConfigParse("bad DS algorithm".into()))?,
                digest_type: fields[2]
                    .parse()
                    .map_err(|_| MimirError::ConfigParse("bad DS digest type".into()))?,
                digest: hex::decode(digest_hex)
                    .map_err(|_| MimirError::ConfigParse("bad DS digest".into()))?,
            };
            Ok(TrustAnchor::from_ds(owner, &ds))
        }
        "DNSKEY" => {
            if fields.len() < 4 {
                return Err(MimirError::ConfigParse("short DNSKEY anchor".into()));
            }
            let key_b64: String = fields[3..].concat();
            use base64::Engine;
            let public_key = base64::engine::general_purpose::STANDARD
                .decode(key_b64)
                .map_err(|_| MimirError::ConfigParse("bad DNSKEY base64".into()))?;
            let key = Dnskey {
                flags: fields[0]
                    .parse()
                    .map_err(|_| MimirError::ConfigParse("bad DNSKEY flags".into()))?,
                protocol: fields[1]
                    .parse()
                    .map_err(|_| MimirError::ConfigParse("bad DNSKEY protocol".into()))?,
                algorithm: fields[2]
                    .parse()
                    .map_err(|_| MimirError::ConfigParse("bad DNSKEY algorithm".into()))?,
                public_key,
            };
            TrustAnchor::from_dnskey(owner, &key)
        }
        other => Err(MimirError::ConfigParse(format!(
            "unsupported anchor type {}",
            other
        ))),
    }
}
