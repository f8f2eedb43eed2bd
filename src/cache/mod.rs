pub mod backend;

pub use backend::{CacheBackend, MemoryBackend};

use crate::dns::enums::{RecordClass, RecordType};
use crate::dns::rrset::RrSet;
use crate::dns::Name;
use crate::dnssec::SecurityState;
use crate::error::{MimirError, Result};
use crate::ranked::Rank;
use rustc_hash::FxHashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

/// Cache key: `{class(2B)}{owner wire lowercase}{type(2B)}{discriminator(2B)}`.
///
/// The discriminator carries the covered type for RRSIG sets and zero for
/// everything else, so signatures never shadow the data they cover.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(Vec<u8>);

impl CacheKey {
    pub fn new(rclass: RecordClass, owner: &Name, rtype: RecordType, discriminator: u16) -> Self {
        let owner_wire = owner.to_lowercase_wire();
        let mut key = Vec::with_capacity(owner_wire.len() + 6);
        key.extend_from_slice(&u16::from(rclass).to_be_bytes());
        key.extend_from_slice(&owner_wire);
        key.extend_from_slice(&u16::from(rtype).to_be_bytes());
        key.extend_from_slice(&discriminator.to_be_bytes());
        CacheKey(key)
    }

    pub fn for_rrset(rrset: &RrSet) -> Self {
        let covered = rrset.key().covered;
        CacheKey::new(rrset.rclass, &rrset.owner, rrset.rtype, covered)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A cached value: length-prefixed rdata plus the validation metadata
/// trailer (rank, security state, original TTL, absolute expiry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheValue {
    pub rdatas: Vec<Vec<u8>>,
    pub rank: Rank,
    pub security: SecurityState,
    pub ttl: u32,
    /// Unix timestamp after which the entry is dead.
    pub expires: u64,
}

fn security_to_u8(state: SecurityState) -> u8 {
    match state {
        SecurityState::Indeterminate => 0,
        SecurityState::Insecure => 1,
        SecurityState::Secure => 2,
        SecurityState::Bogus => 3,
    }
}

fn security_from_u8(value: u8) -> Option<SecurityState> {
    Some(match value {
        0 => SecurityState::Indeterminate,
        1 => SecurityState::Insecure,
        2 => SecurityState::Secure,
        3 => SecurityState::Bogus,
        _ => return None,
    })
}

impl CacheValue {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.rdatas.len() as u16).to_be_bytes());
        for rdata in &self.rdatas {
            out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            out.extend_from_slice(rdata);
        }
        out.push(self.rank.to_u8());
        out.push(security_to_u8(self.security));
        out.extend_from_slice(&self.ttl.to_be_bytes());
        out.extend_from_slice(&self.expires.to_be_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let bad = || MimirError::Cache("corrupt cache value".into());
        if data.len() < 2 {
            return Err(bad());
        }
        let count = u16::from_be_bytes([data[0], data[1]]) as usize;
        let mut pos = 2;
        let mut rdatas = Vec::with_capacity(count);
        for _ in 0..count {
            if pos + 2 > data.len() {
                return Err(bad());
            }
            let len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
            pos += 2;
            if pos + len > data.len() {
                return Err(bad());
            }
            rdatas.push(data[pos..pos + len].to_vec());
            pos += len;
        }
        if pos + 14 != data.len() {
            return Err(bad());
        }
        let rank = Rank::from_u8(data[pos]).ok_or_else(bad)?;
        let security = security_from_u8(data[pos + 1]).ok_or_else(bad)?;
        let ttl = u32::from_be_bytes([data[pos + 2], data[pos + 3], data[pos + 4], data[pos + 5]]);
        let expires = u64::from_be_bytes(data[pos + 6..pos + 14].try_into().expect("length checked"));
        Ok(CacheValue {
            rdatas,
            rank,
            security,
            ttl,
            expires,
        })
    }
}

/// The cache adapter the driver reads and writes validated RR sets through.
#[derive(Clone)]
pub struct RecordCache {
    backend: Arc<dyn CacheBackend>,
}

impl RecordCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        RecordCache { backend }
    }

    pub fn new_memory() -> Self {
        RecordCache::new(Arc::new(MemoryBackend::new()))
    }

    /// Open a transaction for one request.
    pub fn begin(&self) -> CacheTransaction {
        CacheTransaction {
            backend: self.backend.clone(),
            writes: FxHashMap::default(),
        }
    }

    /// Direct read of a live entry.
    pub fn get(&self, key: &CacheKey, now: u64) -> Option<CacheValue> {
        let value = CacheValue::decode(&self.backend.get(key.as_bytes())?).ok()?;
        if value.expires <= now {
            self.backend.remove(key.as_bytes());
            return None;
        }
        Some(value)
    }

    /// Fetch an RR set with the remaining TTL, if live.
    pub fn fetch_rrset(
        &self,
        owner: &Name,
        rtype: RecordType,
        rclass: RecordClass,
        now: u64,
    ) -> Option<(RrSet, Rank, SecurityState)> {
        let key = CacheKey::new(rclass, owner, rtype, 0);
        let value = self.get(&key, now)?;
        Some(rrset_from_value(owner, rtype, rclass, &value, now))
    }

    pub fn save_to(&self, path: &Path) -> Result<usize> {
        backend::save_snapshot(self.backend.as_ref(), path)
    }

    pub fn load_from(&self, path: &Path) -> Result<usize> {
        backend::load_snapshot(self.backend.as_ref(), path)
    }
}

fn rrset_from_value(
    owner: &Name,
    rtype: RecordType,
    rclass: RecordClass,
    value: &CacheValue,
    now: u64,
) -> (RrSet, Rank, SecurityState) {
    let remaining = value.expires.saturating_sub(now).min(value.ttl as u64) as u32;
    (
        RrSet {
            owner: owner.clone(),
            rtype,
            rclass,
            ttl: remaining,
            rdatas: value.rdatas.clone(),
        },
        value.rank,
        value.security,
    )
}

/// Buffered cache writes for one request. Opened at request start, committed
/// exactly once on success; dropping the transaction discards it.
pub struct CacheTransaction {
    backend: Arc<dyn CacheBackend>,
    writes: FxHashMap<CacheKey, CacheValue>,
}

impl CacheTransaction {
    /// Read through pending writes, then the backend.
    pub fn get(&self, key: &CacheKey, now: u64) -> Option<CacheValue> {
        if let Some(value) = self.writes.get(key) {
            if value.expires > now {
                return Some(value.clone());
            }
            return None;
        }
        let value = CacheValue::decode(&self.backend.get(key.as_bytes())?).ok()?;
        (value.expires > now).then_some(value)
    }

    /// Stage a write. A put never downgrades: when a live entry of the same
    /// key holds a higher rank, the new value is dropped.
    pub fn put(&mut self, key: CacheKey, value: CacheValue, now: u64) {
        if let Some(existing) = self.get(&key, now) {
            if existing.rank > value.rank {
                trace!("cache put skipped, existing rank outranks new value");
                return;
            }
        }
        self.writes.insert(key, value);
    }

    /// Stage an RR set with its validation metadata.
    pub fn stash_rrset(&mut self, rrset: &RrSet, rank: Rank, security: SecurityState, now: u64) {
        let key = CacheKey::for_rrset(rrset);
        let value = CacheValue {
            rdatas: rrset.rdatas.clone(),
            rank,
            security,
            ttl: rrset.ttl,
            expires: now + rrset.ttl as u64,
        };
        self.put(key, value, now);
    }

    pub fn fetch_rrset(
        &self,
        owner: &Name,
        rtype: RecordType,
        rclass: RecordClass,
        now: u64,
    ) -> Option<(RrSet, Rank, SecurityState)> {
        let key = CacheKey::new(rclass, owner, rtype, 0);
        let value = self.get(&key, now)?;
        Some(rrset_from_value(owner, rtype, rclass, &value, now))
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Commit every staged write.
    pub fn commit(self) -> Result<()> {
        let count = self.writes.len();
        for (key, value) in self.writes {
            self.backend.set(key.as_bytes(), value.encode());
        }
        debug!("cache transaction committed, {} writes", count);
        Ok(())
    }

    /// Commit only fully-validated entries; used when a request is being
    /// unwound but secure data should not be lost.
    pub fn commit_validated(self) -> Result<()> {
        let mut kept = 0;
        for (key, value) in self.writes {
            if value.rank >= Rank::Secure && value.rank != Rank::Bogus && value.rank != Rank::Mismatch
            {
                self.backend.set(key.as_bytes(), value.encode());
                kept += 1;
            }
        }
        debug!("cache transaction unwound, kept {} validated writes", kept);
        Ok(())
    }

    /// Discard all staged writes.
    pub fn abort(self) {
        drop(self);
    }
}
