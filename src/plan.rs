use crate::dns::enums::{RecordClass, RecordType};
use crate::dns::Name;
use crate::dnssec::SecurityState;
use crate::error::{MimirError, Result};
use tracing::trace;

/// Hard bound on live plan entries; CNAME chasing plus DS-chain depth stays
/// well under this in practice.
pub const MAX_PLAN_DEPTH: usize = 64;

/// The (sname, stype, sclass) triple a query asks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub sname: Name,
    pub stype: RecordType,
    pub sclass: RecordClass,
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.sname, self.stype, self.sclass)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryFlags {
    /// CD was set on the client request; validation failures are tolerated.
    pub checking_disabled: bool,
    /// DNSSEC validation wanted for this query.
    pub want_dnssec: bool,
    /// Next attempt must use TCP (after TC=1).
    pub tcp: bool,
    /// Helper fetch for a glue-less name server's address; its failure only
    /// removes that server from the parent's candidate list.
    pub addr_fetch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Waiting for the iterator to pick it up.
    Pending,
    /// An outbound query is on the wire.
    InFlight,
    /// Answered; entry moved to the resolved ledger.
    Done,
}

/// One pending sub-query of the resolution plan.
#[derive(Debug, Clone)]
pub struct Query {
    pub uid: u32,
    pub parent: Option<u32>,
    pub sname: Name,
    pub stype: RecordType,
    pub sclass: RecordClass,
    pub flags: QueryFlags,
    pub state: QueryState,
    pub zone_cut: Option<Name>,
    pub security: SecurityState,
    /// Creation time, unix seconds.
    pub created: u64,
    pub retries: u32,
    /// Bumped on every mutation by the iterator; detects stale snapshots.
    pub generation: u32,
    /// Position along a CNAME/DNAME chain, zero for the chain head.
    pub cname_depth: u32,
}

impl Query {
    pub fn key(&self) -> QueryKey {
        QueryKey {
            sname: self.sname.clone(),
            stype: self.stype,
            sclass: self.sclass,
        }
    }

    pub fn touch(&mut self) {
        self.generation += 1;
    }
}

/// LIFO stack of sub-queries plus the ledger of resolved ones.
///
/// Sub-queries are pushed above their dependent and therefore resolve first.
/// UIDs come from a monotonic allocator and are the only way entries refer
/// to each other.
#[derive(Debug, Default)]
pub struct ResolutionPlan {
    entries: Vec<Query>,
    resolved: Vec<Query>,
    next_uid: u32,
}

impl ResolutionPlan {
    pub fn new() -> Self {
        ResolutionPlan::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Push a new sub-query above its parent. Fails with the LOOP kind when
    /// an ancestor already asks the same (sname, stype, sclass) — the one
    /// form of infinite recursion the retry budget cannot catch — and with
    /// LIMIT_EXCEEDED when the stack is full.
    pub fn push(
        &mut self,
        sname: Name,
        stype: RecordType,
        sclass: RecordClass,
        parent: Option<u32>,
        flags: QueryFlags,
        now: u64,
    ) -> Result<u32> {
        if self.entries.len() >= MAX_PLAN_DEPTH {
            return Err(MimirError::PlanDepthExceeded);
        }
        let key = QueryKey {
            sname: sname.clone(),
            stype,
            sclass,
        };
        let mut ancestor = parent;
        while let Some(uid) = ancestor {
            let found = self.find_uid(uid).or_else(|| self.find_resolved(uid));
            match found {
                Some(query) => {
                    if query.key() == key {
                        return Err(MimirError::QueryLoop(key.to_string()));
                    }
                    ancestor = query.parent;
                }
                None => break,
            }
        }

        let uid = self.next_uid;
        self.next_uid += 1;
        let cname_depth = parent
            .and_then(|uid| self.find_uid(uid))
            .map(|parent| parent.cname_depth)
            .unwrap_or(0);
        trace!("plan push [{}] {}", uid, key);
        self.entries.push(Query {
            uid,
            parent,
            sname,
            stype,
            sclass,
            flags,
            state: QueryState::Pending,
            zone_cut: None,
            security: SecurityState::Indeterminate,
            created: now,
            retries: 0,
            generation: 0,
            cname_depth,
        });
        Ok(uid)
    }

    /// The next query to resolve: top of the stack.
    pub fn top(&self) -> Option<&Query> {
        self.entries.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Query> {
        self.entries.last_mut()
    }

    /// Topmost entry still waiting for the iterator.
    pub fn next_pending(&self) -> Option<&Query> {
        self.entries
            .iter()
            .rev()
            .find(|q| q.state == QueryState::Pending)
    }

    pub fn find(&self, key: &QueryKey) -> Option<&Query> {
        self.entries.iter().rev().find(|q| q.key() == *key)
    }

    pub fn find_uid(&self, uid: u32) -> Option<&Query> {
        self.entries.iter().find(|q| q.uid == uid)
    }

    pub fn find_uid_mut(&mut self, uid: u32) -> Option<&mut Query> {
        self.entries.iter_mut().find(|q| q.uid == uid)
    }

    pub fn find_resolved(&self, uid: u32) -> Option<&Query> {
        self.resolved.iter().find(|q| q.uid == uid)
    }

    /// Move an answered entry to the resolved ledger.
    pub fn resolve(&mut self, uid: u32) -> Option<&Query> {
        let pos = self.entries.iter().position(|q| q.uid == uid)?;
        let mut query = self.entries.remove(pos);
        trace!("plan resolved [{}] {}", uid, query.key());
        query.state = QueryState::Done;
        self.resolved.push(query);
        self.resolved.last()
    }

    /// Drop a failed entry together with every sub-query hanging off it.
    pub fn fail(&mut self, uid: u32) {
        let mut doomed = vec![uid];
        while let Some(current) = doomed.pop() {
            self.entries.retain(|q| q.uid != current);
            let children: Vec<u32> = self
                .entries
                .iter()
                .filter(|q| q.parent == Some(current))
                .map(|q| q.uid)
                .collect();
            doomed.extend(children);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Walk the parent chain of `uid`, nearest ancestor first.
    pub fn ancestors(&self, uid: u32) -> Vec<&Query> {
        let mut out = Vec::new();
        let mut cursor = self
            .find_uid(uid)
            .or_else(|| self.find_resolved(uid))
            .and_then(|q| q.parent);
        while let Some(parent_uid) = cursor {
            match self
                .find_uid(parent_uid)
                .or_else(|| self.find_resolved(parent_uid))
            {
                Some(parent) => {
                    out.push(parent);
                    cursor = parent.parent;
                }
                None => break,
            }
        }
        out
    }
}
