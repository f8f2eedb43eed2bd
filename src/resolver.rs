use crate::cache::CacheTransaction;
use crate::context::Context;
use crate::delegation::CutSecurity;
use crate::dns::enums::{ExtendedErrorCode, RecordClass, RecordType, ResponseCode};
use crate::dns::packet::{DnsPacket, Section};
use crate::dns::rrset::{group_records, RrSet};
use crate::dns::Name;
use crate::dnssec::validator::{dnskeys_trusted, validate_rrset};
use crate::dnssec::{denial, SecurityState, TrustAnchor};
use crate::error::{ErrorKind, MimirError, Result};
use crate::iterate::{classify, extract_delegation, find_rrset, ResponseClass};
use crate::plan::{QueryFlags, QueryState, ResolutionPlan};
use crate::ranked::{Rank, RankedRrArray};
use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

const DNS_PORT: u16 = 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Udp,
    Tcp,
}

/// One outbound query the host must put on the wire.
#[derive(Debug, Clone)]
pub struct OutboundQuery {
    pub qry_uid: u32,
    pub packet: DnsPacket,
    pub server: SocketAddr,
    pub ns_name: Name,
    pub zone_cut: Name,
    pub proto: Proto,
    pub timeout: Duration,
}

/// The finished product of one request.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub answer: DnsPacket,
    pub rcode: ResponseCode,
    pub security: SecurityState,
    pub extended_error: Option<ExtendedErrorCode>,
}

/// One turn of the driver's crank.
#[derive(Debug)]
pub enum Step {
    /// State advanced; call `step` again.
    Next,
    /// Send this query and feed the reply to `ingest`.
    Wait(Box<OutboundQuery>),
    /// Resolution finished.
    Done(Box<Resolution>),
    /// The request itself is unusable.
    Fail(MimirError),
}

/// The transport contract: deliver one query, return one reply. The core
/// composes suspensions around it and never opens sockets itself.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(&self, query: &OutboundQuery) -> Result<DnsPacket>;
}

/// Resolver façade bound to a shared context.
#[derive(Clone)]
pub struct Resolver {
    ctx: Arc<Context>,
}

impl Resolver {
    pub fn new(ctx: Arc<Context>) -> Self {
        Resolver { ctx }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Start a resolution task for a client request.
    pub fn begin(&self, request: &DnsPacket) -> Result<ResolutionTask> {
        let question = request
            .questions
            .first()
            .ok_or(MimirError::InvalidArgument("request has no question"))?;
        if request.header.opcode != 0 {
            return Err(MimirError::InvalidArgument("only QUERY opcode supported"));
        }
        let flags = QueryFlags {
            checking_disabled: request.header.cd,
            want_dnssec: self.ctx.config.dnssec_validation && !request.header.cd,
            tcp: false,
            addr_fetch: false,
        };
        let mut plan = ResolutionPlan::new();
        let now = unix_now();
        let root_uid = plan.push(
            question.qname.clone(),
            question.qtype,
            question.qclass,
            None,
            flags,
            now,
        )?;
        debug!(
            "request [{}] {} {} {}",
            root_uid, question.qname, question.qtype, question.qclass
        );
        Ok(ResolutionTask {
            ctx: self.ctx.clone(),
            plan,
            ranked: RankedRrArray::new(),
            txn: Some(self.ctx.cache.begin()),
            request: request.clone(),
            deadline: Instant::now() + Duration::from_millis(self.ctx.config.request_deadline_ms),
            pending: None,
            trusted_keys: FxHashMap::default(),
            insecure_cuts: FxHashSet::default(),
            tried: FxHashMap::default(),
            result_uids: vec![root_uid],
            final_rcode: ResponseCode::NoError,
            final_security: SecurityState::Indeterminate,
            extended_error: None,
            finished: false,
        })
    }

    /// Drive a request to completion over the given transport.
    pub async fn submit<T: Transport + ?Sized>(
        &self,
        request: &DnsPacket,
        transport: &T,
    ) -> Result<Resolution> {
        let mut task = self.begin(request)?;
        loop {
            match task.step() {
                Step::Next => continue,
                Step::Wait(out) => {
                    let started = Instant::now();
                    match tokio::time::timeout(out.timeout, transport.exchange(&out)).await {
                        Ok(Ok(reply)) => task.ingest(Some(reply), Some(started.elapsed())),
                        Ok(Err(_)) | Err(_) => task.ingest(None, None),
                    }
                }
                Step::Done(resolution) => return Ok(*resolution),
                Step::Fail(err) => return Err(err),
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct PendingIo {
    uid: u32,
    ns_name: Name,
    zone_cut: Name,
    proto: Proto,
}

enum BeginOutcome {
    /// Plan mutated (sub-query pushed, cache hit, noop resolution).
    Progress,
    Transmit(OutboundQuery),
}

/// Cloned view of a query's fields, to keep borrows short.
#[derive(Clone)]
struct QueryView {
    uid: u32,
    parent: Option<u32>,
    sname: Name,
    stype: RecordType,
    sclass: RecordClass,
    flags: QueryFlags,
    state: QueryState,
    zone_cut: Option<Name>,
    cname_depth: u32,
}

/// Per-request driver state: the plan, the accumulator, the cache
/// transaction and the DNSSEC bookkeeping. One task per client request;
/// tasks share nothing but the context.
pub struct ResolutionTask {
    ctx: Arc<Context>,
    plan: ResolutionPlan,
    ranked: RankedRrArray,
    txn: Option<CacheTransaction>,
    request: DnsPacket,
    deadline: Instant,
    pending: Option<PendingIo>,
    /// Validated DNSKEY sets per zone cut (lowercased wire key).
    trusted_keys: FxHashMap<Vec<u8>, RrSet>,
    /// Cuts proven unsigned during this request.
    insecure_cuts: FxHashSet<Vec<u8>>,
    /// Servers already tried per query uid.
    tried: FxHashMap<u32, Vec<Name>>,
    /// Queries whose results form the client-visible answer (the root query
    /// and every CNAME/DNAME follow-up).
    result_uids: Vec<u32>,
    final_rcode: ResponseCode,
    final_security: SecurityState,
    extended_error: Option<ExtendedErrorCode>,
    finished: bool,
}

impl ResolutionTask {
    fn view(&self, uid: u32) -> Option<QueryView> {
        let q = self.plan.find_uid(uid)?;
        Some(QueryView {
            uid: q.uid,
            parent: q.parent,
            sname: q.sname.clone(),
            stype: q.stype,
            sclass: q.sclass,
            flags: q.flags,
            state: q.state,
            zone_cut: q.zone_cut.clone(),
            cname_depth: q.cname_depth,
        })
    }

    /// Advance the resolution by one turn.
    pub fn step(&mut self) -> Step {
        if self.finished {
            return Step::Fail(MimirError::InvalidArgument("task already finished"));
        }
        if self.pending.is_some() {
            return Step::Fail(MimirError::InvalidArgument(
                "previous response not ingested",
            ));
        }
        if Instant::now() >= self.deadline {
            debug!("request deadline expired, unwinding");
            self.final_rcode = ResponseCode::ServerFailure;
            self.extended_error = Some(ExtendedErrorCode::NoReachableAuthority);
            self.plan.clear();
            return Step::Done(Box::new(self.finalize()));
        }
        let Some(top) = self.plan.top() else {
            return Step::Done(Box::new(self.finalize()));
        };
        let uid = top.uid;
        match self.begin_query(uid) {
            Ok(BeginOutcome::Progress) => Step::Next,
            Ok(BeginOutcome::Transmit(out)) => {
                self.pending = Some(PendingIo {
                    uid: out.qry_uid,
                    ns_name: out.ns_name.clone(),
                    zone_cut: out.zone_cut.clone(),
                    proto: out.proto,
                });
                Step::Wait(Box::new(out))
            }
            Err(err) => {
                self.fail_query(uid, err);
                Step::Next
            }
        }
    }

    /// Prepare the topmost query: cache lookup, zone cut discovery, DNSSEC
    /// key gating, server selection and packet construction.
    fn begin_query(&mut self, uid: u32) -> Result<BeginOutcome> {
        let now = unix_now();
        let mut query = self
            .view(uid)
            .ok_or(MimirError::InvalidArgument("unknown query uid"))?;

        // 1. the cache may already hold the answer
        if query.state == QueryState::Pending {
            if let Some(hit) = self
                .txn
                .as_ref()
                .and_then(|txn| txn.fetch_rrset(&query.sname, query.stype, query.sclass, now))
            {
                let (rrset, rank, security) = hit;
                // key material is only usable from the cache when it went in
                // fully validated; anything else must be re-fetched
                let usable = if query.flags.want_dnssec && query.stype.is_dnssec() {
                    rank == Rank::Secure
                } else {
                    rank >= Rank::Try && rank < Rank::Bogus
                };
                if usable {
                    trace!("cache hit for [{}] {}", uid, query.sname);
                    return Ok(self.consume_cache_hit(&query, rrset, rank, security));
                }
            }
        }

        // 2. find the zone cut to ask
        if self.ctx.delegations.is_empty() {
            self.ctx.delegations.install_root_hints();
        }
        let cut = match query.zone_cut.clone() {
            Some(cut) => cut,
            None => {
                // DS lives in the parent zone
                let lookup_name = if query.stype == RecordType::Ds {
                    query.sname.parent().unwrap_or_else(Name::root)
                } else {
                    query.sname.clone()
                };
                let delegation = self
                    .ctx
                    .delegations
                    .lookup(&lookup_name)
                    .ok_or_else(|| MimirError::NoNameServer(lookup_name.to_string()))?;
                let cut = delegation.cut;
                if let Some(q) = self.plan.find_uid_mut(uid) {
                    q.zone_cut = Some(cut.clone());
                    q.touch();
                }
                query.zone_cut = Some(cut.clone());
                cut
            }
        };

        // 3. DNSSEC gating: no signed query leaves before its keys can be
        //    checked (or the cut is known to be unsigned)
        if query.flags.want_dnssec && !query.flags.checking_disabled {
            if let Some(outcome) = self.gate_on_keys(&query, &cut, now)? {
                return Ok(outcome);
            }
        }

        // 4. pick a server
        let exclude = self.tried.get(&uid).cloned().unwrap_or_default();
        let selected = self
            .ctx
            .delegations
            .select_ns(&cut, &exclude, self.ctx.config.prefer_ipv6, &self.ctx.random)
            .ok_or_else(|| MimirError::NoNameServer(cut.to_string()))?;
        let Some(addr) = selected.addr else {
            // an in-bailiwick server without glue would need its own zone to
            // resolve itself; strike it rather than chase the cycle
            if selected.name.ends_with(&cut) {
                self.tried.entry(uid).or_default().push(selected.name);
                return Ok(BeginOutcome::Progress);
            }
            // glue-less server: fetch its address first
            let fetch_type = if self.ctx.config.prefer_ipv6 {
                RecordType::Aaaa
            } else {
                RecordType::A
            };
            let flags = QueryFlags {
                addr_fetch: true,
                tcp: false,
                ..query.flags
            };
            match self
                .plan
                .push(selected.name.clone(), fetch_type, query.sclass, Some(uid), flags, now)
            {
                Ok(_) => return Ok(BeginOutcome::Progress),
                Err(_) => {
                    // cannot chase this server's address; strike it
                    self.tried.entry(uid).or_default().push(selected.name);
                    return Ok(BeginOutcome::Progress);
                }
            }
        };

        // 5. build the outbound packet
        let id = self.ctx.random.random_u16();
        let packet = DnsPacket::new_query(
            id,
            query.sname.clone(),
            query.stype,
            query.sclass,
            query.flags.want_dnssec,
            self.ctx.config.edns_payload_size,
        );
        let proto = if selected.tcp_only || query.flags.tcp {
            Proto::Tcp
        } else {
            Proto::Udp
        };
        if let Some(q) = self.plan.find_uid_mut(uid) {
            q.state = QueryState::InFlight;
            q.touch();
        }
        trace!(
            "[{}] {} {} -> {} ({:?})",
            uid, query.sname, query.stype, selected.name, proto
        );
        Ok(BeginOutcome::Transmit(OutboundQuery {
            qry_uid: uid,
            packet,
            server: SocketAddr::new(addr, DNS_PORT),
            ns_name: selected.name,
            zone_cut: cut,
            proto,
            timeout: Duration::from_millis(self.ctx.config.query_timeout_ms),
        }))
    }

    /// Returns `Some(outcome)` when key material is missing and a fetch was
    /// scheduled (or the query could be resolved without network at all).
    fn gate_on_keys(
        &mut self,
        query: &QueryView,
        cut: &Name,
        now: u64,
    ) -> Result<Option<BeginOutcome>> {
        // nothing to validate against: the whole branch is unsigned for us
        if self.ctx.trust_anchors.closest(&query.sname).is_none() {
            if let Some(q) = self.plan.find_uid_mut(query.uid) {
                q.flags.want_dnssec = false;
                q.security = q.security.transition(SecurityState::Insecure);
                q.touch();
            }
            return Ok(None);
        }

        let cut_key = cut.to_lowercase_wire();
        let insecure = self.insecure_cuts.contains(&cut_key)
            || self
                .ctx
                .delegations
                .get(cut)
                .is_some_and(|d| d.security == CutSecurity::Insecure);
        let is_key_fetch =
            query.stype == RecordType::Dnskey && query.sname == *cut && query.parent.is_some();

        if insecure {
            if is_key_fetch {
                // moot fetch: the zone is proven unsigned
                if let Some(q) = self.plan.find_uid_mut(query.uid) {
                    q.security = q.security.transition(SecurityState::Insecure);
                }
                self.plan.resolve(query.uid);
                return Ok(Some(BeginOutcome::Progress));
            }
            return Ok(None);
        }

        if self.trusted_keys.contains_key(&cut_key) {
            return Ok(None);
        }

        if query.stype == RecordType::Dnskey && query.sname == *cut {
            // the key fetch itself: it needs an anchor or a validated DS
            let have_anchor = self.ctx.trust_anchors.anchors_at(cut).is_some()
                || self
                    .ctx
                    .delegations
                    .get(cut)
                    .is_some_and(|d| d.ds.is_some());
            if !have_anchor {
                self.plan.push(
                    cut.clone(),
                    RecordType::Ds,
                    query.sclass,
                    Some(query.uid),
                    QueryFlags {
                        addr_fetch: false,
                        tcp: false,
                        ..query.flags
                    },
                    now,
                )?;
                return Ok(Some(BeginOutcome::Progress));
            }
            return Ok(None);
        }

        // anything else waits for the cut's DNSKEY set
        self.plan.push(
            cut.clone(),
            RecordType::Dnskey,
            query.sclass,
            Some(query.uid),
            QueryFlags {
                addr_fetch: false,
                tcp: false,
                ..query.flags
            },
            now,
        )?;
        Ok(Some(BeginOutcome::Progress))
    }

    fn consume_cache_hit(
        &mut self,
        query: &QueryView,
        rrset: RrSet,
        rank: Rank,
        security: SecurityState,
    ) -> BeginOutcome {
        if query.flags.addr_fetch {
            self.feed_parent_addresses(query, &rrset);
        }
        // cached validated key material feeds the per-request trust state,
        // otherwise the dependent query would fetch it all over again
        if security == SecurityState::Secure {
            match query.stype {
                RecordType::Dnskey => {
                    self.trusted_keys
                        .insert(query.sname.to_lowercase_wire(), rrset.clone());
                }
                RecordType::Ds => {
                    if self.ctx.delegations.get(&query.sname).is_none() {
                        self.ctx
                            .delegations
                            .insert(crate::delegation::Delegation::new(query.sname.clone()));
                    }
                    self.ctx.delegations.set_ds(&query.sname, Some(rrset.clone()));
                    self.ctx
                        .delegations
                        .set_security(&query.sname, CutSecurity::Secure);
                }
                _ => {}
            }
        }
        let to_wire = self.result_uids.contains(&query.uid);
        self.ranked
            .add(rrset, rank, to_wire, query.uid, Section::Answer);
        for entry in self.ranked.entries_for_mut(query.uid) {
            entry.cached = true;
        }
        if let Some(q) = self.plan.find_uid_mut(query.uid) {
            q.security = q.security.transition(security);
        }
        self.note_result(query.uid, ResponseCode::NoError);
        self.resolve_query(query.uid);
        BeginOutcome::Progress
    }

    /// Feed a response (or its absence, on timeout) back into the task.
    pub fn ingest(&mut self, reply: Option<DnsPacket>, rtt: Option<Duration>) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let uid = pending.uid;
        if self.plan.find_uid(uid).is_none() {
            return;
        }

        let Some(pkt) = reply else {
            self.ctx
                .delegations
                .report_failure(&pending.zone_cut, &pending.ns_name);
            self.retry_query(uid, &pending.ns_name, MimirError::RetryBudgetExhausted);
            return;
        };

        // truncated UDP answer: same server again, over TCP
        if pkt.header.tc && pending.proto == Proto::Udp {
            debug!("[{}] truncated reply, retrying {} over TCP", uid, pending.ns_name);
            self.ctx
                .delegations
                .mark_tcp_only(&pending.zone_cut, &pending.ns_name);
            if let Some(q) = self.plan.find_uid_mut(uid) {
                q.flags.tcp = true;
                q.state = QueryState::Pending;
                q.touch();
            }
            return;
        }

        match pkt.header.response_code() {
            ResponseCode::NoError | ResponseCode::NameError => {}
            rcode => {
                debug!("[{}] lame answer {:?} from {}", uid, rcode, pending.ns_name);
                self.ctx
                    .delegations
                    .report_failure(&pending.zone_cut, &pending.ns_name);
                self.retry_query(uid, &pending.ns_name, MimirError::RetryBudgetExhausted);
                return;
            }
        }

        if let Some(rtt) = rtt {
            self.ctx
                .delegations
                .report_success(&pending.zone_cut, &pending.ns_name, rtt);
        }
        self.consume(uid, &pkt, &pending);
    }

    /// Exclude a server and either retry or give up on the sub-query.
    fn retry_query(&mut self, uid: u32, ns_name: &Name, exhausted: MimirError) {
        self.tried.entry(uid).or_default().push(ns_name.clone());
        let budget = self.ctx.config.retry_budget;
        let Some(q) = self.plan.find_uid_mut(uid) else {
            return;
        };
        q.retries += 1;
        q.touch();
        if q.retries >= budget {
            self.fail_query(uid, exhausted);
        } else {
            q.state = QueryState::Pending;
        }
    }

    fn consume(&mut self, uid: u32, pkt: &DnsPacket, pending: &PendingIo) {
        let Some(query) = self.view(uid) else { return };
        match classify(
            self.plan.find_uid(uid).expect("query viewed above"),
            pkt,
        ) {
            ResponseClass::Referral { cut } => self.handle_referral(uid, pkt, cut, pending),
            ResponseClass::Answer => self.handle_answer(&query, pkt),
            ResponseClass::Cname { target } => self.handle_cname(&query, pkt, target),
            ResponseClass::NxDomain => self.handle_negative(&query, pkt, true),
            ResponseClass::NoData => self.handle_negative(&query, pkt, false),
            ResponseClass::Lame => {
                self.ctx
                    .delegations
                    .report_failure(&pending.zone_cut, &pending.ns_name);
                self.retry_query(uid, &pending.ns_name, MimirError::RetryBudgetExhausted);
            }
        }
    }

    fn handle_referral(&mut self, uid: u32, pkt: &DnsPacket, new_cut: Name, pending: &PendingIo) {
        let Some(query) = self.view(uid) else { return };
        let current = query.zone_cut.clone().unwrap_or_else(Name::root);

        // the referral must descend toward the query name
        if new_cut == current || !new_cut.ends_with(&current) || !query.sname.ends_with(&new_cut) {
            debug!(
                "[{}] delegation {} does not refine {}, trying another server",
                uid, new_cut, current
            );
            self.ctx
                .delegations
                .report_failure(&pending.zone_cut, &pending.ns_name);
            self.retry_query(uid, &pending.ns_name, MimirError::RetryBudgetExhausted);
            return;
        }
        let Some(delegation) = extract_delegation(pkt, &new_cut) else {
            self.retry_query(uid, &pending.ns_name, MimirError::RetryBudgetExhausted);
            return;
        };
        self.ctx.delegations.insert(delegation);

        // with a secure parent, pin down the child's DS status right here
        let now = unix_now();
        if query.flags.want_dnssec && !query.flags.checking_disabled {
            if let Some(keys) = self.trusted_keys.get(&current.to_lowercase_wire()).cloned() {
                let has3 = denial::has_nsec3(pkt, Section::Authority);
                if let Some(ds_set) = find_rrset(pkt, Section::Authority, &new_cut, RecordType::Ds)
                {
                    match validate_rrset(
                        pkt,
                        Section::Authority,
                        &ds_set,
                        &keys,
                        &current,
                        now as u32,
                        has3,
                    ) {
                        Ok(()) => {
                            if let Some(txn) = self.txn.as_mut() {
                                txn.stash_rrset(&ds_set, Rank::Secure, SecurityState::Secure, now);
                            }
                            self.ctx.delegations.set_ds(&new_cut, Some(ds_set));
                            self.ctx
                                .delegations
                                .set_security(&new_cut, CutSecurity::Secure);
                        }
                        Err(err) => {
                            self.fail_query(uid, err);
                            return;
                        }
                    }
                } else {
                    // no DS: believe it only with a validated denial proof
                    let denial_types = [RecordType::Nsec, RecordType::Nsec3];
                    let denial_sets: Vec<RrSet> = group_records(pkt.section(Section::Authority))
                        .into_iter()
                        .filter(|set| denial_types.contains(&set.rtype))
                        .collect();
                    let signed = !denial_sets.is_empty()
                        && denial_sets.iter().all(|set| {
                            validate_rrset(
                                pkt,
                                Section::Authority,
                                set,
                                &keys,
                                &current,
                                now as u32,
                                has3,
                            )
                            .is_ok()
                        });
                    let proof = if has3 {
                        denial::nsec3_no_data_proof(pkt, Section::Authority, &new_cut, RecordType::Ds)
                    } else {
                        denial::nsec_no_data_proof(pkt, Section::Authority, &new_cut, RecordType::Ds)
                    };
                    if signed && proof.is_ok() {
                        debug!("[{}] {} is provably unsigned", uid, new_cut);
                        self.insecure_cuts.insert(new_cut.to_lowercase_wire());
                        self.ctx
                            .delegations
                            .set_security(&new_cut, CutSecurity::Insecure);
                    }
                    // otherwise the DS sub-query will settle it
                }
            }
        }

        // keep the NS set around for the final additional data
        if let Some(ns_set) = find_rrset(pkt, Section::Authority, &new_cut, RecordType::Ns) {
            if let Some(txn) = self.txn.as_mut() {
                txn.stash_rrset(&ns_set, Rank::Try, SecurityState::Indeterminate, now);
            }
            self.ranked
                .add(ns_set, Rank::Try, false, uid, Section::Authority);
        }

        if let Some(q) = self.plan.find_uid_mut(uid) {
            q.zone_cut = Some(new_cut);
            q.state = QueryState::Pending;
            q.touch();
        }
        // fresh server set, old strikes no longer apply
        self.tried.remove(&uid);
    }

    /// Rank, validate and stash one section's RR sets. Returns the reached
    /// security state, or the validation error that makes the data bogus.
    fn rank_and_stash_sets(
        &mut self,
        query: &QueryView,
        pkt: &DnsPacket,
        section: Section,
        is_relevant: &dyn Fn(&RrSet) -> bool,
        keys: Option<&RrSet>,
        cut: &Name,
        now: u64,
    ) -> Result<SecurityState> {
        let has3 = denial::has_nsec3(pkt, Section::Authority);
        let insecure = self.cut_is_insecure(cut);
        let wire_q = self.result_uids.contains(&query.uid);
        let mut reached = SecurityState::Indeterminate;

        for set in group_records(pkt.section(section)) {
            let relevant = is_relevant(&set);
            let (rank, security) = if set.rtype == RecordType::Rrsig {
                // signatures ride along with what they cover
                if keys.is_some() && relevant {
                    (Rank::Secure, SecurityState::Secure)
                } else {
                    (Rank::Try, SecurityState::Indeterminate)
                }
            } else if relevant {
                if let Some(keys) = keys {
                    validate_rrset(pkt, section, &set, keys, cut, now as u32, has3)?;
                    reached = reached.transition(SecurityState::Secure);
                    (Rank::Secure, SecurityState::Secure)
                } else if insecure {
                    reached = reached.transition(SecurityState::Insecure);
                    (Rank::Insecure, SecurityState::Insecure)
                } else {
                    (Rank::Try, SecurityState::Indeterminate)
                }
            } else {
                (Rank::Try, SecurityState::Indeterminate)
            };

            if let Some(txn) = self.txn.as_mut() {
                txn.stash_rrset(&set, rank, security, now);
            }
            self.ranked
                .add(set, rank, relevant && wire_q, query.uid, section);
        }
        Ok(reached)
    }

    fn cut_is_insecure(&self, cut: &Name) -> bool {
        self.insecure_cuts.contains(&cut.to_lowercase_wire())
            || self
                .ctx
                .delegations
                .get(cut)
                .is_some_and(|d| d.security == CutSecurity::Insecure)
    }

    fn validation_keys(&self, query: &QueryView, cut: &Name) -> Option<RrSet> {
        if !query.flags.want_dnssec || query.flags.checking_disabled {
            return None;
        }
        self.trusted_keys.get(&cut.to_lowercase_wire()).cloned()
    }

    fn handle_answer(&mut self, query: &QueryView, pkt: &DnsPacket) {
        let now = unix_now();
        let cut = query.zone_cut.clone().unwrap_or_else(Name::root);

        // trust establishment for a DNSKEY fetch at the cut itself
        if query.stype == RecordType::Dnskey && query.sname == cut {
            self.establish_keys(query, pkt, &cut, now);
            return;
        }
        // DS answers resolve in the parent zone and feed the delegation map
        if query.stype == RecordType::Ds {
            self.ingest_ds_answer(query, pkt, &cut, now);
            return;
        }

        let keys = self.validation_keys(query, &cut);
        let sname = query.sname.clone();
        let relevant = move |set: &RrSet| set.owner == sname;
        let reached = match self.rank_and_stash_sets(
            query,
            pkt,
            Section::Answer,
            &relevant,
            keys.as_ref(),
            &cut,
            now,
        ) {
            Ok(state) => state,
            Err(err) => {
                self.fail_query(query.uid, err);
                return;
            }
        };
        // authority and additional data are useful but never authoritative here
        let nothing = |_: &RrSet| false;
        let _ = self.rank_and_stash_sets(query, pkt, Section::Authority, &nothing, None, &cut, now);
        let _ = self.rank_and_stash_sets(query, pkt, Section::Additional, &nothing, None, &cut, now);

        if query.flags.addr_fetch {
            if let Some(rrset) = find_rrset(pkt, Section::Answer, &query.sname, query.stype) {
                self.feed_parent_addresses(query, &rrset);
            }
        }

        if let Some(q) = self.plan.find_uid_mut(query.uid) {
            q.security = q.security.transition(reached);
        }
        self.note_result(query.uid, ResponseCode::NoError);
        self.resolve_query(query.uid);
    }

    fn establish_keys(&mut self, query: &QueryView, pkt: &DnsPacket, cut: &Name, now: u64) {
        let Some(keys_set) = find_rrset(pkt, Section::Answer, cut, RecordType::Dnskey) else {
            self.fail_query(query.uid, MimirError::NoDnsKey);
            return;
        };
        let mut anchors: Vec<TrustAnchor> = self
            .ctx
            .trust_anchors
            .anchors_at(cut)
            .unwrap_or_default();
        if anchors.is_empty() {
            if let Some(ds_set) = self.ctx.delegations.get(cut).and_then(|d| d.ds) {
                for rdata in &ds_set.rdatas {
                    if let Ok(ds) = crate::dns::record::Ds::parse(rdata) {
                        anchors.push(TrustAnchor::from_ds(cut.clone(), &ds));
                    }
                }
            }
        }
        let has3 = denial::has_nsec3(pkt, Section::Authority);
        match dnskeys_trusted(pkt, Section::Answer, &keys_set, &anchors, cut, now as u32, has3) {
            Ok(()) => {
                self.trusted_keys
                    .insert(cut.to_lowercase_wire(), keys_set.clone());
                self.ctx.delegations.set_security(cut, CutSecurity::Secure);
                if let Some(txn) = self.txn.as_mut() {
                    txn.stash_rrset(&keys_set, Rank::Secure, SecurityState::Secure, now);
                }
                let to_wire = self.result_uids.contains(&query.uid);
                self.ranked
                    .add(keys_set, Rank::Secure, to_wire, query.uid, Section::Answer);
                if let Some(q) = self.plan.find_uid_mut(query.uid) {
                    q.security = q.security.transition(SecurityState::Secure);
                }
                self.note_result(query.uid, ResponseCode::NoError);
                self.resolve_query(query.uid);
            }
            Err(err) => self.fail_query(query.uid, err),
        }
    }

    fn ingest_ds_answer(&mut self, query: &QueryView, pkt: &DnsPacket, parent_cut: &Name, now: u64) {
        let Some(ds_set) = find_rrset(pkt, Section::Answer, &query.sname, RecordType::Ds) else {
            self.fail_query(query.uid, MimirError::NoDs);
            return;
        };
        let keys = self.validation_keys(query, parent_cut);
        if let Some(keys) = keys.as_ref() {
            let has3 = denial::has_nsec3(pkt, Section::Authority);
            if let Err(err) = validate_rrset(
                pkt,
                Section::Answer,
                &ds_set,
                keys,
                parent_cut,
                now as u32,
                has3,
            ) {
                self.fail_query(query.uid, err);
                return;
            }
        }
        let child = query.sname.clone();
        if self.ctx.delegations.get(&child).is_none() {
            self.ctx
                .delegations
                .insert(crate::delegation::Delegation::new(child.clone()));
        }
        if let Some(txn) = self.txn.as_mut() {
            txn.stash_rrset(&ds_set, Rank::Secure, SecurityState::Secure, now);
        }
        self.ctx.delegations.set_ds(&child, Some(ds_set));
        if keys.is_some() {
            self.ctx.delegations.set_security(&child, CutSecurity::Secure);
        }
        if let Some(q) = self.plan.find_uid_mut(query.uid) {
            q.security = q.security.transition(SecurityState::Secure);
        }
        self.note_result(query.uid, ResponseCode::NoError);
        self.resolve_query(query.uid);
    }

    fn handle_cname(&mut self, query: &QueryView, pkt: &DnsPacket, target: Name) {
        // key material must live at the owner itself; a CNAME here is a
        // broken zone, not a chain to follow
        if query.parent.is_some()
            && matches!(query.stype, RecordType::Dnskey | RecordType::Ds)
            && !query.flags.addr_fetch
        {
            let err = if query.stype == RecordType::Dnskey {
                MimirError::NoDnsKey
            } else {
                MimirError::NoDs
            };
            self.fail_query(query.uid, err);
            return;
        }
        let now = unix_now();
        let cut = query.zone_cut.clone().unwrap_or_else(Name::root);
        let keys = self.validation_keys(query, &cut);
        let sname = query.sname.clone();
        // the chain link and its signature go to the wire; pre-chased data
        // stays glue until its own query picks it up
        let relevant = move |set: &RrSet| {
            set.owner == sname
                && matches!(
                    set.rtype,
                    RecordType::Cname | RecordType::Dname | RecordType::Rrsig
                )
        };
        let reached = match self.rank_and_stash_sets(
            query,
            pkt,
            Section::Answer,
            &relevant,
            keys.as_ref(),
            &cut,
            now,
        ) {
            Ok(state) => state,
            Err(err) => {
                self.fail_query(query.uid, err);
                return;
            }
        };

        let depth = query.cname_depth + 1;
        if depth > self.ctx.config.max_cname_chain {
            warn!("[{}] CNAME chain exceeded {} links", query.uid, self.ctx.config.max_cname_chain);
            self.fail_query(query.uid, MimirError::ChainLimitExceeded);
            return;
        }

        debug!("[{}] chasing {} -> {}", query.uid, query.sname, target);
        let flags = QueryFlags {
            tcp: false,
            addr_fetch: false,
            ..query.flags
        };
        match self
            .plan
            .push(target, query.stype, query.sclass, Some(query.uid), flags, now)
        {
            Ok(child) => {
                if let Some(q) = self.plan.find_uid_mut(child) {
                    q.cname_depth = depth;
                }
                if self.result_uids.contains(&query.uid) {
                    self.result_uids.push(child);
                }
            }
            Err(err) => {
                self.fail_query(query.uid, err);
                return;
            }
        }

        if let Some(q) = self.plan.find_uid_mut(query.uid) {
            q.security = q.security.transition(reached);
        }
        self.note_result(query.uid, ResponseCode::NoError);
        self.resolve_query(query.uid);
    }

    fn handle_negative(&mut self, query: &QueryView, pkt: &DnsPacket, nxdomain: bool) {
        let now = unix_now();
        let cut = query.zone_cut.clone().unwrap_or_else(Name::root);
        let keys = self.validation_keys(query, &cut);

        // the denial material (SOA, NSEC, NSEC3 and their signatures) backs
        // the negative answer
        let relevant = |set: &RrSet| {
            matches!(
                set.rtype,
                RecordType::Soa | RecordType::Nsec | RecordType::Nsec3 | RecordType::Rrsig
            )
        };
        let mut reached = match self.rank_and_stash_sets(
            query,
            pkt,
            Section::Authority,
            &relevant,
            keys.as_ref(),
            &cut,
            now,
        ) {
            Ok(state) => state,
            Err(err) => {
                self.fail_query(query.uid, err);
                return;
            }
        };

        if keys.is_some() {
            // signed zone: the denial must actually prove something
            if let Err(err) = denial::validate_denial(pkt, &query.sname, query.stype) {
                self.fail_query(query.uid, err);
                return;
            }
            reached = reached.transition(SecurityState::Secure);
        } else if self.cut_is_insecure(&cut) {
            reached = reached.transition(SecurityState::Insecure);
        }

        // a missing DS marks the child zone as provably unsigned
        if query.stype == RecordType::Ds {
            if keys.is_some() || !query.flags.want_dnssec {
                debug!("[{}] no DS for {}, subtree is insecure", query.uid, query.sname);
                self.insecure_cuts.insert(query.sname.to_lowercase_wire());
                if self.ctx.delegations.get(&query.sname).is_none() {
                    self.ctx
                        .delegations
                        .insert(crate::delegation::Delegation::new(query.sname.clone()));
                }
                self.ctx
                    .delegations
                    .set_security(&query.sname, CutSecurity::Insecure);
            }
        }

        // a signed zone without DNSKEY data is broken, not empty
        if query.stype == RecordType::Dnskey
            && query.sname == cut
            && query.parent.is_some()
            && query.flags.want_dnssec
            && !self.cut_is_insecure(&cut)
        {
            self.fail_query(query.uid, MimirError::NoDnsKey);
            return;
        }

        if query.flags.addr_fetch {
            if let Some(parent) = query.parent {
                self.tried.entry(parent).or_default().push(query.sname.clone());
            }
        }

        if let Some(q) = self.plan.find_uid_mut(query.uid) {
            q.security = q.security.transition(reached);
        }
        self.note_result(
            query.uid,
            if nxdomain {
                ResponseCode::NameError
            } else {
                ResponseCode::NoError
            },
        );
        self.resolve_query(query.uid);
    }

    fn feed_parent_addresses(&mut self, query: &QueryView, rrset: &RrSet) {
        let Some(parent) = query.parent else { return };
        let parent_cut = self
            .plan
            .find_uid(parent)
            .or_else(|| self.plan.find_resolved(parent))
            .and_then(|q| q.zone_cut.clone());
        let Some(parent_cut) = parent_cut else { return };
        for record in rrset.records() {
            let addr = record
                .a_addr()
                .map(std::net::IpAddr::V4)
                .or_else(|| record.aaaa_addr().map(std::net::IpAddr::V6));
            if let Some(addr) = addr {
                self.ctx
                    .delegations
                    .add_address(&parent_cut, &query.sname, addr);
            }
        }
    }

    /// Record the final rcode and security once a result-forming query ends.
    /// The response is only as secure as the weakest link of the chain: any
    /// unvalidated link clears SECURE, and BOGUS absorbs everything.
    fn note_result(&mut self, uid: u32, rcode: ResponseCode) {
        if !self.result_uids.contains(&uid) {
            return;
        }
        self.final_rcode = rcode;
        let Some(link) = self.plan.find_uid(uid).map(|q| q.security) else {
            return;
        };
        self.final_security = match (self.final_security, link) {
            (SecurityState::Bogus, _) | (_, SecurityState::Bogus) => SecurityState::Bogus,
            (SecurityState::Indeterminate, next) => next,
            (_, SecurityState::Indeterminate) => SecurityState::Indeterminate,
            (SecurityState::Insecure, _) | (_, SecurityState::Insecure) => SecurityState::Insecure,
            (SecurityState::Secure, SecurityState::Secure) => SecurityState::Secure,
        };
    }

    fn resolve_query(&mut self, uid: u32) {
        self.tried.remove(&uid);
        self.plan.resolve(uid);
    }

    /// Drop a failed sub-query. Address fetches only strike their server;
    /// everything else unwinds the request into SERVFAIL.
    fn fail_query(&mut self, uid: u32, err: MimirError) {
        let view = self.view(uid);
        if let Some(view) = &view {
            if view.flags.addr_fetch {
                if let Some(parent) = view.parent {
                    debug!("[{}] address fetch for {} failed: {}", uid, view.sname, err);
                    self.tried.entry(parent).or_default().push(view.sname.clone());
                    self.plan.fail(uid);
                    return;
                }
            }
        }

        warn!("[{}] query failed: {}", uid, err);
        self.final_rcode = ResponseCode::ServerFailure;
        self.final_security = match err.kind() {
            ErrorKind::CryptoBogus => SecurityState::Bogus,
            _ => SecurityState::Indeterminate,
        };
        self.extended_error = Some(extended_error_for(&err));
        self.plan.clear();
    }

    /// Assemble the response, set AD, and settle the cache transaction.
    fn finalize(&mut self) -> Resolution {
        let mut response = self.request.create_response();
        let dnssec_ok = self.request.do_flag();

        for entry in self.ranked.wire_entries() {
            if !dnssec_ok
                && matches!(
                    entry.rrset.rtype,
                    RecordType::Rrsig | RecordType::Nsec | RecordType::Nsec3
                )
            {
                continue;
            }
            for record in entry.rrset.records() {
                response.put_record(entry.section, record);
            }
        }

        response.set_rcode(self.final_rcode);
        let positive = matches!(
            self.final_rcode,
            ResponseCode::NoError | ResponseCode::NameError
        );
        response.header.ad = positive
            && self.final_security == SecurityState::Secure
            && !self.request.header.cd
            && (dnssec_ok || self.request.header.ad);
        if self.final_rcode == ResponseCode::ServerFailure {
            if let Some(code) = self.extended_error {
                response.set_extended_error(code, "");
            }
        }
        response.update_counts();

        if let Some(txn) = self.txn.take() {
            let result = if self.final_rcode == ResponseCode::ServerFailure {
                txn.commit_validated()
            } else {
                txn.commit()
            };
            if let Err(err) = result {
                warn!("cache commit failed: {}", err);
            }
        }
        self.finished = true;
        debug!(
            "request done: {:?}, security {:?}",
            self.final_rcode, self.final_security
        );
        Resolution {
            answer: response,
            rcode: self.final_rcode,
            security: self.final_security,
            extended_error: self.extended_error,
        }
    }
}

fn extended_error_for(err: &MimirError) -> ExtendedErrorCode {
    match err {
        MimirError::SignatureExpired => ExtendedErrorCode::SignatureExpired,
        MimirError::SignatureNotYetValid => ExtendedErrorCode::SignatureNotYetValid,
        MimirError::NoDnsKey => ExtendedErrorCode::DnskeyMissing,
        MimirError::NoRrsig => ExtendedErrorCode::RrsigsMissing,
        MimirError::DenialOfExistenceFailed => ExtendedErrorCode::NsecMissing,
        MimirError::Timeout | MimirError::RetryBudgetExhausted | MimirError::NoNameServer(_) => {
            ExtendedErrorCode::NoReachableAuthority
        }
        MimirError::Network(_) | MimirError::Io(_) | MimirError::IoError(_) => {
            ExtendedErrorCode::NetworkError
        }
        other => match other.kind() {
            ErrorKind::CryptoBogus => ExtendedErrorCode::DnssecBogus,
            ErrorKind::CryptoInsecure => ExtendedErrorCode::DnssecIndeterminate,
            _ => ExtendedErrorCode::Other,
        },
    }
}
