use crate::dns::rrset::RrSet;
use crate::dns::Name;
use crate::random::RandomPool;
use dashmap::DashMap;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, trace};

/// RTT estimate used for servers never measured.
const UNKNOWN_RTT_MS: f64 = 400.0;
/// Score penalty per consecutive failure.
const FAILURE_PENALTY_MS: f64 = 250.0;
/// Score penalty for servers we have no address for yet.
const NO_ADDRESS_PENALTY_MS: f64 = 1_000.0;
/// Ceiling for the smoothed RTT after timeout doubling.
const MAX_SRTT_MS: f64 = 10_000.0;

/// One name server of a delegation, with its quality stats.
#[derive(Debug, Clone)]
pub struct NameServer {
    pub name: Name,
    pub addrs: Vec<IpAddr>,
    /// Exponentially smoothed RTT in milliseconds.
    pub srtt_ms: Option<f64>,
    pub consecutive_failures: u32,
    /// Set after a truncated reply; all further talk goes over TCP.
    pub tcp_only: bool,
}

impl NameServer {
    pub fn new(name: Name) -> Self {
        NameServer {
            name,
            addrs: Vec::new(),
            srtt_ms: None,
            consecutive_failures: 0,
            tcp_only: false,
        }
    }

    fn record_success(&mut self, rtt: Duration) {
        let sample = rtt.as_secs_f64() * 1000.0;
        self.srtt_ms = Some(match self.srtt_ms {
            // EMA weighted toward recent responses
            Some(current) => current * 0.8 + sample * 0.2,
            None => sample,
        });
        self.consecutive_failures = 0;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        // a timed-out server looks twice as slow until it proves otherwise
        self.srtt_ms = Some(
            (self.srtt_ms.unwrap_or(UNKNOWN_RTT_MS) * 2.0).min(MAX_SRTT_MS),
        );
    }

    fn score(&self) -> f64 {
        let mut score = self.srtt_ms.unwrap_or(UNKNOWN_RTT_MS);
        score += self.consecutive_failures as f64 * FAILURE_PENALTY_MS;
        if self.addrs.is_empty() {
            score += NO_ADDRESS_PENALTY_MS;
        }
        score
    }

    fn addr_in_family(&self, want_v6: bool) -> Option<IpAddr> {
        self.addrs
            .iter()
            .find(|addr| addr.is_ipv6() == want_v6)
            .copied()
    }
}

/// Security mark of a zone cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutSecurity {
    Unknown,
    Secure,
    /// Proven unsigned: NSEC/NSEC3 denied the DS under a secure parent.
    Insecure,
}

/// A zone cut with its name-server set and DNSSEC status.
#[derive(Debug, Clone)]
pub struct Delegation {
    pub cut: Name,
    pub servers: Vec<NameServer>,
    pub security: CutSecurity,
    /// Validated DS set for the cut; `None` with `Insecure` means proven
    /// absent.
    pub ds: Option<RrSet>,
}

impl Delegation {
    pub fn new(cut: Name) -> Self {
        Delegation {
            cut,
            servers: Vec::new(),
            security: CutSecurity::Unknown,
            ds: None,
        }
    }

    pub fn add_server(&mut self, name: Name) -> &mut NameServer {
        if let Some(pos) = self.servers.iter().position(|ns| ns.name == name) {
            &mut self.servers[pos]
        } else {
            self.servers.push(NameServer::new(name));
            self.servers.last_mut().expect("just pushed")
        }
    }
}

/// A server chosen for one outbound query.
#[derive(Debug, Clone)]
pub struct SelectedServer {
    pub name: Name,
    pub addr: Option<IpAddr>,
    pub tcp_only: bool,
}

/// Shared cache of zone cuts, keyed by the lowercased cut name.
///
/// Lookups clone a snapshot, so concurrent requests never observe a
/// delegation mid-mutation; stat updates go through the map again.
pub struct DelegationMap {
    cuts: DashMap<Vec<u8>, Delegation>,
}

impl DelegationMap {
    pub fn new() -> Self {
        DelegationMap {
            cuts: DashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cuts.is_empty()
    }

    fn key(cut: &Name) -> Vec<u8> {
        cut.to_lowercase_wire()
    }

    /// Insert or merge a delegation. Stats of servers already known at the
    /// cut survive, so a referral refresh does not erase RTT history.
    pub fn insert(&self, delegation: Delegation) {
        let key = Self::key(&delegation.cut);
        match self.cuts.get_mut(&key) {
            Some(mut existing) => {
                for server in delegation.servers {
                    let slot = existing.add_server(server.name.clone());
                    for addr in server.addrs {
                        if !slot.addrs.contains(&addr) {
                            slot.addrs.push(addr);
                        }
                    }
                }
                if delegation.security != CutSecurity::Unknown {
                    existing.security = delegation.security;
                }
                if delegation.ds.is_some() {
                    existing.ds = delegation.ds;
                }
            }
            None => {
                self.cuts.insert(key, delegation);
            }
        }
    }

    /// Longest matching zone cut for `name`, walking label by label toward
    /// the root. Returns a snapshot.
    pub fn lookup(&self, name: &Name) -> Option<Delegation> {
        let mut cursor = Some(name.clone());
        while let Some(current) = cursor {
            if let Some(found) = self.cuts.get(&Self::key(&current)) {
                trace!("zone cut for {} is {}", name, found.cut);
                return Some(found.clone());
            }
            cursor = current.parent();
        }
        None
    }

    pub fn get(&self, cut: &Name) -> Option<Delegation> {
        self.cuts.get(&Self::key(cut)).map(|d| d.clone())
    }

    /// Pick the best server of the cut, skipping `exclude`.
    ///
    /// Preference order: requested address family first, then the lowest
    /// score (smoothed RTT plus failure and addressless penalties), with
    /// uniform random tie-breaking among equals.
    pub fn select_ns(
        &self,
        cut: &Name,
        exclude: &[Name],
        prefer_v6: bool,
        random: &RandomPool,
    ) -> Option<SelectedServer> {
        let delegation = self.get(cut)?;
        let viable: Vec<&NameServer> = delegation
            .servers
            .iter()
            .filter(|ns| !exclude.contains(&ns.name))
            .collect();
        if viable.is_empty() {
            return None;
        }

        // family preference is a strict tier, score decides within a tier
        let tiered: Vec<(&NameServer, bool)> = viable
            .iter()
            .map(|ns| (*ns, ns.addr_in_family(prefer_v6).is_some()))
            .collect();
        let candidates: Vec<&NameServer> = if tiered.iter().any(|(_, in_family)| *in_family) {
            tiered
                .iter()
                .filter(|(_, in_family)| *in_family)
                .map(|(ns, _)| *ns)
                .collect()
        } else {
            viable
        };

        let best = candidates
            .iter()
            .map(|ns| ns.score())
            .fold(f64::INFINITY, f64::min);
        let ties: Vec<&NameServer> = candidates
            .into_iter()
            .filter(|ns| ns.score() <= best)
            .collect();
        let chosen = ties[random.pick(ties.len())];

        let addr = chosen
            .addr_in_family(prefer_v6)
            .or_else(|| chosen.addrs.first().copied());
        Some(SelectedServer {
            name: chosen.name.clone(),
            addr,
            tcp_only: chosen.tcp_only,
        })
    }

    fn with_server<F: FnOnce(&mut NameServer)>(&self, cut: &Name, ns: &Name, apply: F) {
        if let Some(mut delegation) = self.cuts.get_mut(&Self::key(cut)) {
            if let Some(server) = delegation.servers.iter_mut().find(|s| s.name == *ns) {
                apply(server);
            }
        }
    }

    pub fn report_success(&self, cut: &Name, ns: &Name, rtt: Duration) {
        self.with_server(cut, ns, |server| server.record_success(rtt));
    }

    pub fn report_failure(&self, cut: &Name, ns: &Name) {
        self.with_server(cut, ns, |server| {
            server.record_failure();
            debug!(
                "penalized {} ({} consecutive failures)",
                server.name, server.consecutive_failures
            );
        });
    }

    pub fn mark_tcp_only(&self, cut: &Name, ns: &Name) {
        self.with_server(cut, ns, |server| server.tcp_only = true);
    }

    /// Add a resolved address for a glue-less server.
    pub fn add_address(&self, cut: &Name, ns: &Name, addr: IpAddr) {
        self.with_server(cut, ns, |server| {
            if !server.addrs.contains(&addr) {
                server.addrs.push(addr);
            }
        });
    }

    pub fn set_security(&self, cut: &Name, security: CutSecurity) {
        if let Some(mut delegation) = self.cuts.get_mut(&Self::key(cut)) {
            delegation.security = security;
        }
    }

    pub fn set_ds(&self, cut: &Name, ds: Option<RrSet>) {
        if let Some(mut delegation) = self.cuts.get_mut(&Self::key(cut)) {
            delegation.ds = ds;
        }
    }

    /// Seed the map with the root server hints if the root cut is missing.
    pub fn install_root_hints(&self) {
        let root = Name::root();
        if self.cuts.contains_key(&Self::key(&root)) {
            return;
        }
        let mut delegation = Delegation::new(root);
        for (host, v4, v6) in ROOT_HINTS {
            let name: Name = host.parse().expect("static root hint name");
            let server = delegation.add_server(name);
            server.addrs.push(v4.parse().expect("static root hint v4"));
            server.addrs.push(v6.parse().expect("static root hint v6"));
        }
        debug!("installed root hints ({} servers)", delegation.servers.len());
        self.insert(delegation);
    }
}

impl Default for DelegationMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Root name servers, 2024 addresses.
const ROOT_HINTS: [(&str, &str, &str); 13] = [
    ("a.root-servers.net", "198.41.0.4", "2001:503:ba3e::2:30"),
    ("b.root-servers.net", "170.247.170.2", "2801:1b8:10::b"),
    ("c.root-servers.net", "192.33.4.12", "2001:500:2::c"),
    ("d.root-servers.net", "199.7.91.13", "2001:500:2d::d"),
    ("e.root-servers.net", "192.203.230.10", "2001:500:a8::e"),
    ("f.root-servers.net", "192.5.5.241", "2001:500:2f::f"),
    ("g.root-servers.net", "192.112.36.4", "2001:500:12::d0d"),
    ("h.root-servers.net", "198.97.190.53", "2001:500:1::53"),
    ("i.root-servers.net", "192.36.148.17", "2001:7fe::53"),
    ("j.root-servers.net", "192.58.128.30", "2001:503:c27::2:30"),
    ("k.root-servers.net", "193.0.14.129", "2001:7fd::1"),
    ("l.root-servers.net", "199.7.83.42", "2001:500:9f::42"),
    ("m.root-servers.net", "202.12.27.33", "2001:dc3::35"),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    fn map_with_cut(cut: &str, servers: &[(&str, Option<&str>)]) -> DelegationMap {
        let map = DelegationMap::new();
        let mut delegation = Delegation::new(name(cut));
        for (ns, addr) in servers {
            let server = delegation.add_server(name(ns));
            if let Some(addr) = addr {
                server.addrs.push(addr.parse().unwrap());
            }
        }
        map.insert(delegation);
        map
    }

    #[test]
    fn lookup_finds_longest_match() {
        let map = DelegationMap::new();
        map.install_root_hints();
        map.insert(Delegation::new(name("com")));
        map.insert(Delegation::new(name("example.com")));

        assert_eq!(
            map.lookup(&name("www.example.com")).unwrap().cut,
            name("example.com")
        );
        assert_eq!(map.lookup(&name("other.org")).unwrap().cut, Name::root());
    }

    #[test]
    fn root_hints_installed_once() {
        let map = DelegationMap::new();
        map.install_root_hints();
        let root = map.get(&Name::root()).unwrap();
        assert_eq!(root.servers.len(), 13);
        map.install_root_hints();
        assert_eq!(map.get(&Name::root()).unwrap().servers.len(), 13);
    }

    #[test]
    fn selection_skips_excluded_and_penalized() {
        let map = map_with_cut(
            "example.com",
            &[
                ("ns1.example.com", Some("192.0.2.1")),
                ("ns2.example.com", Some("192.0.2.2")),
            ],
        );
        let cut = name("example.com");
        let random = RandomPool::new();

        // make ns1 clearly better
        map.report_success(&cut, &name("ns1.example.com"), Duration::from_millis(10));
        map.report_success(&cut, &name("ns2.example.com"), Duration::from_millis(300));
        let picked = map.select_ns(&cut, &[], false, &random).unwrap();
        assert_eq!(picked.name, name("ns1.example.com"));

        // excluding the winner forces the alternative
        let picked = map
            .select_ns(&cut, &[name("ns1.example.com")], false, &random)
            .unwrap();
        assert_eq!(picked.name, name("ns2.example.com"));

        // every server excluded: nothing to pick
        assert!(map
            .select_ns(
                &cut,
                &[name("ns1.example.com"), name("ns2.example.com")],
                false,
                &random
            )
            .is_none());
    }

    #[test]
    fn failures_raise_the_score() {
        let map = map_with_cut(
            "example.com",
            &[
                ("ns1.example.com", Some("192.0.2.1")),
                ("ns2.example.com", Some("192.0.2.2")),
            ],
        );
        let cut = name("example.com");
        let random = RandomPool::new();
        map.report_success(&cut, &name("ns1.example.com"), Duration::from_millis(50));
        map.report_success(&cut, &name("ns2.example.com"), Duration::from_millis(50));
        for _ in 0..3 {
            map.report_failure(&cut, &name("ns1.example.com"));
        }
        let failures = map
            .get(&cut)
            .unwrap()
            .servers
            .iter()
            .find(|s| s.name == name("ns1.example.com"))
            .unwrap()
            .consecutive_failures;
        assert_eq!(failures, 3);
        for _ in 0..20 {
            let picked = map.select_ns(&cut, &[], false, &random).unwrap();
            assert_eq!(picked.name, name("ns2.example.com"));
        }
        // success resets the penalty
        map.report_success(&cut, &name("ns1.example.com"), Duration::from_millis(1));
        let delegation = map.get(&cut).unwrap();
        let ns1 = delegation
            .servers
            .iter()
            .find(|s| s.name == name("ns1.example.com"))
            .unwrap();
        assert_eq!(ns1.consecutive_failures, 0);
    }

    #[test]
    fn family_preference_is_a_strict_tier() {
        let map = map_with_cut("example.com", &[("ns-v4.example.com", Some("192.0.2.1"))]);
        let cut = name("example.com");
        let mut delegation = Delegation::new(cut.clone());
        delegation
            .add_server(name("ns-v6.example.com"))
            .addrs
            .push("2001:db8::1".parse().unwrap());
        map.insert(delegation);
        let random = RandomPool::new();

        // even a slower v6 server wins under v6 preference
        map.report_success(&cut, &name("ns-v6.example.com"), Duration::from_millis(500));
        map.report_success(&cut, &name("ns-v4.example.com"), Duration::from_millis(5));
        let picked = map.select_ns(&cut, &[], true, &random).unwrap();
        assert_eq!(picked.name, name("ns-v6.example.com"));
        assert!(picked.addr.unwrap().is_ipv6());
    }

    #[test]
    fn merge_preserves_stats() {
        let map = map_with_cut("example.com", &[("ns1.example.com", Some("192.0.2.1"))]);
        let cut = name("example.com");
        map.report_success(&cut, &name("ns1.example.com"), Duration::from_millis(42));

        // a fresh referral for the same cut arrives
        let mut refresh = Delegation::new(cut.clone());
        refresh.add_server(name("ns1.example.com"));
        refresh.add_server(name("ns2.example.com"));
        map.insert(refresh);

        let delegation = map.get(&cut).unwrap();
        assert_eq!(delegation.servers.len(), 2);
        let ns1 = delegation
            .servers
            .iter()
            .find(|s| s.name == name("ns1.example.com"))
            .unwrap();
        assert!(ns1.srtt_ms.is_some());
        assert_eq!(ns1.addrs.len(), 1);
    }

    #[test]
    fn tcp_only_marking() {
        let map = map_with_cut("example.com", &[("ns1.example.com", Some("192.0.2.1"))]);
        let cut = name("example.com");
        map.mark_tcp_only(&cut, &name("ns1.example.com"));
        let random = RandomPool::new();
        let picked = map.select_ns(&cut, &[], false, &random).unwrap();
        assert!(picked.tcp_only);
    }
}
