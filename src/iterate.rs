use crate::delegation::Delegation;
use crate::dns::enums::{RecordClass, RecordType, ResponseCode};
use crate::dns::packet::{DnsPacket, Section};
use crate::dns::rrset::{group_records, RrSet};
use crate::dns::Name;
use crate::plan::Query;
use std::net::IpAddr;
use tracing::{debug, trace};

/// What one response means for the query that solicited it.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseClass {
    /// Records for (sname, stype) are in the answer section.
    Answer,
    /// The chain continues at `target` (CNAME, or DNAME-synthesized).
    Cname { target: Name },
    /// The server handed us a deeper delegation.
    Referral { cut: Name },
    /// The name provably does not exist.
    NxDomain,
    /// The name exists but carries no data of the asked type.
    NoData,
    /// The server refused, failed, or answered something unusable.
    Lame,
}

/// Classify a response against the query it answers.
pub fn classify(query: &Query, pkt: &DnsPacket) -> ResponseClass {
    match pkt.header.response_code() {
        ResponseCode::NoError | ResponseCode::NameError => {}
        _ => return ResponseClass::Lame,
    }

    // a direct answer for the asked type wins over everything
    if find_rrset(pkt, Section::Answer, &query.sname, query.stype).is_some() {
        return ResponseClass::Answer;
    }

    // CNAME at the query name restarts the chase
    if query.stype != RecordType::Cname {
        if let Some(cname) = find_rrset(pkt, Section::Answer, &query.sname, RecordType::Cname) {
            if let Some(target) = single_rdata_name(&cname) {
                return ResponseClass::Cname { target };
            }
            return ResponseClass::Lame;
        }
        // DNAME above the query name synthesizes a CNAME
        for rrset in group_records(pkt.section(Section::Answer)) {
            if rrset.rtype == RecordType::Dname
                && query.sname.ends_with(&rrset.owner)
                && query.sname != rrset.owner
            {
                if let Some(dname_target) = single_rdata_name(&rrset) {
                    if let Ok(target) = query.sname.replace_suffix(&rrset.owner, &dname_target) {
                        debug!("DNAME {} rewrites {} to {}", rrset.owner, query.sname, target);
                        return ResponseClass::Cname { target };
                    }
                }
                return ResponseClass::Lame;
            }
        }
    }

    if pkt.header.response_code() == ResponseCode::NameError {
        return ResponseClass::NxDomain;
    }

    // no answer: SOA means an authoritative empty answer, NS a referral
    let authority_sets = group_records(pkt.section(Section::Authority));
    if authority_sets.iter().any(|s| s.rtype == RecordType::Soa) {
        return ResponseClass::NoData;
    }
    if let Some(ns_set) = authority_sets.iter().find(|s| s.rtype == RecordType::Ns) {
        // a referral only makes sense toward the query name
        if query.sname.ends_with(&ns_set.owner) {
            return ResponseClass::Referral {
                cut: ns_set.owner.clone(),
            };
        }
        trace!(
            "NS owner {} is no ancestor of {}, lame referral",
            ns_set.owner, query.sname
        );
        return ResponseClass::Lame;
    }

    ResponseClass::Lame
}

/// The grouped RR set for (owner, rtype) in a section, if present.
pub fn find_rrset(
    pkt: &DnsPacket,
    section: Section,
    owner: &Name,
    rtype: RecordType,
) -> Option<RrSet> {
    group_records(pkt.section(section))
        .into_iter()
        .find(|set| set.rtype == rtype && set.owner == *owner)
}

fn single_rdata_name(rrset: &RrSet) -> Option<Name> {
    let rdata = rrset.rdatas.first()?;
    Name::parse(rdata, 0).ok().map(|(name, _)| name)
}

/// Build the delegation described by a referral: the NS set at `cut` plus
/// any glue addresses from the additional section.
pub fn extract_delegation(pkt: &DnsPacket, cut: &Name) -> Option<Delegation> {
    let ns_set = find_rrset(pkt, Section::Authority, cut, RecordType::Ns)?;
    let mut delegation = Delegation::new(cut.clone());
    for rdata in &ns_set.rdatas {
        let Ok((ns_name, _)) = Name::parse(rdata, 0) else {
            continue;
        };
        let server = delegation.add_server(ns_name.clone());
        for glue in pkt.section(Section::Additional) {
            if glue.name != ns_name || glue.rclass != RecordClass::In {
                continue;
            }
            let addr: Option<IpAddr> = glue
                .a_addr()
                .map(IpAddr::V4)
                .or_else(|| glue.aaaa_addr().map(IpAddr::V6));
            if let Some(addr) = addr {
                if !server.addrs.contains(&addr) {
                    server.addrs.push(addr);
                }
            }
        }
    }
    if delegation.servers.is_empty() {
        return None;
    }
    debug!(
        "referral: {} delegated to {} servers",
        cut,
        delegation.servers.len()
    );
    Some(delegation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::header::DnsHeader;
    use crate::dns::question::DnsQuestion;
    use crate::dns::record::DnsRecord;
    use crate::dnssec::SecurityState;
    use crate::plan::{QueryFlags, QueryState};

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    fn query(sname: &str, stype: RecordType) -> Query {
        Query {
            uid: 1,
            parent: None,
            sname: name(sname),
            stype,
            sclass: RecordClass::In,
            flags: QueryFlags::default(),
            state: QueryState::Pending,
            zone_cut: None,
            security: SecurityState::Indeterminate,
            created: 0,
            retries: 0,
            generation: 0,
            cname_depth: 0,
        }
    }

    fn response(qname: &str, qtype: RecordType) -> DnsPacket {
        let mut pkt = DnsPacket::new(DnsHeader {
            qr: true,
            ..Default::default()
        });
        pkt.questions
            .push(DnsQuestion::new(name(qname), qtype, RecordClass::In));
        pkt
    }

    fn record(owner: &str, rtype: RecordType, rdata: Vec<u8>) -> DnsRecord {
        DnsRecord::new(name(owner), rtype, RecordClass::In, 300, rdata)
    }

    fn name_rdata(s: &str) -> Vec<u8> {
        name(s).as_wire().to_vec()
    }

    #[test]
    fn classifies_direct_answer() {
        let q = query("www.example.com", RecordType::A);
        let mut pkt = response("www.example.com", RecordType::A);
        pkt.answers
            .push(record("www.example.com", RecordType::A, vec![192, 0, 2, 1]));
        assert_eq!(classify(&q, &pkt), ResponseClass::Answer);
    }

    #[test]
    fn classifies_cname() {
        let q = query("www.example.com", RecordType::A);
        let mut pkt = response("www.example.com", RecordType::A);
        pkt.answers.push(record(
            "www.example.com",
            RecordType::Cname,
            name_rdata("web.example.net"),
        ));
        assert_eq!(
            classify(&q, &pkt),
            ResponseClass::Cname {
                target: name("web.example.net")
            }
        );
        // a CNAME query is answered by the CNAME itself
        let q = query("www.example.com", RecordType::Cname);
        assert_eq!(classify(&q, &pkt), ResponseClass::Answer);
    }

    #[test]
    fn dname_synthesizes_target() {
        let q = query("host.old.example", RecordType::A);
        let mut pkt = response("host.old.example", RecordType::A);
        pkt.answers.push(record(
            "old.example",
            RecordType::Dname,
            name_rdata("new.example"),
        ));
        assert_eq!(
            classify(&q, &pkt),
            ResponseClass::Cname {
                target: name("host.new.example")
            }
        );
    }

    #[test]
    fn classifies_referral_and_extracts_glue() {
        let q = query("www.example.com", RecordType::A);
        let mut pkt = response("www.example.com", RecordType::A);
        pkt.authorities.push(record(
            "example.com",
            RecordType::Ns,
            name_rdata("ns1.example.com"),
        ));
        pkt.authorities.push(record(
            "example.com",
            RecordType::Ns,
            name_rdata("ns2.example.com"),
        ));
        pkt.additionals
            .push(record("ns1.example.com", RecordType::A, vec![192, 0, 2, 53]));
        assert_eq!(
            classify(&q, &pkt),
            ResponseClass::Referral {
                cut: name("example.com")
            }
        );
        let delegation = extract_delegation(&pkt, &name("example.com")).unwrap();
        assert_eq!(delegation.servers.len(), 2);
        let ns1 = delegation
            .servers
            .iter()
            .find(|s| s.name == name("ns1.example.com"))
            .unwrap();
        assert_eq!(ns1.addrs, vec!["192.0.2.53".parse::<IpAddr>().unwrap()]);
        let ns2 = delegation
            .servers
            .iter()
            .find(|s| s.name == name("ns2.example.com"))
            .unwrap();
        assert!(ns2.addrs.is_empty());
    }

    #[test]
    fn sideways_referral_is_lame() {
        let q = query("www.example.com", RecordType::A);
        let mut pkt = response("www.example.com", RecordType::A);
        pkt.authorities.push(record(
            "unrelated.org",
            RecordType::Ns,
            name_rdata("ns1.unrelated.org"),
        ));
        assert_eq!(classify(&q, &pkt), ResponseClass::Lame);
    }

    #[test]
    fn negative_classifications() {
        let q = query("gone.example.com", RecordType::A);
        let mut pkt = response("gone.example.com", RecordType::A);
        pkt.header.set_response_code(ResponseCode::NameError);
        assert_eq!(classify(&q, &pkt), ResponseClass::NxDomain);

        let mut pkt = response("gone.example.com", RecordType::A);
        pkt.authorities
            .push(record("example.com", RecordType::Soa, vec![0; 22]));
        assert_eq!(classify(&q, &pkt), ResponseClass::NoData);

        let mut pkt = response("gone.example.com", RecordType::A);
        pkt.header.set_response_code(ResponseCode::Refused);
        assert_eq!(classify(&q, &pkt), ResponseClass::Lame);
    }
}
