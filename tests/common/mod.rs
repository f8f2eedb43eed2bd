#![allow(dead_code)]

use mimir::dns::enums::{RecordClass, RecordType, ResponseCode};
use mimir::dns::packet::{DnsPacket, Section};
use mimir::dns::record::DnsRecord;
use mimir::dns::rrset::RrSet;
use mimir::dns::Name;
use mimir::resolver::{OutboundQuery, Resolution, ResolutionTask, Step};
use ring::signature::{Ed25519KeyPair, KeyPair};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn name(s: &str) -> Name {
    s.parse().unwrap()
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

pub fn a_record(owner: &str, addr: [u8; 4]) -> DnsRecord {
    DnsRecord::new(name(owner), RecordType::A, RecordClass::In, 300, addr.to_vec())
}

pub fn ns_record(owner: &str, target: &str) -> DnsRecord {
    DnsRecord::new(
        name(owner),
        RecordType::Ns,
        RecordClass::In,
        300,
        name(target).as_wire().to_vec(),
    )
}

pub fn cname_record(owner: &str, target: &str) -> DnsRecord {
    DnsRecord::new(
        name(owner),
        RecordType::Cname,
        RecordClass::In,
        300,
        name(target).as_wire().to_vec(),
    )
}

pub fn soa_record(zone: &str) -> DnsRecord {
    let mut rdata = Vec::new();
    rdata.extend_from_slice(name(&format!("ns.{}", zone.trim_start_matches('.'))).as_wire());
    rdata.extend_from_slice(name("hostmaster.invalid").as_wire());
    rdata.extend_from_slice(&1u32.to_be_bytes());
    rdata.extend_from_slice(&3600u32.to_be_bytes());
    rdata.extend_from_slice(&600u32.to_be_bytes());
    rdata.extend_from_slice(&86400u32.to_be_bytes());
    rdata.extend_from_slice(&300u32.to_be_bytes());
    DnsRecord::new(name(zone), RecordType::Soa, RecordClass::In, 300, rdata)
}

/// NSEC record with a window-0 type bitmap.
pub fn nsec_record(owner: &str, next: &str, types: &[RecordType]) -> DnsRecord {
    let mut rdata = name(next).as_wire().to_vec();
    let mut bits = [0u8; 32];
    let mut max_byte = 0usize;
    for &t in types {
        let v = u16::from(t);
        assert!(v < 256, "test bitmap only covers window 0");
        let byte = (v / 8) as usize;
        bits[byte] |= 0x80 >> (v % 8);
        max_byte = max_byte.max(byte);
    }
    rdata.push(0);
    rdata.push(max_byte as u8 + 1);
    rdata.extend_from_slice(&bits[..=max_byte]);
    DnsRecord::new(name(owner), RecordType::Nsec, RecordClass::In, 300, rdata)
}

/// Start a response packet mirroring the outbound query.
pub fn response_to(out: &OutboundQuery) -> DnsPacket {
    let mut pkt = out.packet.create_response();
    pkt.header.aa = true;
    pkt
}

pub fn answer_response(out: &OutboundQuery, answers: Vec<DnsRecord>) -> DnsPacket {
    let mut pkt = response_to(out);
    for record in answers {
        pkt.put_record(Section::Answer, record);
    }
    pkt
}

pub fn referral_response(
    out: &OutboundQuery,
    cut: &str,
    servers: &[(&str, Option<[u8; 4]>)],
) -> DnsPacket {
    let mut pkt = response_to(out);
    pkt.header.aa = false;
    for (ns, glue) in servers {
        pkt.put_record(Section::Authority, ns_record(cut, ns));
        if let Some(addr) = glue {
            pkt.put_record(Section::Additional, a_record(ns, *addr));
        }
    }
    pkt
}

pub fn negative_response(out: &OutboundQuery, zone: &str, nxdomain: bool) -> DnsPacket {
    let mut pkt = response_to(out);
    if nxdomain {
        pkt.header.set_response_code(ResponseCode::NameError);
    }
    pkt.put_record(Section::Authority, soa_record(zone));
    pkt
}

/// Drive a task to completion against a scripted transport. `None` from the
/// handler simulates a timeout.
pub fn drive<F>(task: &mut ResolutionTask, mut handler: F) -> Resolution
where
    F: FnMut(&OutboundQuery) -> Option<DnsPacket>,
{
    static TRACING: std::sync::Once = std::sync::Once::new();
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });

    for _ in 0..200 {
        match task.step() {
            Step::Next => continue,
            Step::Wait(out) => {
                let reply = handler(&out);
                let rtt = reply.as_ref().map(|_| Duration::from_millis(10));
                task.ingest(reply, rtt);
            }
            Step::Done(resolution) => return *resolution,
            Step::Fail(err) => panic!("driver refused the request: {}", err),
        }
    }
    panic!("resolution did not converge in 200 steps");
}

/// Build a plain client request packet.
pub fn request(qname: &str, qtype: RecordType, dnssec_ok: bool) -> DnsPacket {
    let mut pkt = DnsPacket::new_query(0x1000, name(qname), qtype, RecordClass::In, dnssec_ok, 4096);
    pkt.header.rd = true;
    pkt
}

/// A test zone signer: one Ed25519 zone key that doubles as KSK and ZSK.
pub struct ZoneSigner {
    pub zone: Name,
    keypair: Ed25519KeyPair,
}

impl ZoneSigner {
    pub fn new(zone: &str) -> Self {
        let rng = ring::rand::SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let keypair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
        ZoneSigner {
            zone: name(zone),
            keypair,
        }
    }

    pub fn dnskey_rdata(&self) -> Vec<u8> {
        let mut rdata = vec![0x01, 0x01, 3, 15]; // ZSK+SEP, protocol 3, Ed25519
        rdata.extend_from_slice(self.keypair.public_key().as_ref());
        rdata
    }

    pub fn dnskey_record(&self) -> DnsRecord {
        DnsRecord::new(
            self.zone.clone(),
            RecordType::Dnskey,
            RecordClass::In,
            300,
            self.dnskey_rdata(),
        )
    }

    pub fn key_tag(&self) -> u16 {
        mimir::dns::record::Dnskey::parse(&self.dnskey_rdata())
            .unwrap()
            .key_tag()
    }

    /// Trust anchor line for this key, in DNSKEY presentation format.
    pub fn anchor_line(&self) -> String {
        use base64::Engine;
        format!(
            "{} DNSKEY 257 3 15 {}",
            self.zone,
            base64::engine::general_purpose::STANDARD
                .encode(self.keypair.public_key().as_ref())
        )
    }

    /// Sign a set of records sharing (owner, type); returns the RRSIG record.
    pub fn sign(&self, records: &[DnsRecord]) -> DnsRecord {
        self.sign_as(records, None)
    }

    /// Sign as a wildcard expansion: the signature is made over the wildcard
    /// owner while the record carries the expanded name.
    pub fn sign_expanded(&self, records: &[DnsRecord], wildcard: &Name) -> DnsRecord {
        self.sign_as(records, Some(wildcard))
    }

    fn sign_as(&self, records: &[DnsRecord], wildcard: Option<&Name>) -> DnsRecord {
        let mut rrset = RrSet::from_record(&records[0]);
        for record in &records[1..] {
            rrset.push(record);
        }
        let now = unix_now() as u32;
        let labels = wildcard
            .unwrap_or(&rrset.owner)
            .rrsig_label_count() as u8;

        let mut rdata = Vec::new();
        rdata.extend_from_slice(&u16::from(rrset.rtype).to_be_bytes());
        rdata.push(15); // Ed25519
        rdata.push(labels);
        rdata.extend_from_slice(&rrset.ttl.to_be_bytes());
        rdata.extend_from_slice(&(now + 3600).to_be_bytes());
        rdata.extend_from_slice(&(now - 3600).to_be_bytes());
        rdata.extend_from_slice(&self.key_tag().to_be_bytes());
        rdata.extend_from_slice(self.zone.as_wire());

        let mut message = rdata.clone();
        // the prefix is signed with the signer name lowercased
        let prefix_len = 18 + self.zone.as_wire().len();
        message[18..prefix_len].copy_from_slice(&self.zone.to_lowercase_wire());
        message.extend_from_slice(&rrset.canonical_wire(wildcard, rrset.ttl));

        let signature = self.keypair.sign(&message);
        rdata.extend_from_slice(signature.as_ref());
        DnsRecord::new(
            rrset.owner.clone(),
            RecordType::Rrsig,
            RecordClass::In,
            rrset.ttl,
            rdata,
        )
    }
}
