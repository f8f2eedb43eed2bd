use super::edns::EdnsOpt;
use super::enums::{ExtendedErrorCode, RecordClass, RecordType, ResponseCode};
use super::header::{DnsHeader, HEADER_SIZE};
use super::name::Name;
use super::question::DnsQuestion;
use super::record::DnsRecord;
use crate::error::{MimirError, Result};

/// Packet sections a record can land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Answer,
    Authority,
    Additional,
}

/// A fully parsed DNS message.
///
/// The OPT pseudo-record is lifted out of the additional section into `edns`
/// on parse and re-appended on serialize, so section walks never have to
/// special-case it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
    pub edns: Option<EdnsOpt>,
}

impl DnsPacket {
    pub fn new(header: DnsHeader) -> Self {
        DnsPacket {
            header,
            ..Default::default()
        }
    }

    /// Build an outbound query with EDNS and the DO bit as requested.
    pub fn new_query(
        id: u16,
        qname: Name,
        qtype: RecordType,
        qclass: RecordClass,
        dnssec_ok: bool,
        payload_size: u16,
    ) -> Self {
        let mut packet = DnsPacket::new(DnsHeader {
            id,
            qdcount: 1,
            ..Default::default()
        });
        packet
            .questions
            .push(DnsQuestion::new(qname, qtype, qclass));
        let mut opt = EdnsOpt::new(payload_size);
        opt.set_do_flag(dnssec_ok);
        packet.edns = Some(opt);
        packet
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = DnsHeader::parse(data)?;
        let mut offset = HEADER_SIZE;

        let mut questions = Vec::with_capacity(header.qdcount as usize);
        for _ in 0..header.qdcount {
            let (question, next) = DnsQuestion::parse(data, offset)?;
            questions.push(question);
            offset = next;
        }

        let mut sections: [Vec<DnsRecord>; 3] = [Vec::new(), Vec::new(), Vec::new()];
        let mut edns = None;
        let counts = [header.ancount, header.nscount, header.arcount];
        for (section, &count) in sections.iter_mut().zip(counts.iter()) {
            for _ in 0..count {
                let (record, next) = DnsRecord::parse(data, offset)?;
                offset = next;
                if record.rtype == RecordType::Opt {
                    edns = Some(EdnsOpt::from_record_fields(
                        u16::from(record.rclass),
                        record.ttl,
                        &record.rdata,
                    ));
                } else {
                    section.push(record);
                }
            }
        }

        let [answers, authorities, additionals] = sections;
        Ok(DnsPacket {
            header,
            questions,
            answers,
            authorities,
            additionals,
            edns,
        })
    }

    /// Refresh the header counts from the section vectors.
    pub fn update_counts(&mut self) {
        self.header.qdcount = self.questions.len() as u16;
        self.header.ancount = self.answers.len() as u16;
        self.header.nscount = self.authorities.len() as u16;
        self.header.arcount = self.additionals.len() as u16 + self.edns.is_some() as u16;
    }

    /// Serialize without a size limit.
    pub fn serialize(&self) -> Vec<u8> {
        self.serialize_limited(usize::MAX)
    }

    /// Serialize, dropping whole RR sets that do not fit within `limit` and
    /// setting TC when answer or authority data was lost.
    pub fn serialize_limited(&self, limit: usize) -> Vec<u8> {
        let mut packet = self.clone();
        packet.update_counts();

        let mut out = Vec::with_capacity(512);
        packet.header.write(&mut out);
        for question in &packet.questions {
            question.write(&mut out);
        }

        let mut truncated = false;
        let sections = [
            (&packet.answers, true),
            (&packet.authorities, true),
            (&packet.additionals, false),
        ];
        let mut written = [0u16; 3];
        'sections: for (idx, (records, tc_on_drop)) in sections.iter().enumerate() {
            let mut set_start = out.len();
            let mut set_written_at_start = 0u16;
            let mut current: Option<(Name, RecordType)> = None;
            for record in records.iter() {
                let key = (record.name.clone(), record.rtype);
                if current.as_ref() != Some(&key) {
                    set_start = out.len();
                    set_written_at_start = written[idx];
                    current = Some(key);
                }
                record.write(&mut out);
                if out.len() > limit {
                    // roll the whole set back so no partial set goes out
                    out.truncate(set_start);
                    written[idx] = set_written_at_start;
                    if *tc_on_drop {
                        truncated = true;
                    }
                    break 'sections;
                }
                written[idx] += 1;
            }
        }

        let mut edns_written = false;
        if let Some(edns) = &packet.edns {
            let (class, ttl, rdata) = edns.to_record_fields();
            let opt = DnsRecord::new(
                Name::root(),
                RecordType::Opt,
                RecordClass::from(class),
                ttl,
                rdata,
            );
            let before = out.len();
            opt.write(&mut out);
            if out.len() > limit {
                out.truncate(before);
            } else {
                edns_written = true;
            }
        }

        // Patch counts and TC over what was actually written.
        let mut header = packet.header.clone();
        header.ancount = written[0];
        header.nscount = written[1];
        header.arcount = written[2] + edns_written as u16;
        header.tc = header.tc || truncated;
        let mut head = Vec::with_capacity(HEADER_SIZE);
        header.write(&mut head);
        out[..HEADER_SIZE].copy_from_slice(&head);
        out
    }

    /// Start a response to this packet: flags echoed per RFC, sections empty,
    /// rcode NOERROR, EDNS mirrored when the request carried it.
    pub fn create_response(&self) -> Self {
        let mut response = DnsPacket::new(DnsHeader {
            id: self.header.id,
            qr: true,
            opcode: self.header.opcode,
            rd: self.header.rd,
            ra: true,
            cd: self.header.cd,
            qdcount: self.header.qdcount,
            ..Default::default()
        });
        response.questions = self.questions.clone();
        if let Some(edns) = &self.edns {
            let mut opt = EdnsOpt::new(edns.udp_payload_size);
            opt.set_do_flag(edns.do_flag());
            response.edns = Some(opt);
        }
        response
    }

    /// Reuse this packet between hops: keep the 12-byte header and,
    /// optionally, the question; drop every record and zero the counts.
    pub fn recycle(&mut self, keep_question: bool) {
        if !keep_question {
            self.questions.clear();
        }
        self.answers.clear();
        self.authorities.clear();
        self.additionals.clear();
        self.edns = None;
        self.header.qdcount = self.questions.len() as u16;
        self.header.ancount = 0;
        self.header.nscount = 0;
        self.header.arcount = 0;
    }

    /// Drop answer payload but keep the question intact.
    pub fn clear_payload(&mut self) {
        self.recycle(true);
    }

    /// Append a record to a section and bump the matching count.
    pub fn put_record(&mut self, section: Section, record: DnsRecord) {
        match section {
            Section::Answer => {
                self.answers.push(record);
                self.header.ancount = self.answers.len() as u16;
            }
            Section::Authority => {
                self.authorities.push(record);
                self.header.nscount = self.authorities.len() as u16;
            }
            Section::Additional => {
                self.additionals.push(record);
                self.header.arcount = self.additionals.len() as u16;
            }
        }
    }

    /// Mark an answer as authoritative, clearing any AD claim.
    pub fn make_auth_header(&mut self) {
        self.header.ad = false;
        self.header.aa = true;
    }

    pub fn section(&self, section: Section) -> &[DnsRecord] {
        match section {
            Section::Answer => &self.answers,
            Section::Authority => &self.authorities,
            Section::Additional => &self.additionals,
        }
    }

    pub fn qname(&self) -> Option<&Name> {
        self.questions.first().map(|q| &q.qname)
    }

    pub fn qtype(&self) -> Option<RecordType> {
        self.questions.first().map(|q| q.qtype)
    }

    pub fn qclass(&self) -> Option<RecordClass> {
        self.questions.first().map(|q| q.qclass)
    }

    pub fn do_flag(&self) -> bool {
        self.edns.as_ref().is_some_and(|opt| opt.do_flag())
    }

    pub fn set_rcode(&mut self, rcode: ResponseCode) {
        self.header.set_response_code(rcode);
    }

    /// Attach an extended error to the response's OPT, creating one if the
    /// packet has none.
    pub fn set_extended_error(&mut self, code: ExtendedErrorCode, text: &str) {
        self.edns
            .get_or_insert_with(|| EdnsOpt::new(512))
            .set_extended_error(code, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a_record(owner: &str, octet: u8) -> DnsRecord {
        DnsRecord::new(
            owner.parse().unwrap(),
            RecordType::A,
            RecordClass::In,
            300,
            vec![192, 0, 2, octet],
        )
    }

    #[test]
    fn packet_round_trip() {
        let mut packet = DnsPacket::new_query(
            0x1234,
            "example.com".parse().unwrap(),
            RecordType::A,
            RecordClass::In,
            true,
            4096,
        );
        packet.put_record(Section::Answer, a_record("example.com", 1));
        packet.put_record(Section::Answer, a_record("example.com", 2));
        packet.put_record(Section::Authority, a_record("ns.example.com", 3));

        let wire = packet.serialize();
        let parsed = DnsPacket::parse(&wire).unwrap();
        assert_eq!(parsed.questions, packet.questions);
        assert_eq!(parsed.answers, packet.answers);
        assert_eq!(parsed.authorities, packet.authorities);
        assert!(parsed.do_flag());
        assert_eq!(parsed.header.ancount, 2);
    }

    #[test]
    fn truncation_drops_whole_sets() {
        let mut packet = DnsPacket::new_query(
            1,
            "example.com".parse().unwrap(),
            RecordType::A,
            RecordClass::In,
            false,
            512,
        );
        for i in 0..20 {
            packet.put_record(Section::Answer, a_record("example.com", i));
        }
        let wire = packet.serialize_limited(128);
        assert!(wire.len() <= 128);
        let parsed = DnsPacket::parse(&wire).unwrap();
        assert!(parsed.header.tc);
        // the whole answer set shares one identity, so nothing partial leaks
        assert_eq!(parsed.answers.len(), 0);
    }

    #[test]
    fn recycle_keeps_header_and_question() {
        let mut packet = DnsPacket::new_query(
            7,
            "example.com".parse().unwrap(),
            RecordType::Mx,
            RecordClass::In,
            false,
            1232,
        );
        packet.put_record(Section::Answer, a_record("example.com", 1));
        packet.clear_payload();
        assert_eq!(packet.header.id, 7);
        assert_eq!(packet.questions.len(), 1);
        assert_eq!(packet.header.qdcount, 1);
        assert_eq!(packet.header.ancount, 0);
        assert!(packet.answers.is_empty());

        packet.recycle(false);
        assert!(packet.questions.is_empty());
        assert_eq!(packet.header.qdcount, 0);
        assert_eq!(packet.header.id, 7);
    }

    #[test]
    fn auth_header_clears_ad() {
        let mut packet = DnsPacket::default();
        packet.header.ad = true;
        packet.make_auth_header();
        assert!(!packet.header.ad);
        assert!(packet.header.aa);
    }
}
