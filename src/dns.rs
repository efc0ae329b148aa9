//! DNS message parsing and construction.

use std::borrow::Cow;

const HEADER_LEN: usize = 12;
const MAX_POINTER_JUMPS: usize = 16;

pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_OPT: u16 = 41;
pub const CLASS_IN: u16 = 1;

/// Header bits copied from the request into a synthesized reply (opcode + RD).
const REQUEST_FLAGS_MASK: u16 = 0x7900;
const FLAG_QR: u16 = 0x8000;
const FLAG_RA: u16 = 0x0080;

/// A parsed DNS query.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<DnsQuestion>,
}

impl DnsQuery {
    /// Parse a DNS query from raw bytes.
    ///
    /// Only the header and question section are read. Names keep the case
    /// they were sent with so answers echo them exactly.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN + 1 {
            return None;
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let flags = u16::from_be_bytes([data[2], data[3]]);
        let qdcount = u16::from_be_bytes([data[4], data[5]]) as usize;
        if qdcount == 0 {
            return None;
        }

        let mut pos = HEADER_LEN;
        let mut questions = Vec::with_capacity(qdcount);

        for _ in 0..qdcount {
            let (domain, next) = read_name(data, pos)?;
            if domain.is_empty() {
                return None;
            }
            pos = next;

            if pos + 4 > data.len() {
                return None;
            }
            let qtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
            let qclass = u16::from_be_bytes([data[pos + 2], data[pos + 3]]);
            pos += 4;

            questions.push(DnsQuestion {
                domain,
                qtype,
                qclass,
            });
        }

        Some(Self {
            id,
            flags,
            questions,
        })
    }

    /// The first question, which is the one every real client sends.
    ///
    /// `None` only for a hand-built query with no questions; parsed queries
    /// always carry at least one.
    pub fn first(&self) -> Option<&DnsQuestion> {
        self.questions.first()
    }
}

/// Read a possibly compressed name starting at `pos`.
///
/// Returns the dotted name (no trailing dot) and the offset just past the
/// name in the original position.
fn read_name(data: &[u8], mut pos: usize) -> Option<(String, usize)> {
    let mut labels: Vec<&str> = Vec::new();
    let mut resume = None;
    let mut jumps = 0;

    loop {
        let len = *data.get(pos)? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xC0 == 0xC0 {
            let low = *data.get(pos + 1)? as usize;
            if resume.is_none() {
                resume = Some(pos + 2);
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return None;
            }
            pos = ((len & 0x3F) << 8) | low;
            continue;
        }
        if len > 63 {
            return None;
        }
        pos += 1;
        let label = data.get(pos..pos + len)?;
        labels.push(std::str::from_utf8(label).ok()?);
        pos += len;
    }

    Some((labels.join("."), resume.unwrap_or(pos)))
}

/// Mnemonic for a record type, as used in telemetry.
pub fn rtype_name(rtype: u16) -> Cow<'static, str> {
    let name = match rtype {
        1 => "A",
        2 => "NS",
        5 => "CNAME",
        6 => "SOA",
        12 => "PTR",
        15 => "MX",
        16 => "TXT",
        28 => "AAAA",
        33 => "SRV",
        35 => "NAPTR",
        41 => "OPT",
        43 => "DS",
        46 => "RRSIG",
        47 => "NSEC",
        48 => "DNSKEY",
        64 => "SVCB",
        65 => "HTTPS",
        255 => "ANY",
        257 => "CAA",
        other => return Cow::Owned(format!("TYPE{}", other)),
    };
    Cow::Borrowed(name)
}

/// A DNS response.
#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
}

/// A DNS question section entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// A DNS resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsRecord {
    /// EDNS0 OPT pseudo-record advertising `udp_size` with the DO bit set.
    pub fn edns(udp_size: u16) -> Self {
        Self {
            name: String::new(),
            rtype: TYPE_OPT,
            class: udp_size,
            ttl: 0x0000_8000,
            rdata: Vec::new(),
        }
    }
}

impl DnsResponse {
    /// Empty NOERROR reply to `query`, echoing its questions.
    pub fn reply_to(query: &DnsQuery) -> Self {
        Self {
            id: query.id,
            flags: FLAG_QR | FLAG_RA | (query.flags & REQUEST_FLAGS_MASK),
            questions: query.questions.clone(),
            answers: Vec::new(),
            additionals: Vec::new(),
        }
    }

    /// Low four bits of the flags word.
    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000F) as u8
    }

    /// Encode the response to wire format bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(512);

        // Header
        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&self.flags.to_be_bytes());
        data.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        data.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
        data.extend_from_slice(&(self.additionals.len() as u16).to_be_bytes());

        // Questions, remembering where each name starts for compression
        let mut offsets: Vec<(&str, u16)> = Vec::with_capacity(self.questions.len());
        for q in &self.questions {
            if data.len() < 0x3FFF {
                offsets.push((q.domain.as_str(), data.len() as u16));
            }
            Self::encode_domain(&mut data, &q.domain);
            data.extend_from_slice(&q.qtype.to_be_bytes());
            data.extend_from_slice(&q.qclass.to_be_bytes());
        }

        for record in self.answers.iter().chain(&self.additionals) {
            match offsets.iter().find(|(name, _)| *name == record.name) {
                Some((_, offset)) => data.extend_from_slice(&(0xC000 | offset).to_be_bytes()),
                None => Self::encode_domain(&mut data, &record.name),
            }
            data.extend_from_slice(&record.rtype.to_be_bytes());
            data.extend_from_slice(&record.class.to_be_bytes());
            data.extend_from_slice(&record.ttl.to_be_bytes());
            data.extend_from_slice(&(record.rdata.len() as u16).to_be_bytes());
            data.extend_from_slice(&record.rdata);
        }

        data
    }

    fn encode_domain(buf: &mut Vec<u8>, domain: &str) {
        for label in domain.split('.').filter(|l| !l.is_empty()) {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
    }
}

#[cfg(test)]
pub(crate) fn build_query(id: u16, questions: &[(&str, u16)]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(512);
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&[0x01, 0x00]); // Flags: standard query, RD
    packet.extend_from_slice(&(questions.len() as u16).to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    for (domain, qtype) in questions {
        for label in domain.split('.').filter(|l| !l.is_empty()) {
            packet.push(label.len() as u8);
            packet.extend_from_slice(label.as_bytes());
        }
        packet.push(0x00);
        packet.extend_from_slice(&qtype.to_be_bytes());
        packet.extend_from_slice(&CLASS_IN.to_be_bytes());
    }
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_question() {
        let packet = build_query(0x1234, &[("Ads.Example.com", TYPE_A)]);

        let query = DnsQuery::parse(&packet).unwrap();

        assert_eq!(query.id, 0x1234);
        assert_eq!(query.flags, 0x0100);
        assert_eq!(query.questions.len(), 1);
        let question = query.first().unwrap();
        assert_eq!(question.domain, "Ads.Example.com");
        assert_eq!(question.qtype, TYPE_A);
        assert_eq!(question.qclass, CLASS_IN);
    }

    #[test]
    fn parse_multiple_questions() {
        let packet = build_query(7, &[("a.example.com", TYPE_A), ("a.example.com", TYPE_AAAA)]);

        let query = DnsQuery::parse(&packet).unwrap();

        assert_eq!(query.questions.len(), 2);
        assert_eq!(query.questions[1].qtype, TYPE_AAAA);
    }

    #[test]
    fn parse_follows_compression_pointer() {
        let mut packet = build_query(7, &[("example.com", TYPE_A)]);
        packet[5] = 2;
        packet.extend_from_slice(&[0x03, b'w', b'w', b'w', 0xC0, 0x0C]);
        packet.extend_from_slice(&TYPE_A.to_be_bytes());
        packet.extend_from_slice(&CLASS_IN.to_be_bytes());

        let query = DnsQuery::parse(&packet).unwrap();

        assert_eq!(query.questions[1].domain, "www.example.com");
    }

    #[test]
    fn parse_rejects_pointer_loop() {
        let mut packet = build_query(7, &[]);
        packet[5] = 1;
        packet.extend_from_slice(&[0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01]);

        assert!(DnsQuery::parse(&packet).is_none());
    }

    #[test]
    fn parse_rejects_truncated_packets() {
        let packet = build_query(7, &[("example.com", TYPE_A)]);

        assert!(DnsQuery::parse(&packet[..packet.len() - 2]).is_none());
        assert!(DnsQuery::parse(&packet[..HEADER_LEN]).is_none());
    }

    #[test]
    fn reply_copies_id_and_recursion_desired() {
        let query = DnsQuery::parse(&build_query(0xBEEF, &[("example.com", TYPE_A)])).unwrap();

        let reply = DnsResponse::reply_to(&query);

        assert_eq!(reply.id, 0xBEEF);
        assert_eq!(reply.flags, 0x8180);
        assert_eq!(reply.rcode(), 0);
    }

    #[test]
    fn to_bytes_compresses_answer_names() {
        let query = DnsQuery::parse(&build_query(1, &[("example.com", TYPE_A)])).unwrap();
        let mut reply = DnsResponse::reply_to(&query);
        reply.answers.push(DnsRecord {
            name: "example.com".into(),
            rtype: TYPE_A,
            class: CLASS_IN,
            ttl: 300,
            rdata: vec![10, 0, 0, 1],
        });
        reply.additionals.push(DnsRecord::edns(4096));

        let bytes = reply.to_bytes();

        // header(12) + question(13 + 4) + answer(2 + 10 + 4) + opt(1 + 10)
        assert_eq!(bytes.len(), 12 + 17 + 16 + 11);
        assert_eq!(&bytes[6..8], &[0, 1]);
        assert_eq!(&bytes[10..12], &[0, 1]);
        assert_eq!(&bytes[29..31], &[0xC0, 0x0C]);
        assert_eq!(&bytes[41..45], &[10, 0, 0, 1]);
        assert_eq!(bytes[45], 0);
        assert_eq!(&bytes[46..48], &TYPE_OPT.to_be_bytes());
    }

    #[test]
    fn rtype_names() {
        assert_eq!(rtype_name(TYPE_A), "A");
        assert_eq!(rtype_name(TYPE_AAAA), "AAAA");
        assert_eq!(rtype_name(65), "HTTPS");
        assert_eq!(rtype_name(9999), "TYPE9999");
    }
}
