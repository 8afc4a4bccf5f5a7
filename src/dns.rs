//! DNS message parsing and construction.
//!
//! Only the header, question and answer sections are kept. Authority and
//! additional records are skipped on decode. Names inside the rdata of
//! well-known record types are decompressed, so a record can be copied into
//! another message unchanged.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

const HEADER_LEN: usize = 12;
const MAX_LABEL_LEN: usize = 63;
const MAX_POINTER_JUMPS: usize = 64;

const FLAG_QR: u16 = 0x8000;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const OPCODE_MASK: u16 = 0x7800;
const RCODE_MASK: u16 = 0x000F;

pub const OPCODE_QUERY: u8 = 0;
pub const RCODE_NOTIMP: u8 = 4;

pub const TYPE_A: u16 = 1;
pub const TYPE_NS: u16 = 2;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_SOA: u16 = 6;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_MX: u16 = 15;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_SRV: u16 = 33;
pub const TYPE_OPT: u16 = 41;

pub const CLASS_IN: u16 = 1;

/// Largest UDP reply a client that sent no OPT record will accept.
pub const DEFAULT_UDP_PAYLOAD: usize = 512;

/// TTL given to answers synthesized from local overrides.
pub const LOCAL_ANSWER_TTL: u32 = 3600;

/// A DNS question section entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// A DNS resource record.
///
/// `rdata` is in uncompressed wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl Record {
    /// An `IN A` record.
    pub fn a(name: impl Into<String>, ip: Ipv4Addr, ttl: u32) -> Self {
        Self {
            name: name.into(),
            rtype: TYPE_A,
            class: CLASS_IN,
            ttl,
            rdata: ip.octets().to_vec(),
        }
    }

    /// The address carried by an A or AAAA record.
    pub fn ip(&self) -> Option<IpAddr> {
        match (self.rtype, self.rdata.len()) {
            (TYPE_A, 4) => {
                let octets: [u8; 4] = self.rdata[..].try_into().ok()?;
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            (TYPE_AAAA, 16) => {
                let octets: [u8; 16] = self.rdata[..].try_into().ok()?;
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        }
    }
}

/// The id and flags of a raw message, read without decoding the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
}

impl Header {
    pub fn peek(data: &[u8]) -> Option<Self> {
        let header = data.get(..HEADER_LEN)?;
        Some(Self {
            id: u16::from_be_bytes([header[0], header[1]]),
            flags: u16::from_be_bytes([header[2], header[3]]),
        })
    }

    pub fn is_truncated(&self) -> bool {
        self.flags & FLAG_TC != 0
    }
}

/// A DNS message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    /// UDP payload size advertised by an OPT record, if the message had one.
    pub edns_payload: Option<u16>,
}

impl Message {
    /// A recursive standard query with a single question.
    pub fn query(id: u16, name: impl Into<String>, qtype: u16) -> Self {
        Self {
            id,
            flags: FLAG_RD,
            questions: vec![Question {
                name: name.into(),
                qtype,
                qclass: CLASS_IN,
            }],
            answers: Vec::new(),
            edns_payload: None,
        }
    }

    /// An empty response to `request`: same id, opcode and recursion
    /// desired bit, echoing the first question.
    pub fn reply(request: &Message) -> Self {
        Self {
            id: request.id,
            flags: FLAG_QR | FLAG_RA | (request.flags & (OPCODE_MASK | FLAG_RD)),
            questions: request.questions.iter().take(1).cloned().collect(),
            answers: Vec::new(),
            edns_payload: None,
        }
    }

    /// A copy of this message asking only `question`.
    pub fn with_question(&self, question: &Question) -> Self {
        Self {
            id: self.id,
            flags: self.flags,
            questions: vec![question.clone()],
            answers: Vec::new(),
            edns_payload: None,
        }
    }

    pub fn opcode(&self) -> u8 {
        ((self.flags & OPCODE_MASK) >> 11) as u8
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & RCODE_MASK) as u8
    }

    pub fn set_rcode(&mut self, rcode: u8) {
        self.flags = (self.flags & !RCODE_MASK) | (rcode as u16 & RCODE_MASK);
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    pub fn is_truncated(&self) -> bool {
        self.flags & FLAG_TC != 0
    }

    pub fn set_truncated(&mut self) {
        self.flags |= FLAG_TC;
    }

    /// Largest UDP reply the sender of this message accepts.
    pub fn max_udp_payload(&self) -> usize {
        self.edns_payload
            .map_or(DEFAULT_UDP_PAYLOAD, |size| DEFAULT_UDP_PAYLOAD.max(size as usize))
    }

    /// Parse a message from wire format.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Protocol(format!("{} byte message", data.len())));
        }

        let mut reader = Reader { data, pos: 0 };
        let id = reader.u16()?;
        let flags = reader.u16()?;
        let qdcount = reader.u16()?;
        let ancount = reader.u16()?;
        let nscount = reader.u16()?;
        let arcount = reader.u16()?;

        let mut questions = Vec::with_capacity(qdcount.min(16) as usize);
        for _ in 0..qdcount {
            questions.push(Question {
                name: reader.name()?,
                qtype: reader.u16()?,
                qclass: reader.u16()?,
            });
        }

        let mut answers = Vec::with_capacity(ancount.min(64) as usize);
        for _ in 0..ancount {
            answers.push(reader.record()?);
        }

        // Authority and additional records are validated but not kept,
        // apart from the payload size an OPT record carries in its class
        for _ in 0..nscount {
            reader.record()?;
        }
        let mut edns_payload = None;
        for _ in 0..arcount {
            let record = reader.record()?;
            if record.rtype == TYPE_OPT {
                edns_payload = Some(record.class);
            }
        }

        Ok(Self {
            id,
            flags,
            questions,
            answers,
            edns_payload,
        })
    }

    /// Encode the message to wire format bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(512);

        // Header
        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&self.flags.to_be_bytes());
        data.extend_from_slice(&section_len(self.questions.len())?.to_be_bytes());
        data.extend_from_slice(&section_len(self.answers.len())?.to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

        for q in &self.questions {
            encode_name(&mut data, &q.name)?;
            data.extend_from_slice(&q.qtype.to_be_bytes());
            data.extend_from_slice(&q.qclass.to_be_bytes());
        }

        for a in &self.answers {
            // Point at the first question's name when the owner matches
            match self.questions.first() {
                Some(q) if q.name.eq_ignore_ascii_case(&a.name) => {
                    data.extend_from_slice(&[0xC0, 0x0C]);
                }
                _ => encode_name(&mut data, &a.name)?,
            }
            let rdlength = u16::try_from(a.rdata.len())
                .map_err(|_| Error::Protocol(format!("{} byte rdata", a.rdata.len())))?;
            data.extend_from_slice(&a.rtype.to_be_bytes());
            data.extend_from_slice(&a.class.to_be_bytes());
            data.extend_from_slice(&a.ttl.to_be_bytes());
            data.extend_from_slice(&rdlength.to_be_bytes());
            data.extend_from_slice(&a.rdata);
        }

        Ok(data)
    }
}

fn section_len(len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| Error::Protocol(format!("{len} records in one section")))
}

fn encode_name(buf: &mut Vec<u8>, name: &str) -> Result<()> {
    for label in name.split('.').filter(|label| !label.is_empty()) {
        if label.len() > MAX_LABEL_LEN {
            return Err(Error::Protocol(format!("label {label:?} too long")));
        }
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    Ok(())
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take(&mut self, len: usize) -> Result<&[u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| Error::Protocol(format!("truncated at offset {}", self.pos)))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a possibly compressed name, returned with a trailing dot.
    fn name(&mut self) -> Result<String> {
        let mut name = String::new();
        let mut cursor = self.pos;
        let mut resume = None;
        let mut jumps = 0;

        loop {
            let len = *self
                .data
                .get(cursor)
                .ok_or_else(|| Error::Protocol("name runs past end of message".into()))?
                as usize;

            match len {
                0 => {
                    cursor += 1;
                    break;
                }
                l if l & 0xC0 == 0xC0 => {
                    let low = *self
                        .data
                        .get(cursor + 1)
                        .ok_or_else(|| Error::Protocol("truncated compression pointer".into()))?;
                    jumps += 1;
                    if jumps > MAX_POINTER_JUMPS {
                        return Err(Error::Protocol("compression pointer loop".into()));
                    }
                    resume.get_or_insert(cursor + 2);
                    cursor = ((l & 0x3F) << 8) | low as usize;
                }
                l if l > MAX_LABEL_LEN => {
                    return Err(Error::Protocol(format!("label length {l}")));
                }
                l => {
                    let label = self
                        .data
                        .get(cursor + 1..cursor + 1 + l)
                        .ok_or_else(|| Error::Protocol("label runs past end of message".into()))?;
                    name.push_str(&String::from_utf8_lossy(label));
                    name.push('.');
                    cursor += 1 + l;
                }
            }
        }

        self.pos = resume.unwrap_or(cursor);
        if name.is_empty() {
            name.push('.');
        }
        Ok(name)
    }

    fn record(&mut self) -> Result<Record> {
        let name = self.name()?;
        let rtype = self.u16()?;
        let class = self.u16()?;
        let ttl = self.u32()?;
        let rdlength = self.u16()? as usize;
        let end = self.pos + rdlength;
        if end > self.data.len() {
            return Err(Error::Protocol(format!("rdata of {name} runs past end of message")));
        }

        let rdata = match rtype {
            TYPE_NS | TYPE_CNAME | TYPE_PTR => {
                let mut rdata = Vec::new();
                encode_name(&mut rdata, &self.name()?)?;
                rdata
            }
            TYPE_MX => {
                let mut rdata = self.take(2)?.to_vec();
                encode_name(&mut rdata, &self.name()?)?;
                rdata
            }
            TYPE_SRV => {
                let mut rdata = self.take(6)?.to_vec();
                encode_name(&mut rdata, &self.name()?)?;
                rdata
            }
            TYPE_SOA => {
                let mut rdata = Vec::new();
                encode_name(&mut rdata, &self.name()?)?;
                encode_name(&mut rdata, &self.name()?)?;
                rdata.extend_from_slice(self.take(20)?);
                rdata
            }
            _ => self.take(rdlength)?.to_vec(),
        };

        if self.pos != end {
            return Err(Error::Protocol(format!(
                "rdata of {name} type {rtype} does not match its length"
            )));
        }

        Ok(Record {
            name,
            rtype,
            class,
            ttl,
            rdata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_query_bytes() -> Vec<u8> {
        let mut query = Vec::new();
        query.extend_from_slice(&[0x12, 0x34]); // Query ID
        query.extend_from_slice(&[0x01, 0x00]); // Flags: standard query, RD
        query.extend_from_slice(&[0x00, 0x01]); // Questions: 1
        query.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        query.push(7);
        query.extend_from_slice(b"example");
        query.push(3);
        query.extend_from_slice(b"com");
        query.push(0);
        query.extend_from_slice(&[0x00, 0x01]); // Type: A
        query.extend_from_slice(&[0x00, 0x01]); // Class: IN
        query
    }

    /// www.example.com CNAME example.com, example.com A 93.184.216.34, with
    /// compression pointers in both owner names and the CNAME target.
    fn build_response_bytes() -> Vec<u8> {
        let mut response = Vec::new();
        response.extend_from_slice(&[0x12, 0x34, 0x81, 0x80, 0x00, 0x01, 0x00, 0x02]);
        response.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        // offset 12: www.example.com
        response.push(3);
        response.extend_from_slice(b"www");
        // offset 16: example.com
        response.push(7);
        response.extend_from_slice(b"example");
        response.push(3);
        response.extend_from_slice(b"com");
        response.push(0);
        response.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        // CNAME
        response.extend_from_slice(&[0xC0, 0x0C, 0x00, 0x05, 0x00, 0x01]);
        response.extend_from_slice(&[0x00, 0x00, 0x01, 0x2c, 0x00, 0x02, 0xC0, 0x10]);
        // A
        response.extend_from_slice(&[0xC0, 0x10, 0x00, 0x01, 0x00, 0x01]);
        response.extend_from_slice(&[0x00, 0x00, 0x00, 0x3c, 0x00, 0x04, 93, 184, 216, 34]);
        response
    }

    #[test]
    fn parse_query() {
        let msg = Message::parse(&build_query_bytes()).unwrap();

        assert_eq!(msg.id, 0x1234);
        assert_eq!(msg.opcode(), OPCODE_QUERY);
        assert!(!msg.is_response());
        assert_eq!(
            msg.questions,
            vec![Question {
                name: "example.com.".into(),
                qtype: TYPE_A,
                qclass: CLASS_IN,
            }]
        );
        assert!(msg.answers.is_empty());
    }

    #[test]
    fn query_encodes_to_wire_format() {
        let msg = Message::query(0x1234, "example.com.", TYPE_A);

        assert_eq!(msg.to_bytes().unwrap(), build_query_bytes());
    }

    #[test]
    fn parse_response_decompresses_names() {
        let msg = Message::parse(&build_response_bytes()).unwrap();

        assert!(msg.is_response());
        assert_eq!(msg.answers.len(), 2);

        let cname = &msg.answers[0];
        assert_eq!(cname.name, "www.example.com.");
        assert_eq!(cname.rtype, TYPE_CNAME);
        let mut target = Vec::new();
        encode_name(&mut target, "example.com.").unwrap();
        assert_eq!(cname.rdata, target);

        let a = &msg.answers[1];
        assert_eq!(a.name, "example.com.");
        assert_eq!(a.ttl, 60);
        assert_eq!(a.ip(), Some(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))));
    }

    #[test]
    fn records_survive_reencoding_in_another_message() {
        let upstream = Message::parse(&build_response_bytes()).unwrap();
        let mut reply = Message::reply(&Message::query(7, "other.org.", TYPE_CNAME));
        reply.answers.push(upstream.answers[0].clone());

        let decoded = Message::parse(&reply.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.answers, vec![upstream.answers[0].clone()]);
    }

    #[test]
    fn answer_owner_points_at_question() {
        let request = Message::query(1, "a.com.", TYPE_A);
        let mut reply = Message::reply(&request);
        reply
            .answers
            .push(Record::a("a.com.", Ipv4Addr::new(1, 2, 3, 4), LOCAL_ANSWER_TTL));

        let bytes = reply.to_bytes().unwrap();
        let answer_start = HEADER_LEN + 7 + 4;
        assert_eq!(&bytes[answer_start..answer_start + 2], &[0xC0, 0x0C]);

        let decoded = Message::parse(&bytes).unwrap();
        assert_eq!(decoded.answers[0].name, "a.com.");
        assert_eq!(
            decoded.answers[0].ip(),
            Some(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)))
        );
    }

    #[test]
    fn reply_mirrors_request() {
        let request = Message::query(42, "a.com.", TYPE_AAAA);
        let reply = Message::reply(&request);

        assert_eq!(reply.id, 42);
        assert!(reply.is_response());
        assert_eq!(reply.opcode(), OPCODE_QUERY);
        assert_eq!(reply.rcode(), 0);
        assert_eq!(reply.questions, request.questions);
    }

    #[test]
    fn set_rcode_keeps_other_flags() {
        let mut reply = Message::reply(&Message::query(1, "a.com.", TYPE_A));
        reply.set_rcode(RCODE_NOTIMP);

        assert_eq!(reply.rcode(), RCODE_NOTIMP);
        assert!(reply.is_response());
    }

    #[test]
    fn truncated_flag() {
        let mut bytes = build_response_bytes();
        bytes[2] |= 0x02;

        assert!(Message::parse(&bytes).unwrap().is_truncated());
    }

    #[test]
    fn header_peek_reads_flags_of_unparsable_reply() {
        let mut bytes = build_response_bytes();
        bytes[2] |= 0x02;
        bytes.truncate(HEADER_LEN);

        assert!(Message::parse(&bytes).is_err());
        let header = Header::peek(&bytes).unwrap();
        assert_eq!(header.id, 0x1234);
        assert!(header.is_truncated());
        assert_eq!(Header::peek(&bytes[..4]), None);
    }

    #[test]
    fn opt_record_sets_udp_payload() {
        let mut bytes = build_query_bytes();
        assert_eq!(Message::parse(&bytes).unwrap().max_udp_payload(), DEFAULT_UDP_PAYLOAD);

        bytes[11] = 1; // ARCOUNT
        // Root owner, type OPT, class 1232, ttl 0, no rdata
        bytes.extend_from_slice(&[0x00, 0x00, 0x29, 0x04, 0xD0, 0, 0, 0, 0, 0x00, 0x00]);
        let request = Message::parse(&bytes).unwrap();

        assert_eq!(request.edns_payload, Some(1232));
        assert_eq!(request.max_udp_payload(), 1232);
    }

    #[test]
    fn parse_rejects_short_message() {
        assert!(matches!(Message::parse(&[0; 5]), Err(Error::Protocol(_))));
    }

    #[test]
    fn parse_rejects_pointer_loop() {
        let mut bytes = build_query_bytes();
        bytes.truncate(HEADER_LEN);
        bytes.extend_from_slice(&[0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01]);

        assert!(matches!(Message::parse(&bytes), Err(Error::Protocol(_))));
    }

    #[test]
    fn parse_rejects_truncated_answer() {
        let mut bytes = build_response_bytes();
        bytes.truncate(bytes.len() - 2);

        assert!(matches!(Message::parse(&bytes), Err(Error::Protocol(_))));
    }

    #[test]
    fn encode_rejects_long_label() {
        let msg = Message::query(1, format!("{}.com.", "x".repeat(64)), TYPE_A);

        assert!(matches!(msg.to_bytes(), Err(Error::Protocol(_))));
    }
}
