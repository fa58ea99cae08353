use crate::error::DnsmasqError;

const DNS_HEADER_LEN: usize = 12;
const DNS_TYPE_TXT: u16 = 16;
const DNS_CLASS_CHAOS: u16 = 3;
const FLAG_QR: u16 = 0x8000;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;
const RCODE_MASK: u16 = 0x000f;
const MAX_POINTER_JUMPS: usize = 16;

/// One TXT answer. `name` is fully qualified, with the trailing dot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtRecord {
    pub name: String,
    pub txt: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedReply {
    pub id: u16,
    pub truncated: bool,
    pub answers: Vec<TxtRecord>,
}

/// Build a recursion-desired query carrying one CHAOS/TXT question per name.
pub fn build_chaos_txt_query(id: u16, names: &[&str]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DNS_HEADER_LEN + names.len() * 24);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&FLAG_RD.to_be_bytes());
    out.extend_from_slice(&(names.len() as u16).to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);

    for name in names {
        for label in name.split('.').filter(|l| !l.is_empty()) {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out.extend_from_slice(&DNS_TYPE_TXT.to_be_bytes());
        out.extend_from_slice(&DNS_CLASS_CHAOS.to_be_bytes());
    }
    out
}

/// Bounds-checked cursor over a DNS message.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], DnsmasqError> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or(DnsmasqError::Malformed(what))?;
        self.pos += n;
        Ok(bytes)
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, DnsmasqError> {
        let bytes = self.take(2, what)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Read a possibly compressed name, returned lowercased with the trailing
    /// dot. The cursor ends up just past the name as written at its position.
    fn name(&mut self, what: &'static str) -> Result<String, DnsmasqError> {
        let mut labels = Vec::new();
        let mut at = self.pos;
        let mut resume = None;
        let mut jumps = 0usize;

        loop {
            let len = *self.buf.get(at).ok_or(DnsmasqError::Malformed(what))?;
            if len == 0 {
                self.pos = resume.unwrap_or(at + 1);
                break;
            }
            match len & 0xc0 {
                0xc0 => {
                    let low = *self.buf.get(at + 1).ok_or(DnsmasqError::Malformed(what))?;
                    resume.get_or_insert(at + 2);
                    jumps += 1;
                    if jumps > MAX_POINTER_JUMPS {
                        return Err(DnsmasqError::Malformed("name pointer loop"));
                    }
                    at = (usize::from(len & 0x3f) << 8) | usize::from(low);
                }
                0x00 => {
                    let end = at + 1 + usize::from(len);
                    let label = self
                        .buf
                        .get(at + 1..end)
                        .ok_or(DnsmasqError::Malformed(what))?;
                    labels.push(String::from_utf8_lossy(label).to_lowercase());
                    at = end;
                }
                _ => return Err(DnsmasqError::Malformed(what)),
            }
        }
        Ok(format!("{}.", labels.join(".")))
    }
}

/// Parse a reply, keeping only TXT answers. Non-TXT answers are skipped.
pub fn parse_txt_reply(payload: &[u8]) -> Result<ParsedReply, DnsmasqError> {
    if payload.len() < DNS_HEADER_LEN {
        return Err(DnsmasqError::Malformed("reply shorter than header"));
    }

    let mut reader = Reader::new(payload, 0);
    let id = reader.u16("header")?;
    let flags = reader.u16("header")?;
    if flags & FLAG_QR == 0 {
        return Err(DnsmasqError::Malformed("not a response"));
    }
    let rcode = (flags & RCODE_MASK) as u8;
    if rcode != 0 {
        return Err(DnsmasqError::Rcode(rcode));
    }
    let truncated = flags & FLAG_TC != 0;
    let qdcount = reader.u16("header")?;
    let ancount = reader.u16("header")?;
    reader.take(4, "header")?;

    for _ in 0..qdcount {
        reader.name("question name")?;
        reader.take(4, "question section")?;
    }

    let mut answers = Vec::with_capacity(usize::from(ancount));
    for _ in 0..ancount {
        if truncated && reader.is_empty() {
            break;
        }
        let name = reader.name("answer name")?;
        let typ = reader.u16("answer header")?;
        reader.take(6, "answer header")?;
        let rdlen = usize::from(reader.u16("rdlength")?);
        let rdata = reader.take(rdlen, "rdata overruns reply")?;

        if typ == DNS_TYPE_TXT {
            answers.push(TxtRecord {
                name,
                txt: parse_character_strings(rdata)?,
            });
        }
    }

    Ok(ParsedReply {
        id,
        truncated,
        answers,
    })
}

fn parse_character_strings(rdata: &[u8]) -> Result<Vec<String>, DnsmasqError> {
    let mut reader = Reader::new(rdata, 0);
    let mut out = Vec::new();
    while !reader.is_empty() {
        let len = reader.take(1, "TXT character-string")?[0];
        let text = reader.take(usize::from(len), "TXT character-string")?;
        out.push(String::from_utf8_lossy(text).into_owned());
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a reply to `query` carrying the given TXT answers, each answer
    /// name written as a pointer to the matching question.
    pub(crate) fn reply_for(query: &[u8], answers: &[(&str, &[&str])], flags: u16) -> Vec<u8> {
        let mut out = query.to_vec();
        out[2..4].copy_from_slice(&(0x8000 | FLAG_RD | flags).to_be_bytes());
        out[6..8].copy_from_slice(&(answers.len() as u16).to_be_bytes());

        let qdcount = u16::from_be_bytes([query[4], query[5]]);
        let mut question_offsets = Vec::new();
        let mut reader = Reader::new(query, DNS_HEADER_LEN);
        for _ in 0..qdcount {
            let off = reader.pos;
            question_offsets.push((reader.name("question name").unwrap(), off));
            reader.take(4, "question section").unwrap();
        }

        for (name, txt) in answers {
            match question_offsets.iter().find(|(q, _)| q == name) {
                Some((_, q_off)) => {
                    out.extend_from_slice(&(0xc000u16 | *q_off as u16).to_be_bytes());
                }
                None => {
                    for label in name.split('.').filter(|l| !l.is_empty()) {
                        out.push(label.len() as u8);
                        out.extend_from_slice(label.as_bytes());
                    }
                    out.push(0);
                }
            }
            let rdata: Vec<u8> = txt
                .iter()
                .flat_map(|s| std::iter::once(s.len() as u8).chain(s.bytes()))
                .collect();
            out.extend_from_slice(&DNS_TYPE_TXT.to_be_bytes());
            out.extend_from_slice(&DNS_CLASS_CHAOS.to_be_bytes());
            out.extend_from_slice(&0u32.to_be_bytes());
            out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            out.extend_from_slice(&rdata);
        }
        out
    }

    #[test]
    fn test_query_layout() {
        let query = build_chaos_txt_query(0x1234, &["hits.bind."]);
        assert_eq!(&query[0..2], &[0x12, 0x34]);
        assert_eq!(&query[2..4], &[0x01, 0x00]);
        assert_eq!(&query[4..6], &[0x00, 0x01]);
        assert_eq!(
            &query[12..],
            &[4, b'h', b'i', b't', b's', 4, b'b', b'i', b'n', b'd', 0, 0x00, 0x10, 0x00, 0x03]
        );
    }

    #[test]
    fn test_parse_compressed_txt_answers() {
        let query = build_chaos_txt_query(7, &["cachesize.bind.", "servers.bind."]);
        let reply = reply_for(
            &query,
            &[
                ("cachesize.bind.", &["150"]),
                ("servers.bind.", &["8.8.8.8#53 120 3", "1.1.1.1#53 9 0"]),
            ],
            0,
        );

        let parsed = parse_txt_reply(&reply).unwrap();
        assert_eq!(parsed.id, 7);
        assert!(!parsed.truncated);
        assert_eq!(parsed.answers.len(), 2);
        assert_eq!(parsed.answers[0].name, "cachesize.bind.");
        assert_eq!(parsed.answers[0].txt, vec!["150".to_string()]);
        assert_eq!(parsed.answers[1].txt.len(), 2);
    }

    #[test]
    fn test_error_rcode_and_short_reply() {
        let query = build_chaos_txt_query(9, &["hits.bind."]);
        let refused = reply_for(&query, &[], 5);
        assert!(matches!(parse_txt_reply(&refused), Err(DnsmasqError::Rcode(5))));
        assert!(matches!(
            parse_txt_reply(&[0u8; 4]),
            Err(DnsmasqError::Malformed(_))
        ));
    }

    #[test]
    fn test_pointer_loop_is_rejected() {
        let mut reply = build_chaos_txt_query(4, &[]);
        reply[2..4].copy_from_slice(&(FLAG_QR | FLAG_RD).to_be_bytes());
        reply[6..8].copy_from_slice(&1u16.to_be_bytes());
        // Answer name pointing at itself.
        reply.extend_from_slice(&(0xc000u16 | DNS_HEADER_LEN as u16).to_be_bytes());
        assert!(matches!(
            parse_txt_reply(&reply),
            Err(DnsmasqError::Malformed("name pointer loop"))
        ));
    }

    #[test]
    fn test_overrunning_rdata_is_rejected() {
        let query = build_chaos_txt_query(3, &["hits.bind."]);
        let mut reply = reply_for(&query, &[("hits.bind.", &["42"])], 0);
        reply.truncate(reply.len() - 1);
        assert!(matches!(
            parse_txt_reply(&reply),
            Err(DnsmasqError::Malformed(_))
        ));
    }
}
