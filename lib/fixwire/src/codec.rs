//! Tag=value framing: incremental frame extraction off a raw byte buffer and
//! serialization of outbound messages. A frame is
//! `8=FIX.x.y<SOH>9=<len><SOH>35=...<SOH>...10=<ccc><SOH>` where BodyLength
//! counts the bytes after the BodyLength field's delimiter up to and
//! including the delimiter before the CheckSum field, and CheckSum is the
//! modulo-256 sum of every byte before the CheckSum field.

use crate::dict::Dictionary;
use crate::message::{BodyItem, Field, FixMessage, Group};
use crate::{tags, SeqNum, Tag, SOH};

/// `10=ccc<SOH>`
const CHECKSUM_FIELD_LEN: usize = 7;
/// Longest BeginString / BodyLength field we are willing to scan for.
const MAX_PREFIX_FIELD: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GarbledReason {
    BeginString,
    BodyLength,
    MsgType,
    Checksum,
    MissingHeader(Tag),
    Malformed,
}

#[derive(Debug, PartialEq)]
pub enum ParseOutcome {
    /// A complete, valid frame. `consumed` bytes can be dropped from the
    /// front of the buffer.
    Message {
        msg: Box<FixMessage>,
        consumed: usize,
    },
    /// Not enough data yet.
    Incomplete,
    /// A frame-level reject. `seq_num` is the MsgSeqNum if one could be
    /// salvaged, for use as RefSeqNum.
    Garbled {
        reason: GarbledReason,
        seq_num: Option<SeqNum>,
        consumed: usize,
    },
}

/// Modulo-256 sum of the supplied bytes.
#[inline]
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &byte| acc.wrapping_add(byte))
}

/// Attempts to extract one frame from the front of `buf`.
pub fn extract(buf: &[u8], dict: &Dictionary) -> ParseOutcome {
    if buf.len() < 2 {
        return ParseOutcome::Incomplete;
    }

    if !buf.starts_with(b"8=") {
        return ParseOutcome::Garbled {
            reason: GarbledReason::BeginString,
            seq_num: None,
            consumed: skip_to_candidate(buf),
        };
    }

    // BeginString field.
    let bs_end = match find_soh(buf, 2) {
        Some(at) => at,
        None if buf.len() < MAX_PREFIX_FIELD => return ParseOutcome::Incomplete,
        None => {
            return ParseOutcome::Garbled {
                reason: GarbledReason::BeginString,
                seq_num: None,
                consumed: skip_to_candidate(buf),
            }
        }
    };
    let begin_string = &buf[2..bs_end];

    // BodyLength must be the second field.
    let rest = &buf[bs_end + 1..];
    if rest.len() < 2 {
        return ParseOutcome::Incomplete;
    }
    if !rest.starts_with(b"9=") {
        return ParseOutcome::Garbled {
            reason: GarbledReason::BodyLength,
            seq_num: None,
            consumed: skip_to_candidate(buf),
        };
    }
    let bl_end = match find_soh(rest, 2) {
        Some(at) => at,
        None if rest.len() < MAX_PREFIX_FIELD => return ParseOutcome::Incomplete,
        None => {
            return ParseOutcome::Garbled {
                reason: GarbledReason::BodyLength,
                seq_num: None,
                consumed: skip_to_candidate(buf),
            }
        }
    };
    let body_len = match parse_uint(&rest[2..bl_end]) {
        Some(len) => len as usize,
        None => {
            return ParseOutcome::Garbled {
                reason: GarbledReason::BodyLength,
                seq_num: None,
                consumed: skip_to_candidate(buf),
            }
        }
    };

    let body_start = bs_end + 1 + bl_end + 1;
    let body_end = body_start + body_len;
    let frame_end = body_end + CHECKSUM_FIELD_LEN;
    if buf.len() < frame_end {
        return ParseOutcome::Incomplete;
    }

    // The CheckSum field must sit exactly where BodyLength says it does.
    let cks_field = &buf[body_end..frame_end];
    if !cks_field.starts_with(b"10=") || cks_field[CHECKSUM_FIELD_LEN - 1] != SOH {
        return ParseOutcome::Garbled {
            reason: GarbledReason::BodyLength,
            seq_num: scan_seq_num(&buf[..body_end]),
            consumed: skip_to_candidate(buf),
        };
    }

    if begin_string != dict.begin_string().as_bytes() {
        return ParseOutcome::Garbled {
            reason: GarbledReason::BeginString,
            seq_num: scan_seq_num(&buf[..body_end]),
            consumed: frame_end,
        };
    }

    let declared = match parse_uint(&cks_field[3..6]) {
        Some(value) if value < 256 => value as u8,
        _ => {
            return ParseOutcome::Garbled {
                reason: GarbledReason::Checksum,
                seq_num: scan_seq_num(&buf[..body_end]),
                consumed: frame_end,
            }
        }
    };
    if checksum(&buf[..body_end]) != declared {
        return ParseOutcome::Garbled {
            reason: GarbledReason::Checksum,
            seq_num: scan_seq_num(&buf[..body_end]),
            consumed: frame_end,
        };
    }

    match parse_fields(&buf[..body_end], dict) {
        Ok(msg) => ParseOutcome::Message {
            msg: Box::new(msg),
            consumed: frame_end,
        },
        Err(reason) => ParseOutcome::Garbled {
            reason,
            seq_num: scan_seq_num(&buf[..body_end]),
            consumed: frame_end,
        },
    }
}

/// Splits a validated frame (everything before the CheckSum field) into a
/// message, enforcing first-three-field order and required header fields.
fn parse_fields(frame: &[u8], dict: &Dictionary) -> Result<FixMessage, GarbledReason> {
    let mut fields = Vec::new();
    for piece in frame.split(|&byte| byte == SOH) {
        if piece.is_empty() {
            continue;
        }
        let eq = piece
            .iter()
            .position(|&byte| byte == b'=')
            .ok_or(GarbledReason::Malformed)?;
        let tag = parse_uint(&piece[..eq]).ok_or(GarbledReason::Malformed)? as Tag;
        fields.push((tag, piece[eq + 1..].to_vec()));
    }

    if fields.len() < 3 {
        return Err(GarbledReason::Malformed);
    }
    if fields[2].0 != tags::MSG_TYPE {
        return Err(GarbledReason::MsgType);
    }

    for &required in &[
        tags::SENDER_COMP_ID,
        tags::TARGET_COMP_ID,
        tags::MSG_SEQ_NUM,
        tags::SENDING_TIME,
    ] {
        if !fields.iter().any(|&(tag, _)| tag == required) {
            return Err(GarbledReason::MissingHeader(required));
        }
    }

    let msg_type = String::from_utf8(fields[2].1.clone()).map_err(|_| GarbledReason::MsgType)?;
    let mut msg = FixMessage::new(&msg_type);

    let mut iter = fields.into_iter().skip(3).peekable();
    let mut in_header = true;
    while let Some((tag, value)) = iter.next() {
        if in_header && dict.is_header_tag(tag) {
            msg.push_header(Field { tag, value });
            continue;
        }
        in_header = false;

        if let Some(group_desc) = dict.group(tag) {
            let count = parse_uint(&value).ok_or(GarbledReason::Malformed)? as usize;
            let delimiter = group_desc.delimiter();
            let mut entries: Vec<Vec<Field>> = Vec::with_capacity(count);

            while let Some(&(next_tag, _)) = iter.peek() {
                if next_tag == delimiter {
                    entries.push(Vec::new());
                } else if entries.is_empty() || !group_desc.contains(next_tag) {
                    break;
                }
                let (entry_tag, entry_value) = iter.next().unwrap();
                entries
                    .last_mut()
                    .unwrap()
                    .push(Field::new(entry_tag, entry_value));
            }

            if entries.len() != count {
                return Err(GarbledReason::Malformed);
            }
            msg.add_group(Group { tag, entries });
        } else {
            msg.push_body(BodyItem::Field(Field { tag, value }));
        }
    }

    Ok(msg)
}

/// Serializes a message, computing BodyLength and CheckSum.
pub fn serialize(msg: &FixMessage, dict: &Dictionary) -> Vec<u8> {
    let mut body = Vec::with_capacity(256);
    push_field(&mut body, tags::MSG_TYPE, msg.msg_type.as_bytes());

    for field in msg.header_fields() {
        match field.tag {
            tags::BEGIN_STRING | tags::BODY_LENGTH | tags::MSG_TYPE | tags::CHECK_SUM => {}
            _ => push_field(&mut body, field.tag, &field.value),
        }
    }

    for item in msg.body_items() {
        match item {
            BodyItem::Field(field) => push_field(&mut body, field.tag, &field.value),
            BodyItem::Group(group) => {
                push_field(&mut body, group.tag, group.entries.len().to_string().as_bytes());
                for entry in &group.entries {
                    for field in entry {
                        push_field(&mut body, field.tag, &field.value);
                    }
                }
            }
        }
    }

    let mut out = Vec::with_capacity(body.len() + 32);
    push_field(&mut out, tags::BEGIN_STRING, dict.begin_string().as_bytes());
    push_field(&mut out, tags::BODY_LENGTH, body.len().to_string().as_bytes());
    out.extend_from_slice(&body);

    let sum = checksum(&out);
    out.extend_from_slice(format!("10={:03}\x01", sum).as_bytes());
    out
}

#[inline]
fn push_field(out: &mut Vec<u8>, tag: Tag, value: &[u8]) {
    out.extend_from_slice(tag.to_string().as_bytes());
    out.push(b'=');
    out.extend_from_slice(value);
    out.push(SOH);
}

#[inline]
fn find_soh(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..buf.len().min(from + MAX_PREFIX_FIELD)]
        .iter()
        .position(|&byte| byte == SOH)
        .map(|at| from + at)
}

fn parse_uint(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() || !digits.iter().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Position just past the next plausible frame start (`<SOH>8=`), or the
/// whole buffer when none is found. Used to resynchronise after garble.
fn skip_to_candidate(buf: &[u8]) -> usize {
    for at in 1..buf.len().saturating_sub(2) {
        if buf[at] == SOH && buf[at + 1..].starts_with(b"8=") {
            return at + 1;
        }
    }
    buf.len()
}

/// Best-effort MsgSeqNum scan over a garbled frame, for Reject's RefSeqNum.
fn scan_seq_num(frame: &[u8]) -> Option<SeqNum> {
    let needle = b"\x0134=";
    let start = frame
        .windows(needle.len())
        .position(|window| window == needle)?
        + needle.len();
    let end = frame[start..].iter().position(|&byte| byte == SOH)? + start;
    parse_uint(&frame[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message;

    fn dict() -> Dictionary {
        Dictionary::fix44()
    }

    fn stamped(mut msg: FixMessage, seq: SeqNum) -> FixMessage {
        msg.set_header(tags::SENDER_COMP_ID, "ASIDE");
        msg.set_header(tags::TARGET_COMP_ID, "BSIDE");
        msg.set_header(tags::MSG_SEQ_NUM, seq.to_string());
        msg.set_header(tags::SENDING_TIME, "20260801-12:00:00.000");
        msg
    }

    fn parse_one(raw: &[u8], dict: &Dictionary) -> (FixMessage, usize) {
        match extract(raw, dict) {
            ParseOutcome::Message { msg, consumed } => (*msg, consumed),
            other => panic!("Unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_roundtrip_heartbeat() {
        let dict = dict();
        let msg = stamped(message::heartbeat(Some(b"probe")), 7);
        let raw = serialize(&msg, &dict);

        let (parsed, consumed) = parse_one(&raw, &dict);

        assert_eq!(consumed, raw.len());
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_roundtrip_with_group() {
        let dict = dict();
        let mut msg = FixMessage::new("W");
        msg.set_body(262, "req-1");
        msg.add_group(Group {
            tag: 268,
            entries: vec![
                vec![Field::new(269, "0"), Field::new(270, "1.1000")],
                vec![Field::new(269, "1"), Field::new(270, "1.1002"), Field::new(271, "5")],
            ],
        });
        msg.set_body(58, "tail");
        let msg = stamped(msg, 12);

        let raw = serialize(&msg, &dict);
        let (parsed, _) = parse_one(&raw, &dict);

        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_body_length_and_checksum_values() {
        let dict = dict();
        let msg = stamped(message::heartbeat(None), 1);
        let raw = serialize(&msg, &dict);

        // 8=FIX.4.4|9=nn|...|10=ccc|
        let text = raw.clone();
        let first_soh = text.iter().position(|&b| b == SOH).unwrap();
        let second_soh = first_soh
            + 1
            + text[first_soh + 1..].iter().position(|&b| b == SOH).unwrap();
        let declared: usize = std::str::from_utf8(&text[first_soh + 3..second_soh])
            .unwrap()
            .parse()
            .unwrap();
        let body_end = second_soh + 1 + declared;

        assert_eq!(&text[body_end..body_end + 3], b"10=");

        let declared_sum: u32 = std::str::from_utf8(&text[body_end + 3..body_end + 6])
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(declared_sum as u8, checksum(&text[..body_end]));
    }

    #[test]
    fn test_incomplete_prefixes() {
        let dict = dict();
        let raw = serialize(&stamped(message::heartbeat(None), 3), &dict);

        for len in 0..raw.len() {
            match extract(&raw[..len], &dict) {
                ParseOutcome::Incomplete => {}
                other => panic!("len {} gave {:?}", len, other),
            }
        }
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let dict = dict();
        let first = serialize(&stamped(message::heartbeat(None), 1), &dict);
        let second = serialize(&stamped(message::test_request("t1"), 2), &dict);

        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        let (msg, consumed) = parse_one(&stream, &dict);
        assert_eq!(msg.seq_num(), Some(1));
        assert_eq!(consumed, first.len());

        let (msg, consumed) = parse_one(&stream[first.len()..], &dict);
        assert_eq!(msg.seq_num(), Some(2));
        assert_eq!(consumed, second.len());
    }

    #[test]
    fn test_checksum_off_by_one() {
        let dict = dict();
        let mut raw = serialize(&stamped(message::heartbeat(None), 9), &dict);

        // Corrupt a body byte without touching the trailer.
        let at = raw.len() - CHECKSUM_FIELD_LEN - 2;
        raw[at] ^= 0x01;

        match extract(&raw, &dict) {
            ParseOutcome::Garbled {
                reason: GarbledReason::Checksum,
                seq_num,
                consumed,
            } => {
                assert_eq!(seq_num, Some(9));
                assert_eq!(consumed, raw.len());
            }
            other => panic!("Unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_body_length_mismatch() {
        let dict = dict();
        let raw = serialize(&stamped(message::heartbeat(None), 4), &dict);

        // Shrink the declared body length by one; the checksum field is no
        // longer where the header claims.
        let text = String::from_utf8(raw).unwrap();
        let bad = text.replacen("\x019=", "\x019=0", 1);

        match extract(bad.as_bytes(), &dict) {
            ParseOutcome::Garbled { reason, .. } => {
                assert_eq!(reason, GarbledReason::BodyLength)
            }
            other => panic!("Unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_wrong_begin_string() {
        let dict = dict();
        let raw = serialize(&stamped(message::heartbeat(None), 2), &dict);
        let bad = String::from_utf8(raw).unwrap().replacen("FIX.4.4", "FIX.4.2", 1);

        match extract(bad.as_bytes(), &dict) {
            ParseOutcome::Garbled { reason, consumed, .. } => {
                assert_eq!(reason, GarbledReason::BeginString);
                assert_eq!(consumed, bad.len());
            }
            other => panic!("Unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_garbage_prefix_resync() {
        let dict = dict();
        let frame = serialize(&stamped(message::heartbeat(None), 5), &dict);

        let mut stream = b"noise\x01".to_vec();
        stream.extend_from_slice(&frame);

        let consumed = match extract(&stream, &dict) {
            ParseOutcome::Garbled {
                reason: GarbledReason::BeginString,
                consumed,
                ..
            } => consumed,
            other => panic!("Unexpected outcome {:?}", other),
        };

        let (msg, _) = parse_one(&stream[consumed..], &dict);
        assert_eq!(msg.seq_num(), Some(5));
    }

    #[test]
    fn test_missing_required_header() {
        let dict = dict();
        let mut msg = message::heartbeat(None);
        msg.set_header(tags::SENDER_COMP_ID, "ASIDE");
        msg.set_header(tags::TARGET_COMP_ID, "BSIDE");
        msg.set_header(tags::SENDING_TIME, "20260801-12:00:00.000");
        // No MsgSeqNum.
        let raw = serialize(&msg, &dict);

        match extract(&raw, &dict) {
            ParseOutcome::Garbled { reason, .. } => {
                assert_eq!(reason, GarbledReason::MissingHeader(tags::MSG_SEQ_NUM))
            }
            other => panic!("Unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_group_count_mismatch() {
        let dict = dict();
        let mut msg = FixMessage::new("W");
        msg.add_group(Group {
            tag: 268,
            entries: vec![vec![Field::new(269, "0")]],
        });
        let msg = stamped(msg, 6);
        let raw = serialize(&msg, &dict);

        // Claim two entries while carrying one.
        let bad = String::from_utf8(raw).unwrap().replacen("268=1", "268=2", 1);
        // Fix the checksum so only the count lie remains.
        let body_end = bad.len() - CHECKSUM_FIELD_LEN;
        let sum = checksum(&bad.as_bytes()[..body_end]);
        let bad = format!("{}10={:03}\x01", &bad[..body_end], sum);

        match extract(bad.as_bytes(), &dict) {
            ParseOutcome::Garbled { reason, .. } => assert_eq!(reason, GarbledReason::Malformed),
            other => panic!("Unexpected outcome {:?}", other),
        }
    }
}
