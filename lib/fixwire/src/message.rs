//! The in-memory message model: an ordered sequence of tag/value pairs split
//! into header and body segments, with repeating groups as ordered entry
//! lists. Field order within each segment is preserved so serialization
//! reproduces the declared layout.

use crate::{tags, SeqNum, Tag};
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub tag: Tag,
    pub value: Vec<u8>,
}

impl Field {
    #[inline]
    pub fn new<V: Into<Vec<u8>>>(tag: Tag, value: V) -> Field {
        Field {
            tag,
            value: value.into(),
        }
    }
}

/// A repeating group: the NUMINGROUP tag plus one ordered field list per
/// entry. Every entry starts with the group's delimiter tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub tag: Tag,
    pub entries: Vec<Vec<Field>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BodyItem {
    Field(Field),
    Group(Group),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixMessage {
    pub msg_type: String,
    header: Vec<Field>,
    body: Vec<BodyItem>,
}

impl FixMessage {
    #[inline]
    pub fn new(msg_type: &str) -> FixMessage {
        FixMessage {
            msg_type: msg_type.to_string(),
            header: Vec::new(),
            body: Vec::new(),
        }
    }

    #[inline]
    pub fn header_fields(&self) -> &[Field] {
        &self.header
    }

    #[inline]
    pub fn body_items(&self) -> &[BodyItem] {
        &self.body
    }

    /// Sets a header field, replacing the value in place if the tag is
    /// already present, appending otherwise.
    pub fn set_header<V: Into<Vec<u8>>>(&mut self, tag: Tag, value: V) {
        match self.header.iter_mut().find(|f| f.tag == tag) {
            Some(field) => field.value = value.into(),
            None => self.header.push(Field::new(tag, value)),
        }
    }

    /// Appends a header field preserving wire order. Used by the parser.
    #[inline]
    pub fn push_header(&mut self, field: Field) {
        self.header.push(field);
    }

    pub fn remove_header(&mut self, tag: Tag) {
        self.header.retain(|f| f.tag != tag);
    }

    /// Sets a body field, replacing in place or appending.
    pub fn set_body<V: Into<Vec<u8>>>(&mut self, tag: Tag, value: V) {
        for item in self.body.iter_mut() {
            if let BodyItem::Field(field) = item {
                if field.tag == tag {
                    field.value = value.into();
                    return;
                }
            }
        }
        self.body.push(BodyItem::Field(Field::new(tag, value)));
    }

    #[inline]
    pub fn push_body(&mut self, item: BodyItem) {
        self.body.push(item);
    }

    #[inline]
    pub fn add_group(&mut self, group: Group) {
        self.body.push(BodyItem::Group(group));
    }

    pub fn group(&self, tag: Tag) -> Option<&Group> {
        self.body.iter().find_map(|item| match item {
            BodyItem::Group(group) if group.tag == tag => Some(group),
            _ => None,
        })
    }

    #[inline]
    pub fn header_field(&self, tag: Tag) -> Option<&[u8]> {
        self.header
            .iter()
            .find(|f| f.tag == tag)
            .map(|f| f.value.as_slice())
    }

    pub fn body_field(&self, tag: Tag) -> Option<&[u8]> {
        self.body.iter().find_map(|item| match item {
            BodyItem::Field(field) if field.tag == tag => Some(field.value.as_slice()),
            _ => None,
        })
    }

    /// Looks a flat field up in the header first, then the body.
    #[inline]
    pub fn get(&self, tag: Tag) -> Option<&[u8]> {
        self.header_field(tag).or_else(|| self.body_field(tag))
    }

    #[inline]
    pub fn get_str(&self, tag: Tag) -> Option<&str> {
        self.get(tag).and_then(|raw| std::str::from_utf8(raw).ok())
    }

    #[inline]
    pub fn get_int(&self, tag: Tag) -> Option<i64> {
        self.get_str(tag).and_then(|text| text.parse().ok())
    }

    #[inline]
    pub fn get_uint(&self, tag: Tag) -> Option<u64> {
        self.get_str(tag).and_then(|text| text.parse().ok())
    }

    #[inline]
    pub fn get_float(&self, tag: Tag) -> Option<f64> {
        self.get_str(tag).and_then(|text| text.parse().ok())
    }

    /// FIX booleans are `Y`/`N`; anything else reads as false.
    #[inline]
    pub fn get_bool(&self, tag: Tag) -> bool {
        self.get(tag).map(|raw| raw == b"Y").unwrap_or(false)
    }

    #[inline]
    pub fn seq_num(&self) -> Option<SeqNum> {
        self.get_uint(tags::MSG_SEQ_NUM)
    }

    #[inline]
    pub fn set_seq_num(&mut self, seq: SeqNum) {
        self.set_header(tags::MSG_SEQ_NUM, seq.to_string());
    }

    #[inline]
    pub fn poss_dup(&self) -> bool {
        self.get_bool(tags::POSS_DUP_FLAG)
    }

    #[inline]
    pub fn sending_time(&self) -> Option<&[u8]> {
        self.header_field(tags::SENDING_TIME)
    }

    /// True for the seven session-level message types.
    pub fn is_session(&self) -> bool {
        matches!(
            self.msg_type.as_str(),
            tags::MSGT_HEARTBEAT
                | tags::MSGT_TEST_REQUEST
                | tags::MSGT_RESEND_REQUEST
                | tags::MSGT_REJECT
                | tags::MSGT_SEQUENCE_RESET
                | tags::MSGT_LOGOUT
                | tags::MSGT_LOGON
        )
    }
}

/// Builds a Logon carrying EncryptMethod=0 and the heartbeat interval.
pub fn logon(heartbeat_secs: u64, reset_seqno: bool) -> FixMessage {
    let mut msg = FixMessage::new(tags::MSGT_LOGON);
    msg.set_body(tags::ENCRYPT_METHOD, "0");
    msg.set_body(tags::HEART_BT_INT, heartbeat_secs.to_string());
    if reset_seqno {
        msg.set_body(tags::RESET_SEQ_NUM_FLAG, "Y");
    }
    msg
}

pub fn logout(text: Option<&str>) -> FixMessage {
    let mut msg = FixMessage::new(tags::MSGT_LOGOUT);
    if let Some(text) = text {
        msg.set_body(tags::TEXT, text);
    }
    msg
}

/// Heartbeat, echoing the TestReqID when answering a TestRequest.
pub fn heartbeat(test_req_id: Option<&[u8]>) -> FixMessage {
    let mut msg = FixMessage::new(tags::MSGT_HEARTBEAT);
    if let Some(id) = test_req_id {
        msg.set_body(tags::TEST_REQ_ID, id);
    }
    msg
}

pub fn test_request(id: &str) -> FixMessage {
    let mut msg = FixMessage::new(tags::MSGT_TEST_REQUEST);
    msg.set_body(tags::TEST_REQ_ID, id);
    msg
}

/// ResendRequest for the inclusive range; `end == 0` means "everything from
/// `begin` on".
pub fn resend_request(begin: SeqNum, end: SeqNum) -> FixMessage {
    let mut msg = FixMessage::new(tags::MSGT_RESEND_REQUEST);
    msg.set_body(tags::BEGIN_SEQ_NO, begin.to_string());
    msg.set_body(tags::END_SEQ_NO, end.to_string());
    msg
}

pub fn sequence_reset(new_seq_no: SeqNum, gap_fill: bool) -> FixMessage {
    let mut msg = FixMessage::new(tags::MSGT_SEQUENCE_RESET);
    if gap_fill {
        msg.set_body(tags::GAP_FILL_FLAG, "Y");
    }
    msg.set_body(tags::NEW_SEQ_NO, new_seq_no.to_string());
    msg
}

pub fn reject(ref_seq_num: SeqNum, reason: u32, text: &str) -> FixMessage {
    let mut msg = FixMessage::new(tags::MSGT_REJECT);
    msg.set_body(tags::REF_SEQ_NUM, ref_seq_num.to_string());
    msg.set_body(tags::SESSION_REJECT_REASON, reason.to_string());
    if !text.is_empty() {
        msg.set_body(tags::TEXT, text);
    }
    msg
}
