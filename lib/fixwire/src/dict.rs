//! The field dictionary: descriptors for every known tag, repeating group
//! layouts and the message type table. The built-in FIX 4.4 table below is
//! generated from the standard schema; `add_field`/`add_group` allow callers
//! to register custom fields on top of it.

use crate::Tag;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::sync::Arc;

/// Wire type of a field as declared by the FIX schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Int,
    Length,
    SeqNum,
    NumInGroup,
    DayOfMonth,
    Float,
    Qty,
    Price,
    PriceOffset,
    Amt,
    Percentage,
    Char,
    Boolean,
    Str,
    MultipleValueString,
    Currency,
    Exchange,
    Country,
    LocalMktDate,
    MonthYear,
    UtcTimestamp,
    UtcTimeOnly,
    UtcDateOnly,
    Data,
}

/// Decoded value family of a wire type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Integer,
    Real,
    Text,
}

impl WireType {
    #[inline]
    pub fn value_kind(self) -> ValueKind {
        match self {
            WireType::Int
            | WireType::Length
            | WireType::SeqNum
            | WireType::NumInGroup
            | WireType::DayOfMonth => ValueKind::Integer,
            WireType::Float
            | WireType::Qty
            | WireType::Price
            | WireType::PriceOffset
            | WireType::Amt
            | WireType::Percentage => ValueKind::Real,
            _ => ValueKind::Text,
        }
    }
}

/// Immutable description of a single field.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub tag: Tag,
    pub name: String,
    pub wire_type: WireType,
}

impl FieldDescriptor {
    #[inline]
    pub fn value_kind(&self) -> ValueKind {
        self.wire_type.value_kind()
    }
}

/// Description of a repeating group: the NUMINGROUP field plus the ordered
/// layout of each entry. The first layout tag delimits entries.
#[derive(Debug, Clone)]
pub struct GroupDescriptor {
    pub tag: Tag,
    pub name: String,
    pub layout: Vec<(Tag, bool)>,
}

impl GroupDescriptor {
    /// The tag that must lead every entry of the group.
    #[inline]
    pub fn delimiter(&self) -> Tag {
        self.layout[0].0
    }

    #[inline]
    pub fn contains(&self, tag: Tag) -> bool {
        self.layout.iter().any(|&(t, _)| t == tag)
    }
}

/// An entry in the message type table.
#[derive(Debug, Clone)]
pub struct MsgTypeInfo {
    pub msg_type: String,
    pub name: String,
    pub application: bool,
}

/// Field/group/message tables for one FIX version, keyed by tag and by name.
pub struct Dictionary {
    begin_string: String,
    fields: HashMap<Tag, FieldDescriptor>,
    names: HashMap<String, Tag>,
    groups: HashMap<Tag, GroupDescriptor>,
    header_tags: Vec<Tag>,
    msg_types: HashMap<String, MsgTypeInfo>,
}

impl Dictionary {
    /// Builds the built-in FIX 4.4 dictionary.
    pub fn fix44() -> Dictionary {
        let mut dict = Dictionary {
            begin_string: "FIX.4.4".to_string(),
            fields: HashMap::new(),
            names: HashMap::new(),
            groups: HashMap::new(),
            header_tags: HEADER_TAGS.to_vec(),
            msg_types: HashMap::new(),
        };

        for &(tag, name, wire_type) in FIELDS {
            dict.add_field(tag, name, wire_type);
        }

        for &(tag, name, layout) in GROUPS {
            dict.add_group(tag, name, layout.to_vec());
        }

        for &(msg_type, name, application) in MESSAGES {
            dict.msg_types.insert(
                msg_type.to_string(),
                MsgTypeInfo {
                    msg_type: msg_type.to_string(),
                    name: name.to_string(),
                    application,
                },
            );
        }

        dict
    }

    /// Returns the shared built-in dictionary for a `fixversion` string, or
    /// `None` for an unsupported version.
    pub fn builtin(version: &str) -> Option<Arc<Dictionary>> {
        match version {
            "4.4" | "FIX.4.4" => Some(FIX44.clone()),
            _ => None,
        }
    }

    #[inline]
    pub fn begin_string(&self) -> &str {
        &self.begin_string
    }

    /// Registers a field descriptor, replacing any previous entry.
    pub fn add_field(&mut self, tag: Tag, name: &str, wire_type: WireType) {
        self.names.insert(name.to_string(), tag);
        self.fields.insert(
            tag,
            FieldDescriptor {
                tag,
                name: name.to_string(),
                wire_type,
            },
        );
    }

    /// Registers a repeating group and its NUMINGROUP field.
    pub fn add_group(&mut self, tag: Tag, name: &str, layout: Vec<(Tag, bool)>) {
        assert!(!layout.is_empty(), "group layout must not be empty");
        self.add_field(tag, name, WireType::NumInGroup);
        self.groups.insert(
            tag,
            GroupDescriptor {
                tag,
                name: name.to_string(),
                layout,
            },
        );
    }

    #[inline]
    pub fn field(&self, tag: Tag) -> Option<&FieldDescriptor> {
        self.fields.get(&tag)
    }

    #[inline]
    pub fn field_by_name(&self, name: &str) -> Option<&FieldDescriptor> {
        self.names.get(name).and_then(|tag| self.fields.get(tag))
    }

    #[inline]
    pub fn group(&self, tag: Tag) -> Option<&GroupDescriptor> {
        self.groups.get(&tag)
    }

    /// Ordered header tags for this version (including the computed
    /// BeginString/BodyLength/MsgType slots).
    #[inline]
    pub fn header_tags(&self) -> &[Tag] {
        &self.header_tags
    }

    #[inline]
    pub fn is_header_tag(&self, tag: Tag) -> bool {
        self.header_tags.contains(&tag)
    }

    #[inline]
    pub fn msg_type(&self, msg_type: &str) -> Option<&MsgTypeInfo> {
        self.msg_types.get(msg_type)
    }

    /// Looks a message type up by its symbolic name, e.g. "NewOrderSingle".
    pub fn msg_type_by_name(&self, name: &str) -> Option<&MsgTypeInfo> {
        self.msg_types.values().find(|info| info.name == name)
    }

    /// True if the message type is known and belongs to the application
    /// category.
    #[inline]
    pub fn is_application(&self, msg_type: &str) -> bool {
        self.msg_types
            .get(msg_type)
            .map(|info| info.application)
            .unwrap_or(false)
    }
}

lazy_static! {
    static ref FIX44: Arc<Dictionary> = Arc::new(Dictionary::fix44());
}

// Generated from the FIX 4.4 schema. Header order follows the standard
// header component.
const HEADER_TAGS: &[Tag] = &[
    8, 9, 35, 49, 56, 115, 128, 90, 91, 34, 50, 142, 57, 143, 116, 144, 129, 145, 43, 97, 52, 122,
    212, 213, 347, 369,
];

const FIELDS: &[(Tag, &str, WireType)] = &[
    (1, "Account", WireType::Str),
    (6, "AvgPx", WireType::Price),
    (7, "BeginSeqNo", WireType::SeqNum),
    (8, "BeginString", WireType::Str),
    (9, "BodyLength", WireType::Length),
    (10, "CheckSum", WireType::Str),
    (11, "ClOrdID", WireType::Str),
    (14, "CumQty", WireType::Qty),
    (15, "Currency", WireType::Currency),
    (16, "EndSeqNo", WireType::SeqNum),
    (17, "ExecID", WireType::Str),
    (22, "SecurityIDSource", WireType::Str),
    (31, "LastPx", WireType::Price),
    (32, "LastQty", WireType::Qty),
    (34, "MsgSeqNum", WireType::SeqNum),
    (35, "MsgType", WireType::Str),
    (36, "NewSeqNo", WireType::SeqNum),
    (37, "OrderID", WireType::Str),
    (38, "OrderQty", WireType::Qty),
    (39, "OrdStatus", WireType::Char),
    (40, "OrdType", WireType::Char),
    (41, "OrigClOrdID", WireType::Str),
    (43, "PossDupFlag", WireType::Boolean),
    (44, "Price", WireType::Price),
    (45, "RefSeqNum", WireType::SeqNum),
    (48, "SecurityID", WireType::Str),
    (49, "SenderCompID", WireType::Str),
    (50, "SenderSubID", WireType::Str),
    (52, "SendingTime", WireType::UtcTimestamp),
    (54, "Side", WireType::Char),
    (55, "Symbol", WireType::Str),
    (56, "TargetCompID", WireType::Str),
    (57, "TargetSubID", WireType::Str),
    (58, "Text", WireType::Str),
    (59, "TimeInForce", WireType::Char),
    (60, "TransactTime", WireType::UtcTimestamp),
    (64, "SettlDate", WireType::LocalMktDate),
    (65, "SymbolSfx", WireType::Str),
    (75, "TradeDate", WireType::LocalMktDate),
    (89, "Signature", WireType::Data),
    (90, "SecureDataLen", WireType::Length),
    (91, "SecureData", WireType::Data),
    (93, "SignatureLength", WireType::Length),
    (97, "PossResend", WireType::Boolean),
    (98, "EncryptMethod", WireType::Int),
    (102, "CxlRejReason", WireType::Int),
    (103, "OrdRejReason", WireType::Int),
    (108, "HeartBtInt", WireType::Int),
    (112, "TestReqID", WireType::Str),
    (115, "OnBehalfOfCompID", WireType::Str),
    (116, "OnBehalfOfSubID", WireType::Str),
    (122, "OrigSendingTime", WireType::UtcTimestamp),
    (123, "GapFillFlag", WireType::Boolean),
    (128, "DeliverToCompID", WireType::Str),
    (129, "DeliverToSubID", WireType::Str),
    (141, "ResetSeqNumFlag", WireType::Boolean),
    (142, "SenderLocationID", WireType::Str),
    (143, "TargetLocationID", WireType::Str),
    (144, "OnBehalfOfLocationID", WireType::Str),
    (145, "DeliverToLocationID", WireType::Str),
    (146, "NoRelatedSym", WireType::NumInGroup),
    (150, "ExecType", WireType::Char),
    (151, "LeavesQty", WireType::Qty),
    (212, "XmlDataLen", WireType::Length),
    (213, "XmlData", WireType::Data),
    (262, "MDReqID", WireType::Str),
    (263, "SubscriptionRequestType", WireType::Char),
    (264, "MarketDepth", WireType::Int),
    (268, "NoMDEntries", WireType::NumInGroup),
    (269, "MDEntryType", WireType::Char),
    (270, "MDEntryPx", WireType::Price),
    (271, "MDEntrySize", WireType::Qty),
    (272, "MDEntryDate", WireType::UtcDateOnly),
    (273, "MDEntryTime", WireType::UtcTimeOnly),
    (347, "MessageEncoding", WireType::Str),
    (369, "LastMsgSeqNumProcessed", WireType::SeqNum),
    (371, "RefTagID", WireType::Int),
    (372, "RefMsgType", WireType::Str),
    (373, "SessionRejectReason", WireType::Int),
    (434, "CxlRejResponseTo", WireType::Char),
    (553, "Username", WireType::Str),
    (554, "Password", WireType::Str),
];

const GROUPS: &[(Tag, &str, &[(Tag, bool)])] = &[
    (146, "NoRelatedSym", &[(55, true), (65, false), (48, false), (22, false)]),
    (
        268,
        "NoMDEntries",
        &[(269, true), (270, false), (271, false), (272, false), (273, false)],
    ),
];

const MESSAGES: &[(&str, &str, bool)] = &[
    ("0", "Heartbeat", false),
    ("1", "TestRequest", false),
    ("2", "ResendRequest", false),
    ("3", "Reject", false),
    ("4", "SequenceReset", false),
    ("5", "Logout", false),
    ("A", "Logon", false),
    ("8", "ExecutionReport", true),
    ("9", "OrderCancelReject", true),
    ("D", "NewOrderSingle", true),
    ("F", "OrderCancelRequest", true),
    ("G", "OrderCancelReplaceRequest", true),
    ("V", "MarketDataRequest", true),
    ("W", "MarketDataSnapshotFullRefresh", true),
    ("X", "MarketDataIncrementalRefresh", true),
];
