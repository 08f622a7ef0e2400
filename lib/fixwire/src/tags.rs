//! Tag numbers the engine itself needs to know about. The full field set
//! lives in the dictionary table; these constants exist so session code does
//! not sprinkle bare numbers around.

use crate::Tag;

pub const ACCOUNT: Tag = 1;
pub const BEGIN_SEQ_NO: Tag = 7;
pub const BEGIN_STRING: Tag = 8;
pub const BODY_LENGTH: Tag = 9;
pub const CHECK_SUM: Tag = 10;
pub const END_SEQ_NO: Tag = 16;
pub const MSG_SEQ_NUM: Tag = 34;
pub const MSG_TYPE: Tag = 35;
pub const NEW_SEQ_NO: Tag = 36;
pub const POSS_DUP_FLAG: Tag = 43;
pub const REF_SEQ_NUM: Tag = 45;
pub const SENDER_COMP_ID: Tag = 49;
pub const SENDING_TIME: Tag = 52;
pub const TARGET_COMP_ID: Tag = 56;
pub const TEXT: Tag = 58;
pub const ENCRYPT_METHOD: Tag = 98;
pub const HEART_BT_INT: Tag = 108;
pub const TEST_REQ_ID: Tag = 112;
pub const ORIG_SENDING_TIME: Tag = 122;
pub const GAP_FILL_FLAG: Tag = 123;
pub const RESET_SEQ_NUM_FLAG: Tag = 141;
pub const REF_TAG_ID: Tag = 371;
pub const REF_MSG_TYPE: Tag = 372;
pub const SESSION_REJECT_REASON: Tag = 373;

/// Session-level MsgType values.
pub const MSGT_HEARTBEAT: &str = "0";
pub const MSGT_TEST_REQUEST: &str = "1";
pub const MSGT_RESEND_REQUEST: &str = "2";
pub const MSGT_REJECT: &str = "3";
pub const MSGT_SEQUENCE_RESET: &str = "4";
pub const MSGT_LOGOUT: &str = "5";
pub const MSGT_LOGON: &str = "A";

/// SessionRejectReason (373) values the engine emits.
pub const REJECT_REQUIRED_TAG_MISSING: u32 = 1;
pub const REJECT_VALUE_INCORRECT: u32 = 5;
pub const REJECT_INCORRECT_DATA_FORMAT: u32 = 6;
pub const REJECT_COMPID_PROBLEM: u32 = 9;
pub const REJECT_INVALID_MSGTYPE: u32 = 11;
