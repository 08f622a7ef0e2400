//! The FIX session-rule layer: sequence-number bookkeeping, gap detection
//! and buffering, session-message handling and the resend walk over the
//! message store. The layer is transport-free; every inbound message
//! produces a list of explicit actions for the session state machine to
//! execute, and every outbound message passes through `send` which assigns
//! the next sequence number and makes the record durable before the bytes
//! may reach the wire.

use crate::config::{ResendMode, SessionConfig};
use crate::error::{SessionError, SessionErrorKind};
use crate::store::{MessageStore, SessionState};
use fixwire::codec::{self, GarbledReason, ParseOutcome};
use fixwire::dict::Dictionary;
use fixwire::logging::{self, Logger};
use fixwire::message::{self, FixMessage};
use fixwire::{tags, time, SeqNum};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Where an inbound sequence number lands relative to the expected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    InOrder,
    Gap { begin: SeqNum, end: SeqNum },
    Duplicate,
    Stale,
}

/// What the session state machine must do in response to an inbound
/// message.
#[derive(Debug)]
pub enum Action {
    /// Forward a validated application message upstream.
    Deliver(FixMessage),
    /// Hand serialized bytes to the transport.
    Transmit(Vec<u8>),
    /// A valid Logon arrived; the session decides what that means in its
    /// current phase.
    LogonAccepted { heartbeat: u64, reset: bool },
    /// The peer initiated a Logout and the reply has been queued.
    LogoutReplied,
    /// The peer answered our own Logout.
    LogoutConfirmed,
    /// Unrecoverable session-rule violation.
    Fatal(SessionError),
}

pub struct FixProtocol {
    dict: Arc<Dictionary>,
    state: SessionState,
    store: Option<MessageStore>,
    resend_mode: ResendMode,
    sender: String,
    target: String,
    heartbeat: u64,
    reset_on_logon: bool,
    reset_pending: bool,
    logout_sent: bool,
    pending: BTreeMap<SeqNum, FixMessage>,
    gap: Option<(SeqNum, SeqNum)>,
    log: Logger,
}

impl FixProtocol {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        dict: Arc<Dictionary>,
        config: &SessionConfig,
        log: L,
    ) -> FixProtocol {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        FixProtocol {
            dict,
            state: SessionState::default(),
            store: None,
            resend_mode: config.resend_mode,
            sender: config.sender_comp_id.clone(),
            target: config.target_comp_id.clone(),
            heartbeat: config.heartbeat_interval,
            reset_on_logon: config.reset_seqno,
            reset_pending: false,
            logout_sent: false,
            pending: BTreeMap::new(),
            gap: None,
            log,
        }
    }

    #[inline]
    pub fn dict(&self) -> &Arc<Dictionary> {
        &self.dict
    }

    #[inline]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    #[inline]
    pub fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    #[inline]
    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    #[inline]
    pub fn set_store(&mut self, store: MessageStore) {
        self.store = Some(store);
    }

    /// Re-applies configurable knobs; the session calls this on start, after
    /// any late `set_conf` updates.
    pub fn reconfigure(&mut self, config: &SessionConfig) {
        self.resend_mode = config.resend_mode;
        self.sender = config.sender_comp_id.clone();
        self.target = config.target_comp_id.clone();
        self.heartbeat = config.heartbeat_interval;
        self.reset_on_logon = config.reset_seqno;
    }

    /// Clears per-connection transients (gap tracking, logout handshake)
    /// while keeping the persistent counters.
    pub fn on_disconnect(&mut self) {
        self.pending.clear();
        self.gap = None;
        self.logout_sent = false;
        self.reset_pending = false;
    }

    /// Assigns the next outbound seqnum, stamps the header, appends the
    /// serialized message to the store and only then returns the bytes.
    pub fn send(&mut self, mut msg: FixMessage) -> Result<Vec<u8>, SessionError> {
        let seq = self.state.next_out;
        let bytes = self.serialize_at(&mut msg, seq);

        if let Some(store) = &mut self.store {
            store.save(seq, &bytes).map_err(|err| {
                SessionError::with_detail(SessionErrorKind::Store, err.to_string())
            })?;
        }

        self.state.next_out = seq + 1;
        Ok(bytes)
    }

    /// Builds the outbound Logon, resetting both counters first when
    /// `reset_seqno` is configured.
    pub fn logon(&mut self) -> Result<Vec<u8>, SessionError> {
        if self.reset_on_logon {
            self.reset_epoch();
            self.reset_pending = true;
        }
        self.send(message::logon(self.heartbeat, self.reset_on_logon))
    }

    /// Both counters back to 1 and the old outbound records dropped; after
    /// a mutual reset the peer can never legitimately ask for them again.
    fn reset_epoch(&mut self) {
        self.state.reset();
        if let Some(store) = &mut self.store {
            if let Err(err) = store.truncate() {
                logging::warn!(self.log, "store truncate failed";
                               "context" => "reset_epoch",
                               "error" => %err);
            }
        }
    }

    /// The server-side Logon reply; echoes the reset flag when the client
    /// requested a sequence reset.
    pub fn logon_reply(&mut self, reset: bool) -> Result<Vec<u8>, SessionError> {
        self.send(message::logon(self.heartbeat, reset))
    }

    pub fn logout(&mut self, text: Option<&str>) -> Result<Vec<u8>, SessionError> {
        self.logout_sent = true;
        self.send(message::logout(text))
    }

    pub fn heartbeat(&mut self, test_req_id: Option<&[u8]>) -> Result<Vec<u8>, SessionError> {
        self.send(message::heartbeat(test_req_id))
    }

    pub fn test_request(&mut self, id: &str) -> Result<Vec<u8>, SessionError> {
        self.send(message::test_request(id))
    }

    /// Checks an inbound Logon: right type, swapped comp ids, a heartbeat
    /// interval. Returns the peer's HeartBtInt.
    pub fn validate_logon(&self, msg: &FixMessage) -> Result<u64, SessionError> {
        if msg.msg_type != tags::MSGT_LOGON {
            return Err(SessionError::with_detail(
                SessionErrorKind::InvalidLogin,
                format!("expected Logon, got MsgType={}", msg.msg_type),
            ));
        }

        let sender = msg.get_str(tags::SENDER_COMP_ID).unwrap_or("");
        let target = msg.get_str(tags::TARGET_COMP_ID).unwrap_or("");
        if sender != self.target || target != self.sender {
            return Err(SessionError::with_detail(
                SessionErrorKind::LoginFailed,
                format!("comp id mismatch: {}->{}", sender, target),
            ));
        }

        msg.get_uint(tags::HEART_BT_INT)
            .ok_or_else(|| SessionError::new(SessionErrorKind::InvalidLogin))
    }

    /// Runs the session rules over one framed inbound message.
    pub fn on_message(&mut self, msg: FixMessage) -> Vec<Action> {
        let mut actions = Vec::new();
        self.process(msg, &mut actions);
        actions
    }

    /// Builds the Reject for a frame-level garble. The frame never consumed
    /// a sequence number, so `expected_in` stays put.
    pub fn reject_garbled(
        &mut self,
        reason: GarbledReason,
        ref_seq: Option<SeqNum>,
    ) -> Result<Vec<u8>, SessionError> {
        let (code, text) = match reason {
            GarbledReason::Checksum => (tags::REJECT_VALUE_INCORRECT, "Incorrect CheckSum"),
            GarbledReason::BodyLength => (tags::REJECT_VALUE_INCORRECT, "BodyLength mismatch"),
            GarbledReason::BeginString => (tags::REJECT_VALUE_INCORRECT, "BeginString mismatch"),
            GarbledReason::MsgType => (tags::REJECT_INVALID_MSGTYPE, "Malformed MsgType"),
            GarbledReason::MissingHeader(_) => {
                (tags::REJECT_REQUIRED_TAG_MISSING, "Required header field missing")
            }
            GarbledReason::Malformed => {
                (tags::REJECT_INCORRECT_DATA_FORMAT, "Malformed message")
            }
        };
        self.send(message::reject(ref_seq.unwrap_or(0), code, text))
    }

    fn process(&mut self, msg: FixMessage, actions: &mut Vec<Action>) {
        // A Reset-mode SequenceReset forcibly moves the inbound counter and
        // is honoured regardless of its own sequence number.
        if msg.msg_type == tags::MSGT_SEQUENCE_RESET && !msg.get_bool(tags::GAP_FILL_FLAG) {
            match msg.get_uint(tags::NEW_SEQ_NO) {
                Some(new_seq) => {
                    logging::info!(self.log, "sequence reset";
                                   "context" => "process",
                                   "new_seq_no" => new_seq,
                                   "expected_in" => self.state.next_in);
                    self.state.next_in = new_seq;
                    self.drain_pending(actions);
                }
                None => self.transmit_reply(
                    message::reject(
                        msg.seq_num().unwrap_or(0),
                        tags::REJECT_REQUIRED_TAG_MISSING,
                        "SequenceReset without NewSeqNo",
                    ),
                    actions,
                ),
            }
            return;
        }

        // A Logon carrying ResetSeqNumFlag resets both sides before the
        // sequence check; skip the reset when we initiated it ourselves.
        if msg.msg_type == tags::MSGT_LOGON && msg.get_bool(tags::RESET_SEQ_NUM_FLAG) {
            if self.reset_pending {
                self.reset_pending = false;
            } else {
                logging::info!(self.log, "peer requested seqnum reset"; "context" => "process");
                self.reset_epoch();
            }
        }

        let seq = match msg.seq_num() {
            Some(seq) => seq,
            None => {
                actions.push(Action::Fatal(SessionError::with_detail(
                    SessionErrorKind::InvalidMessage,
                    "missing MsgSeqNum".to_string(),
                )));
                return;
            }
        };

        match self.check_seq(seq, &msg) {
            Disposition::InOrder => {
                self.state.next_in = seq + 1;
                self.dispatch(msg, actions);
                self.drain_pending(actions);
            }
            Disposition::Gap { begin, end } => {
                logging::debug!(self.log, "sequence gap detected";
                                "context" => "process",
                                "received" => seq,
                                "expected" => begin,
                                "gap_end" => end);
                self.pending.entry(seq).or_insert(msg);
                if self.gap.is_none() {
                    self.gap = Some((begin, end));
                    self.transmit_reply(message::resend_request(begin, end), actions);
                }
            }
            Disposition::Duplicate => {
                logging::debug!(self.log, "dropping duplicate";
                                "context" => "process",
                                "received" => seq,
                                "expected" => self.state.next_in);
            }
            Disposition::Stale => {
                logging::warn!(self.log, "sequence number below expected without PossDupFlag";
                               "context" => "process",
                               "received" => seq,
                               "expected" => self.state.next_in);
                match self.logout(Some("MsgSeqNum lower than expected")) {
                    Ok(bytes) => actions.push(Action::Transmit(bytes)),
                    Err(err) => actions.push(Action::Fatal(err)),
                }
                actions.push(Action::Fatal(SessionError::new(
                    SessionErrorKind::SequenceMismatch,
                )));
            }
        }
    }

    /// Classifies an inbound seqnum against the expected one.
    pub fn check_seq(&self, seq: SeqNum, msg: &FixMessage) -> Disposition {
        let expected = self.state.next_in;
        if seq == expected {
            Disposition::InOrder
        } else if seq > expected {
            Disposition::Gap {
                begin: expected,
                end: seq - 1,
            }
        } else if msg.poss_dup() {
            Disposition::Duplicate
        } else {
            Disposition::Stale
        }
    }

    /// Handles one in-order message.
    fn dispatch(&mut self, msg: FixMessage, actions: &mut Vec<Action>) {
        if !msg.is_session() {
            if self.dict.msg_type(&msg.msg_type).is_none() {
                logging::warn!(self.log, "unknown message type";
                               "context" => "dispatch",
                               "msg_type" => &msg.msg_type);
                let reject = message::reject(
                    msg.seq_num().unwrap_or(0),
                    tags::REJECT_INVALID_MSGTYPE,
                    "Unknown MsgType",
                );
                self.transmit_reply(reject, actions);
                return;
            }
            actions.push(Action::Deliver(msg));
            return;
        }

        match msg.msg_type.as_str() {
            tags::MSGT_HEARTBEAT => {}
            tags::MSGT_TEST_REQUEST => {
                let id = msg.get(tags::TEST_REQ_ID).map(|raw| raw.to_vec());
                match self.heartbeat(id.as_deref()) {
                    Ok(bytes) => actions.push(Action::Transmit(bytes)),
                    Err(err) => actions.push(Action::Fatal(err)),
                }
            }
            tags::MSGT_RESEND_REQUEST => {
                let begin = msg.get_uint(tags::BEGIN_SEQ_NO);
                let end = msg.get_uint(tags::END_SEQ_NO);
                match (begin, end) {
                    (Some(begin), Some(end)) => self.resend(begin, end, actions),
                    _ => self.transmit_reply(
                        message::reject(
                            msg.seq_num().unwrap_or(0),
                            tags::REJECT_REQUIRED_TAG_MISSING,
                            "ResendRequest without range",
                        ),
                        actions,
                    ),
                }
            }
            tags::MSGT_REJECT => {
                logging::warn!(self.log, "session-level reject from peer";
                               "context" => "dispatch",
                               "ref_seq_num" => msg.get_uint(tags::REF_SEQ_NUM),
                               "reason" => msg.get_uint(tags::SESSION_REJECT_REASON),
                               "text" => msg.get_str(tags::TEXT).unwrap_or(""));
            }
            tags::MSGT_SEQUENCE_RESET => {
                // GapFill mode; Reset mode was intercepted earlier.
                match msg.get_uint(tags::NEW_SEQ_NO) {
                    Some(new_seq) if new_seq >= self.state.next_in => {
                        logging::debug!(self.log, "gap fill";
                                        "context" => "dispatch",
                                        "new_seq_no" => new_seq);
                        self.state.next_in = new_seq;
                    }
                    Some(new_seq) => self.transmit_reply(
                        message::reject(
                            msg.seq_num().unwrap_or(0),
                            tags::REJECT_VALUE_INCORRECT,
                            &format!("NewSeqNo {} below expected", new_seq),
                        ),
                        actions,
                    ),
                    None => self.transmit_reply(
                        message::reject(
                            msg.seq_num().unwrap_or(0),
                            tags::REJECT_REQUIRED_TAG_MISSING,
                            "SequenceReset without NewSeqNo",
                        ),
                        actions,
                    ),
                }
            }
            tags::MSGT_LOGOUT => {
                if self.logout_sent {
                    actions.push(Action::LogoutConfirmed);
                } else {
                    match self.logout(None) {
                        Ok(bytes) => actions.push(Action::Transmit(bytes)),
                        Err(err) => actions.push(Action::Fatal(err)),
                    }
                    actions.push(Action::LogoutReplied);
                }
            }
            tags::MSGT_LOGON => {
                let heartbeat = msg.get_uint(tags::HEART_BT_INT).unwrap_or(self.heartbeat);
                let reset = msg.get_bool(tags::RESET_SEQ_NUM_FLAG);
                actions.push(Action::LogonAccepted { heartbeat, reset });
            }
            _ => unreachable!("is_session covers every session type"),
        }
    }

    /// Delivers buffered messages that have become contiguous, clears a
    /// satisfied gap and re-requests any residue.
    fn drain_pending(&mut self, actions: &mut Vec<Action>) {
        while let Some(msg) = self.pending.remove(&self.state.next_in) {
            let seq = msg.seq_num().expect("buffered message must carry a seqnum");
            self.state.next_in = seq + 1;
            self.dispatch(msg, actions);
        }

        // Drop buffered duplicates the drain ran past.
        let next_in = self.state.next_in;
        self.pending = self.pending.split_off(&next_in);

        if let Some((_, end)) = self.gap {
            if self.state.next_in > end {
                self.gap = None;
            }
        }

        // Anything still buffered means another hole; collapse to the
        // lowest outstanding range.
        if self.gap.is_none() {
            if let Some((&first, _)) = self.pending.iter().next() {
                let begin = self.state.next_in;
                let end = first - 1;
                self.gap = Some((begin, end));
                self.transmit_reply(message::resend_request(begin, end), actions);
            }
        }
    }

    /// Replays stored messages for a peer's ResendRequest. Application
    /// messages go out again with PossDupFlag=Y and OrigSendingTime; in
    /// GAPFILL mode session-message runs (and records missing from the
    /// store) collapse into SequenceReset(GapFill=Y).
    fn resend(&mut self, begin: SeqNum, end_req: SeqNum, actions: &mut Vec<Action>) {
        let last = self.state.next_out.saturating_sub(1);
        let end = if end_req == 0 { last } else { end_req.min(last) };
        if last == 0 || begin > end {
            logging::warn!(self.log, "resend request outside stored range";
                           "context" => "resend",
                           "begin" => begin,
                           "end" => end_req,
                           "last" => last);
            return;
        }

        logging::info!(self.log, "resending";
                       "context" => "resend",
                       "begin" => begin,
                       "end" => end,
                       "mode" => ?self.resend_mode);

        let mut found: BTreeMap<SeqNum, Vec<u8>> = BTreeMap::new();
        if let Some(store) = &mut self.store {
            let mut pos = 0;
            loop {
                match store.next(pos) {
                    Ok(Some(record)) => {
                        pos = record.next_pos;
                        if record.seq > end {
                            break;
                        }
                        if record.seq >= begin {
                            found.insert(record.seq, record.data);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        logging::error!(self.log, "store read failed during resend";
                                        "context" => "resend",
                                        "error" => %err);
                        break;
                    }
                }
            }
        }

        let mut run_start: Option<SeqNum> = None;
        for seq in begin..=end {
            let replay = match found.get(&seq) {
                None => None,
                Some(bytes) => match codec::extract(bytes, &self.dict) {
                    ParseOutcome::Message { msg, .. } => {
                        let collapse = msg.is_session() && self.resend_mode == ResendMode::GapFill;
                        if collapse {
                            None
                        } else {
                            Some(*msg)
                        }
                    }
                    _ => {
                        logging::error!(self.log, "unparseable stored record";
                                        "context" => "resend",
                                        "seq" => seq);
                        None
                    }
                },
            };

            match replay {
                Some(mut msg) => {
                    if let Some(start) = run_start.take() {
                        actions.push(Action::Transmit(self.gap_fill(start, seq)));
                    }
                    let orig = msg.sending_time().map(|raw| raw.to_vec());
                    msg.set_header(tags::POSS_DUP_FLAG, "Y");
                    if let Some(orig) = orig {
                        msg.set_header(tags::ORIG_SENDING_TIME, orig);
                    }
                    let bytes = self.serialize_at(&mut msg, seq);
                    actions.push(Action::Transmit(bytes));
                }
                None => {
                    if run_start.is_none() {
                        run_start = Some(seq);
                    }
                }
            }
        }

        if let Some(start) = run_start.take() {
            actions.push(Action::Transmit(self.gap_fill(start, end + 1)));
        }
    }

    /// A SequenceReset(GapFill=Y) replacing the records `seq..new_seq_no`.
    /// Carries the seqnum of the first replaced record and is not stored.
    fn gap_fill(&self, seq: SeqNum, new_seq_no: SeqNum) -> Vec<u8> {
        let mut msg = message::sequence_reset(new_seq_no, true);
        msg.set_header(tags::POSS_DUP_FLAG, "Y");
        self.serialize_at(&mut msg, seq)
    }

    /// Stamps identity, seqnum and SendingTime, then serializes. Does not
    /// touch the store or the outbound counter.
    fn serialize_at(&self, msg: &mut FixMessage, seq: SeqNum) -> Vec<u8> {
        msg.set_header(tags::SENDER_COMP_ID, self.sender.as_str());
        msg.set_header(tags::TARGET_COMP_ID, self.target.as_str());
        msg.set_header(tags::MSG_SEQ_NUM, seq.to_string());
        msg.set_header(tags::SENDING_TIME, time::utc_timestamp());
        codec::serialize(msg, &self.dict)
    }

    /// Sends a rules-generated reply, folding store failures into Fatal.
    fn transmit_reply(&mut self, msg: FixMessage, actions: &mut Vec<Action>) {
        match self.send(msg) {
            Ok(bytes) => actions.push(Action::Transmit(bytes)),
            Err(err) => actions.push(Action::Fatal(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(sender: &str, target: &str) -> SessionConfig {
        let mut config = SessionConfig::default();
        config.sender_comp_id = sender.to_string();
        config.target_comp_id = target.to_string();
        config.heartbeat_interval = 30;
        config
    }

    fn client() -> FixProtocol {
        FixProtocol::new(Dictionary::builtin("4.4").unwrap(), &config("ASIDE", "BSIDE"), None)
    }

    fn server() -> FixProtocol {
        FixProtocol::new(Dictionary::builtin("4.4").unwrap(), &config("BSIDE", "ASIDE"), None)
    }

    fn parse(bytes: &[u8]) -> FixMessage {
        let dict = Dictionary::builtin("4.4").unwrap();
        match codec::extract(bytes, &dict) {
            ParseOutcome::Message { msg, .. } => *msg,
            other => panic!("Unexpected outcome {:?}", other),
        }
    }

    fn order(cl_ord_id: &str) -> FixMessage {
        let mut msg = FixMessage::new("D");
        msg.set_body(11, cl_ord_id);
        msg.set_body(55, "FOO");
        msg.set_body(54, "1");
        msg.set_body(38, "100");
        msg
    }

    #[test]
    fn test_outbound_assignment_is_monotonic() {
        let mut fix = client();

        for expected in 1..=3u64 {
            let bytes = fix.send(order("oid")).unwrap();
            let msg = parse(&bytes);
            assert_eq!(msg.seq_num(), Some(expected));
            assert_eq!(msg.get_str(49), Some("ASIDE"));
            assert_eq!(msg.get_str(56), Some("BSIDE"));
        }
        assert_eq!(fix.state().next_out, 4);
    }

    #[test]
    fn test_durable_before_send() {
        let dir = TempDir::new().unwrap();
        let mut fix = client();
        fix.set_store(MessageStore::new(dir.path().join("out.log")));

        let bytes = fix.send(order("oid-1")).unwrap();

        let mut store = MessageStore::new(dir.path().join("out.log"));
        let record = store.find(1, 0).unwrap().unwrap();
        assert_eq!(record.data, bytes);
    }

    #[test]
    fn test_clean_login_handshake() {
        let mut client = client();
        let mut server = server();

        let logon = client.logon().unwrap();
        let actions = server.on_message(parse(&logon));
        match &actions[..] {
            [Action::LogonAccepted { heartbeat, reset }] => {
                assert_eq!(*heartbeat, 30);
                assert!(!*reset);
            }
            other => panic!("Unexpected actions {:?}", other),
        }

        let reply = server.logon_reply(false).unwrap();
        let actions = client.on_message(parse(&reply));
        assert!(matches!(&actions[..], [Action::LogonAccepted { .. }]));

        assert_eq!(client.state().next_out, 2);
        assert_eq!(client.state().next_in, 2);
        assert_eq!(server.state().next_out, 2);
        assert_eq!(server.state().next_in, 2);
    }

    #[test]
    fn test_validate_logon_checks_identity() {
        let client = client();
        let mut other = server();
        let logon = other.logon().unwrap();

        assert_eq!(client.validate_logon(&parse(&logon)).unwrap(), 30);

        let mut stranger = FixProtocol::new(
            Dictionary::builtin("4.4").unwrap(),
            &config("XSIDE", "ASIDE"),
            None,
        );
        let bad = stranger.logon().unwrap();
        let err = client.validate_logon(&parse(&bad)).unwrap_err();
        assert_eq!(err.kind, SessionErrorKind::LoginFailed);

        let not_logon = order("x");
        let err = client.validate_logon(&not_logon).unwrap_err();
        assert_eq!(err.kind, SessionErrorKind::InvalidLogin);
    }

    #[test]
    fn test_gap_detection_buffers_and_requests() {
        let dir = TempDir::new().unwrap();
        let mut client = client();
        let mut server = stored_session(&dir, ResendMode::GapFill);

        // Both sides believe they are logged in.
        let logon = server.logon().unwrap();
        client.on_message(parse(&logon));
        let reply = client.logon_reply(false).unwrap();
        server.on_message(parse(&reply));

        // Server emits 2,3,4,5; 3 is lost in transit.
        let m2 = server.send(order("oid-2")).unwrap();
        let _m3 = server.send(order("oid-3")).unwrap();
        let m4 = server.send(order("oid-4")).unwrap();
        let m5 = server.send(order("oid-5")).unwrap();

        let actions = client.on_message(parse(&m2));
        assert!(matches!(&actions[..], [Action::Deliver(_)]));

        // 4 arrives: buffered, ResendRequest(3,3) queued.
        let actions = client.on_message(parse(&m4));
        let request_bytes = match &actions[..] {
            [Action::Transmit(bytes)] => {
                let request = parse(bytes);
                assert_eq!(request.msg_type, "2");
                assert_eq!(request.get_uint(7), Some(3));
                assert_eq!(request.get_uint(16), Some(3));
                bytes.clone()
            }
            other => panic!("Unexpected actions {:?}", other),
        };

        // 5 arrives while the gap is outstanding: buffered silently.
        let actions = client.on_message(parse(&m5));
        assert!(actions.is_empty());
        assert_eq!(client.state().next_in, 3);

        // Server answers the resend request with 3 carrying PossDupFlag.
        let actions = server.on_message(parse(&request_bytes));
        let resent = transmitted(&actions);
        assert_eq!(resent.len(), 1);
        assert!(resent[0].poss_dup());
        assert_eq!(resent[0].seq_num(), Some(3));

        // The client then delivers 3, 4 and 5 in order.
        let bytes = codec::serialize(&resent[0], client.dict());
        let actions = client.on_message(parse(&bytes));
        let delivered: Vec<_> = actions
            .iter()
            .filter_map(|action| match action {
                Action::Deliver(msg) => msg.seq_num(),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![3, 4, 5]);
        assert_eq!(client.state().next_in, 6);
        assert!(client.gap.is_none());
    }

    #[test]
    fn test_gap_fill_and_in_order_drain() {
        let mut client = client();
        // Skip login bookkeeping; pretend 1 was consumed.
        client.state_mut().next_in = 2;

        let mut server = server();
        server.state_mut().next_out = 2;

        let _m2 = server.send(order("oid-2")).unwrap();
        let m3 = server.send(order("oid-3")).unwrap();
        let m4 = server.send(order("oid-4")).unwrap();

        // 3 and 4 arrive, 2 never does; one gap request for (2,2).
        let actions = client.on_message(parse(&m3));
        assert_eq!(actions.len(), 1);
        let actions = client.on_message(parse(&m4));
        assert!(actions.is_empty());

        // The peer answers with a gap fill jumping over 2.
        let mut gap_fill = message::sequence_reset(3, true);
        gap_fill.set_header(43, "Y");
        let bytes = server_stamp(&mut server, &mut gap_fill, 2);

        let actions = client.on_message(parse(&bytes));
        // Gap fill advances to 3, then the buffered 3 and 4 drain.
        let delivered: Vec<_> = actions
            .iter()
            .filter_map(|action| match action {
                Action::Deliver(msg) => Some(msg.seq_num().unwrap()),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![3, 4]);
        assert_eq!(client.state().next_in, 5);
    }

    fn server_stamp(server: &mut FixProtocol, msg: &mut FixMessage, seq: SeqNum) -> Vec<u8> {
        server.serialize_at(msg, seq)
    }

    #[test]
    fn test_possdup_below_expected_is_dropped() {
        let mut client = client();
        client.state_mut().next_in = 5;

        let mut server = server();
        let mut dup = order("old");
        dup.set_header(43, "Y");
        let bytes = server_stamp(&mut server, &mut dup, 2);

        let actions = client.on_message(parse(&bytes));
        assert!(actions.is_empty());
        assert_eq!(client.state().next_in, 5);
    }

    #[test]
    fn test_stale_without_possdup_is_fatal() {
        let mut client = client();
        client.state_mut().next_in = 5;

        let mut server = server();
        let bytes = server_stamp(&mut server, &mut order("old"), 2);

        let actions = client.on_message(parse(&bytes));
        match &actions[..] {
            [Action::Transmit(logout), Action::Fatal(err)] => {
                assert_eq!(parse(logout).msg_type, "5");
                assert_eq!(err.kind, SessionErrorKind::SequenceMismatch);
            }
            other => panic!("Unexpected actions {:?}", other),
        }
    }

    #[test]
    fn test_reset_mode_sequence_reset() {
        let mut client = client();
        client.state_mut().next_in = 5;

        let mut server = server();
        let mut reset = message::sequence_reset(20, false);
        // Reset mode applies even with a stale seqnum.
        let bytes = server_stamp(&mut server, &mut reset, 1);

        let actions = client.on_message(parse(&bytes));
        assert!(actions.is_empty());
        assert_eq!(client.state().next_in, 20);
    }

    #[test]
    fn test_reset_on_logon_both_sides() {
        let mut config_reset = config("ASIDE", "BSIDE");
        config_reset.reset_seqno = true;
        let mut client =
            FixProtocol::new(Dictionary::builtin("4.4").unwrap(), &config_reset, None);
        client.state_mut().next_out = 40;
        client.state_mut().next_in = 50;

        let mut server = server();
        server.state_mut().next_out = 40;
        server.state_mut().next_in = 50;

        let logon = client.logon().unwrap();
        let msg = parse(&logon);
        assert_eq!(msg.seq_num(), Some(1));
        assert!(msg.get_bool(141));
        assert_eq!(client.state().next_out, 2);
        assert_eq!(client.state().next_in, 1);

        let actions = server.on_message(msg);
        match &actions[..] {
            [Action::LogonAccepted { reset, .. }] => assert!(*reset),
            other => panic!("Unexpected actions {:?}", other),
        }
        assert_eq!(server.state().next_in, 2);

        let reply = server.logon_reply(true).unwrap();
        let reply = parse(&reply);
        assert_eq!(reply.seq_num(), Some(1));

        // The client must not reset again on the echoed flag.
        client.on_message(reply);
        assert_eq!(client.state().next_out, 2);
        assert_eq!(client.state().next_in, 2);
    }

    #[test]
    fn test_test_request_answered_with_heartbeat() {
        let mut client = client();
        let mut server = server();
        client.state_mut().next_in = 1;

        let request = server.test_request("probe-7").unwrap();
        let actions = client.on_message(parse(&request));

        match &actions[..] {
            [Action::Transmit(bytes)] => {
                let reply = parse(bytes);
                assert_eq!(reply.msg_type, "0");
                assert_eq!(reply.get_str(112), Some("probe-7"));
            }
            other => panic!("Unexpected actions {:?}", other),
        }
    }

    #[test]
    fn test_unknown_msgtype_rejected_and_counted() {
        let mut client = client();
        let mut server = server();

        let mut unknown = FixMessage::new("zz");
        unknown.set_body(58, "?");
        let bytes = server_stamp(&mut server, &mut unknown, 1);

        let actions = client.on_message(parse(&bytes));
        match &actions[..] {
            [Action::Transmit(bytes)] => {
                let reject = parse(bytes);
                assert_eq!(reject.msg_type, "3");
                assert_eq!(reject.get_uint(45), Some(1));
            }
            other => panic!("Unexpected actions {:?}", other),
        }
        // The malformed message still consumed its seqnum.
        assert_eq!(client.state().next_in, 2);
    }

    #[test]
    fn test_peer_logout_is_replied() {
        let mut client = client();
        let mut server = server();

        let logout = server.logout(None).unwrap();
        let actions = client.on_message(parse(&logout));

        match &actions[..] {
            [Action::Transmit(bytes), Action::LogoutReplied] => {
                assert_eq!(parse(bytes).msg_type, "5");
            }
            other => panic!("Unexpected actions {:?}", other),
        }
    }

    #[test]
    fn test_logout_confirmation() {
        let mut client = client();
        let mut server = server();

        let _ = client.logout(None).unwrap();
        let reply = server.logout(None).unwrap();
        let actions = client.on_message(parse(&reply));

        assert!(matches!(&actions[..], [Action::LogoutConfirmed]));
    }

    fn stored_session(dir: &TempDir, mode: ResendMode) -> FixProtocol {
        let mut cfg = config("BSIDE", "ASIDE");
        cfg.resend_mode = mode;
        let mut fix = FixProtocol::new(Dictionary::builtin("4.4").unwrap(), &cfg, None);
        fix.set_store(MessageStore::new(dir.path().join("out.log")));
        fix
    }

    fn transmitted(actions: &[Action]) -> Vec<FixMessage> {
        actions
            .iter()
            .map(|action| match action {
                Action::Transmit(bytes) => parse(bytes),
                other => panic!("Unexpected action {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_resend_gapfill_collapses_session_runs() {
        let dir = TempDir::new().unwrap();
        let mut fix = stored_session(&dir, ResendMode::GapFill);

        let _ = fix.logon().unwrap(); // 1 session
        let _ = fix.send(order("oid-2")).unwrap(); // 2 app
        let _ = fix.heartbeat(None).unwrap(); // 3 session
        let _ = fix.heartbeat(None).unwrap(); // 4 session
        let _ = fix.send(order("oid-5")).unwrap(); // 5 app

        let mut actions = Vec::new();
        fix.resend(1, 5, &mut actions);
        let replayed = transmitted(&actions);

        assert_eq!(replayed.len(), 4);

        // 1 collapses into SequenceReset(GapFill) with NewSeqNo=2.
        assert_eq!(replayed[0].msg_type, "4");
        assert_eq!(replayed[0].seq_num(), Some(1));
        assert!(replayed[0].get_bool(123));
        assert_eq!(replayed[0].get_uint(36), Some(2));

        // 2 replays with PossDupFlag and OrigSendingTime.
        assert_eq!(replayed[1].msg_type, "D");
        assert_eq!(replayed[1].seq_num(), Some(2));
        assert!(replayed[1].poss_dup());
        assert!(replayed[1].get(122).is_some());

        // 3..4 collapse, NewSeqNo=5.
        assert_eq!(replayed[2].msg_type, "4");
        assert_eq!(replayed[2].seq_num(), Some(3));
        assert_eq!(replayed[2].get_uint(36), Some(5));

        assert_eq!(replayed[3].msg_type, "D");
        assert_eq!(replayed[3].seq_num(), Some(5));

        // Replays do not advance the outbound counter.
        assert_eq!(fix.state().next_out, 6);
    }

    #[test]
    fn test_resend_full_mode_replays_everything() {
        let dir = TempDir::new().unwrap();
        let mut fix = stored_session(&dir, ResendMode::Full);

        let _ = fix.logon().unwrap();
        let _ = fix.send(order("oid-2")).unwrap();
        let _ = fix.heartbeat(None).unwrap();

        let mut actions = Vec::new();
        fix.resend(1, 0, &mut actions);
        let replayed = transmitted(&actions);

        assert_eq!(replayed.len(), 3);
        assert_eq!(replayed[0].msg_type, "A");
        assert!(replayed[0].poss_dup());
        assert_eq!(replayed[1].msg_type, "D");
        assert_eq!(replayed[2].msg_type, "0");
    }

    #[test]
    fn test_resend_gap_fills_missing_records() {
        let dir = TempDir::new().unwrap();
        let mut fix = stored_session(&dir, ResendMode::GapFill);

        // Simulate a truncated store: records 1 and 3 exist, 2 is missing.
        let mut store = MessageStore::new(dir.path().join("sparse.log"));
        let mut m1 = order("oid-1");
        let bytes = fix.serialize_at(&mut m1, 1);
        store.save(1, &bytes).unwrap();
        let mut m3 = order("oid-3");
        let bytes = fix.serialize_at(&mut m3, 3);
        store.save(3, &bytes).unwrap();
        fix.set_store(store);
        fix.state_mut().next_out = 4;

        let mut actions = Vec::new();
        fix.resend(1, 3, &mut actions);
        let replayed = transmitted(&actions);

        assert_eq!(replayed.len(), 3);
        assert_eq!(replayed[0].seq_num(), Some(1));
        assert_eq!(replayed[1].msg_type, "4");
        assert_eq!(replayed[1].seq_num(), Some(2));
        assert_eq!(replayed[1].get_uint(36), Some(3));
        assert_eq!(replayed[2].seq_num(), Some(3));
    }

    #[test]
    fn test_resend_request_via_on_message() {
        let dir = TempDir::new().unwrap();
        let mut fix = stored_session(&dir, ResendMode::GapFill);
        let _ = fix.send(order("oid-1")).unwrap();

        let mut peer = client();
        let request = peer.send(message::resend_request(1, 0)).unwrap();

        let actions = fix.on_message(parse(&request));
        let replayed = transmitted(&actions);
        assert_eq!(replayed.len(), 1);
        assert!(replayed[0].poss_dup());
    }

    #[test]
    fn test_resend_outside_range_is_ignored() {
        let dir = TempDir::new().unwrap();
        let mut fix = stored_session(&dir, ResendMode::GapFill);

        let mut actions = Vec::new();
        fix.resend(1, 5, &mut actions);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_disconnect_clears_transients() {
        let mut client = client();
        let mut server = server();
        server.state_mut().next_out = 3;

        let m3 = server.send(order("oid-3")).unwrap();
        client.on_message(parse(&m3));
        assert!(client.gap.is_some());

        client.on_disconnect();
        assert!(client.gap.is_none());
        assert!(client.pending.is_empty());
    }
}
