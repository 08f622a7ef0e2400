//! The session state machine: connection lifecycle, login handshake,
//! heartbeat watchdog, logout exchange and reconnect with fixed backoff.
//! Sessions are owned by the reactor and driven entirely from readiness and
//! timer dispatch; all cross-references are by id.

use crate::applink::{AppLink, InlineApp, Record};
use crate::buffer::Buffer;
use crate::config::{parse_net_url, SessionConfig};
use crate::error::{ConfigError, EngineError, NetError, SessionError, SessionErrorKind};
use crate::fix::{Action, FixProtocol};
use crate::reactor::{Ctx, Role, TimerEvent};
use crate::store::{open_store, SessionState};
use crate::timer::TimerId;
use crate::tls::TlsContext;
use crate::transport::{Conn, Listener, TransportState};
use fixwire::codec::{self, ParseOutcome};
use fixwire::dict::Dictionary;
use fixwire::logging::{self, Logger};
use fixwire::message::FixMessage;
use fixwire::time::timestamp_secs;
use mio::{PollOpt, Ready, Token};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const INBOUND_BUF_SIZE: usize = 256 * 1024;
const WRITE_BUF_SIZE: usize = 256 * 1024;

pub type SessionId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Login,
    TlsInit,
    InSession,
    Logout,
    InError,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Session-targeted timer events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Connect,
    Login,
    Reconnect,
    Watchdog,
    Logout,
}

/// The upstream application end.
pub enum AppEnd {
    Worker(AppLink),
    Inline(InlineApp),
}

pub type LoginValidator = Box<dyn Fn(&FixMessage) -> bool>;

pub struct Session {
    pub(crate) id: SessionId,
    name: String,
    side: Side,
    phase: Phase,
    config: SessionConfig,
    fix: FixProtocol,
    listener: Option<(Listener, Token)>,
    conn: Option<(Conn, Token)>,
    inbound: Buffer,
    outq: VecDeque<Vec<u8>>,
    wbuf: Buffer,
    app: Option<AppEnd>,
    app_token: Option<Token>,
    tls: Option<TlsContext>,
    validator: LoginValidator,
    last_addr: Option<SocketAddr>,
    last_send: std::time::Instant,
    last_receive: std::time::Instant,
    peer_heartbeat: u64,
    test_request_sent: bool,
    lifecycle_timer: Option<TimerId>,
    watchdog_timer: Option<TimerId>,
    log: Logger,
}

impl Session {
    pub fn client<'a, L: Into<Option<&'a Logger>>>(
        dict: Arc<Dictionary>,
        config: SessionConfig,
        name: &str,
        log: L,
    ) -> Session {
        Self::new(dict, config, name, Side::Client, log)
    }

    pub fn server<'a, L: Into<Option<&'a Logger>>>(
        dict: Arc<Dictionary>,
        config: SessionConfig,
        name: &str,
        log: L,
    ) -> Session {
        Self::new(dict, config, name, Side::Server, log)
    }

    fn new<'a, L: Into<Option<&'a Logger>>>(
        dict: Arc<Dictionary>,
        config: SessionConfig,
        name: &str,
        side: Side,
        log: L,
    ) -> Session {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("session" => name.to_string())),
            None => logging::discard(),
        };
        let fix = FixProtocol::new(dict, &config, &log);
        let now = std::time::Instant::now();

        Session {
            id: 0,
            name: name.to_string(),
            side,
            phase: Phase::Idle,
            config,
            fix,
            listener: None,
            conn: None,
            inbound: Buffer::new(INBOUND_BUF_SIZE),
            outq: VecDeque::new(),
            wbuf: Buffer::new(WRITE_BUF_SIZE),
            app: None,
            app_token: None,
            tls: None,
            validator: Box::new(|_| true),
            last_addr: None,
            last_send: now,
            last_receive: now,
            peer_heartbeat: 0,
            test_request_sent: false,
            lifecycle_timer: None,
            watchdog_timer: None,
            log,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.phase == Phase::Stopped
    }

    /// The listening address, once a server session has started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .as_ref()
            .and_then(|(listener, _)| listener.local_addr().ok())
    }

    #[inline]
    pub fn set_conf(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.config.set(key, value)
    }

    #[inline]
    pub fn get_conf(&self, key: &str) -> Option<String> {
        self.config.get(key)
    }

    /// Attaches the upstream application. The worker variant's socket is
    /// registered when the session starts.
    pub fn linkup(&mut self, app: AppEnd) {
        self.app = Some(app);
    }

    #[inline]
    pub fn ssl_context(&mut self, ctx: TlsContext) {
        self.tls = Some(ctx);
    }

    /// Replaces the login-accept capability. The default accepts everything.
    pub fn login_validator<F>(&mut self, validator: F)
    where
        F: Fn(&FixMessage) -> bool + 'static,
    {
        self.validator = Box::new(validator);
    }

    /// Persists the sequence counters.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        self.fix.state().save(path)
    }

    /// Restores counters from an earlier snapshot, if one exists.
    pub fn restore<P: AsRef<Path>>(&mut self, path: P) -> io::Result<()> {
        if let Some(state) = SessionState::restore(path)? {
            logging::info!(self.log, "state restored";
                           "context" => "restore",
                           "next_out" => state.next_out,
                           "next_in" => state.next_in);
            self.fix.set_state(state);
        }
        Ok(())
    }

    /// Brings the session up: validates configuration, opens stores,
    /// restores state, then connects (client) or starts listening (server).
    pub fn start(&mut self, url: &str, ctx: &mut Ctx) -> Result<(), EngineError> {
        self.config.validate()?;
        self.fix.reconfigure(&self.config);

        if let Some(path) = self.config.state_path.clone() {
            self.restore(&path)?;
        }
        if let Some(store_url) = self.config.message_store.clone() {
            let mut store = open_store(&store_url)?;
            store.set_sync(self.config.store_sync);
            self.fix.set_store(store);
        }

        let net = parse_net_url(url)?;
        if net.tls && self.tls.is_none() {
            match self.side {
                Side::Client => {
                    self.tls = Some(TlsContext::client(&net.host, None)?);
                }
                Side::Server => {
                    return Err(ConfigError::Missing("ssl_context").into());
                }
            }
        }
        let addr = net.resolve()?;
        self.last_addr = Some(addr);

        self.register_app(ctx)?;

        match self.side {
            Side::Client => {
                logging::debug!(self.log, "connecting"; "context" => "start", "address" => %addr);
                self.open_conn(addr, ctx)?;
            }
            Side::Server => {
                logging::debug!(self.log, "listening"; "context" => "start", "address" => %addr);
                let listener = Listener::bind(&addr)?;
                let token = ctx.handles.alloc(self.id, Role::Listener);
                ctx.poll
                    .register(listener.socket(), token, Ready::readable(), PollOpt::level())?;
                self.listener = Some((listener, token));
            }
        }

        self.update_interest(ctx);
        Ok(())
    }

    /// Hard stop: close everything, cancel timers, snapshot state.
    pub fn stop(&mut self, ctx: &mut Ctx) {
        logging::debug!(self.log, "stopping"; "context" => "stop", "phase" => ?self.phase);

        if let Some(path) = self.config.state_path.clone() {
            if let Err(err) = self.save(&path) {
                logging::warn!(self.log, "state save failed on stop";
                               "context" => "stop",
                               "error" => %err);
            }
        }

        if let Some((listener, token)) = self.listener.take() {
            let _ = ctx.poll.deregister(listener.socket());
            ctx.handles.free(token);
        }
        self.teardown_conn(ctx);

        if let Some(token) = self.app_token.take() {
            ctx.handles.free(token);
        }
        match self.app.as_mut() {
            Some(AppEnd::Worker(link)) => {
                let _ = ctx.poll.deregister(link.socket());
                link.shutdown();
            }
            Some(AppEnd::Inline(app)) => app.finish(),
            None => {}
        }

        self.phase = Phase::Stopped;
    }

    /// Initiates a clean shutdown: send Logout and wait (bounded by
    /// `login_wait_time`) for the peer's reply.
    pub fn logout(&mut self, ctx: &mut Ctx) -> Result<(), EngineError> {
        if self.phase != Phase::InSession {
            return Err(SessionError::new(SessionErrorKind::NotInSession).into());
        }

        let bytes = self.fix.logout(None)?;
        self.outq.push_back(bytes);
        self.phase = Phase::Logout;
        self.arm_lifecycle(ctx, TimerKind::Logout, self.config.login_wait_time);
        self.update_interest(ctx);
        Ok(())
    }

    /// Queues an application message for transmission (inline handlers and
    /// embedders use this; worker messages arrive over the channel).
    pub fn send_app(&mut self, msg: FixMessage, ctx: &mut Ctx) -> Result<(), EngineError> {
        let bytes = self.fix.send(msg)?;
        self.outq.push_back(bytes);
        self.update_interest(ctx);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Readiness dispatch
    // ------------------------------------------------------------------

    pub fn on_ready(
        &mut self,
        role: Role,
        readable: bool,
        writable: bool,
        ctx: &mut Ctx,
    ) -> Result<(), EngineError> {
        let result = match role {
            Role::Listener => {
                if readable {
                    self.on_accept(ctx)
                } else {
                    Ok(())
                }
            }
            Role::Conn => self.on_conn_ready(readable, writable, ctx),
            Role::AppLink => self.on_app_ready(readable, writable, ctx),
        };
        self.update_interest(ctx);
        result
    }

    /// Inline-handler timers are serviced once per reactor tick.
    pub fn on_tick(&mut self, ctx: &mut Ctx) -> Result<(), EngineError> {
        let replies = match self.app.as_mut() {
            Some(AppEnd::Inline(app)) => app.tick(ctx.now),
            _ => return Ok(()),
        };
        for msg in replies {
            self.send_app(msg, ctx)?;
        }
        Ok(())
    }

    pub fn on_timer(&mut self, kind: TimerKind, ctx: &mut Ctx) -> Result<(), EngineError> {
        let result = match kind {
            TimerKind::Connect => {
                logging::warn!(self.log, "connect timeout"; "context" => "on_timer");
                self.disconnect_and_recover(ctx);
                Ok(())
            }
            TimerKind::Login => {
                logging::warn!(self.log, "login time exceeded"; "context" => "on_timer");
                self.disconnect_and_recover(ctx);
                Ok(())
            }
            TimerKind::Reconnect => self.reconnect(ctx),
            TimerKind::Watchdog => self.check_heartbeat(ctx),
            TimerKind::Logout => {
                logging::warn!(self.log, "no logout reply from peer"; "context" => "on_timer");
                self.stop(ctx);
                Ok(())
            }
        };
        self.update_interest(ctx);
        result
    }

    fn on_accept(&mut self, ctx: &mut Ctx) -> Result<(), EngineError> {
        loop {
            let accepted = match &self.listener {
                Some((listener, _)) => listener.accept()?,
                None => return Ok(()),
            };
            let (stream, peer) = match accepted {
                Some(pair) => pair,
                None => return Ok(()),
            };

            if self.conn.is_some() {
                logging::info!(self.log, "already connected, dropping new connection";
                               "context" => "on_accept",
                               "peer" => %peer);
                continue;
            }

            logging::info!(self.log, "accepted"; "context" => "on_accept", "peer" => %peer);
            let mut conn = Conn::accepted(stream, peer)?;
            let token = ctx.handles.alloc(self.id, Role::Conn);
            ctx.poll
                .register(conn.socket(), token, Ready::readable(), PollOpt::level())?;

            self.fix.state_mut().last_peer = Some(peer.to_string());
            self.last_send = ctx.now;
            self.last_receive = ctx.now;

            if let Some(tls) = &self.tls {
                conn.start_tls(tls)?;
                self.phase = Phase::TlsInit;
            } else {
                self.phase = Phase::Login;
                self.arm_lifecycle(ctx, TimerKind::Login, self.config.login_wait_time);
            }
            self.conn = Some((conn, token));
        }
    }

    fn on_conn_ready(
        &mut self,
        readable: bool,
        writable: bool,
        ctx: &mut Ctx,
    ) -> Result<(), EngineError> {
        // Resolve a pending connect first.
        let connecting = self
            .conn
            .as_ref()
            .map(|(conn, _)| conn.state == TransportState::Connecting)
            .unwrap_or(false);
        if connecting {
            if !writable {
                return Ok(());
            }
            let finished = match self.conn.as_mut() {
                Some((conn, _)) => conn.finish_connect(),
                None => return Ok(()),
            };
            match finished {
                Ok(true) => self.on_connected(ctx)?,
                Ok(false) => return Ok(()),
                Err(NetError::Closed) | Err(NetError::Wait) => {
                    logging::info!(self.log, "connect failed"; "context" => "on_conn_ready");
                    self.disconnect_and_recover(ctx);
                    return Ok(());
                }
                Err(err) => {
                    self.fail(ctx);
                    return Err(err.into());
                }
            }
        }

        if self.phase == Phase::TlsInit {
            self.drive_tls(ctx)?;
            if self.phase == Phase::TlsInit {
                return Ok(());
            }
        }

        if readable {
            self.on_readable(ctx)?;
        }
        if writable {
            self.on_writable(ctx)?;
        }
        Ok(())
    }

    fn on_connected(&mut self, ctx: &mut Ctx) -> Result<(), EngineError> {
        self.cancel_lifecycle(ctx);
        let peer = self.conn.as_ref().and_then(|(conn, _)| conn.peer());
        logging::info!(self.log, "connected";
                       "context" => "on_connected",
                       "peer" => peer.map(|p| p.to_string()));

        if let Some(peer) = peer {
            self.fix.state_mut().last_peer = Some(peer.to_string());
        }
        self.last_send = ctx.now;
        self.last_receive = ctx.now;

        if let Some(tls) = self.tls.clone() {
            if let Some((conn, _)) = self.conn.as_mut() {
                conn.start_tls(&tls)?;
            }
            self.phase = Phase::TlsInit;
            self.drive_tls(ctx)?;
            return Ok(());
        }

        self.enter_login(ctx)
    }

    /// Client sends Logon and waits; server just waits for the peer's Logon.
    fn enter_login(&mut self, ctx: &mut Ctx) -> Result<(), EngineError> {
        self.phase = Phase::Login;
        if self.side == Side::Client {
            let bytes = self.fix.logon()?;
            self.outq.push_back(bytes);
        }
        self.arm_lifecycle(ctx, TimerKind::Login, self.config.login_wait_time);
        Ok(())
    }

    fn drive_tls(&mut self, ctx: &mut Ctx) -> Result<(), EngineError> {
        let done = match self.conn.as_mut() {
            Some((conn, _)) => match conn.drive_handshake() {
                Ok(done) => done,
                Err(NetError::Wait) => false,
                Err(NetError::Closed) => {
                    logging::info!(self.log, "peer lost during TLS handshake";
                                   "context" => "drive_tls");
                    self.disconnect_and_recover(ctx);
                    return Ok(());
                }
                Err(err) => {
                    logging::error!(self.log, "TLS handshake failed";
                                    "context" => "drive_tls",
                                    "error" => ?err);
                    self.disconnect_and_recover(ctx);
                    return Ok(());
                }
            },
            None => return Ok(()),
        };
        if !done {
            return Ok(());
        }

        let accepted = match (&self.conn, &self.tls) {
            (Some((conn, _)), Some(tls)) => conn.verify_peer(tls),
            _ => true,
        };
        if !accepted {
            logging::warn!(self.log, "TLS peer verification failed"; "context" => "drive_tls");
            self.disconnect_and_recover(ctx);
            return Ok(());
        }

        logging::debug!(self.log, "TLS handshake complete"; "context" => "drive_tls");
        self.enter_login(ctx)
    }

    fn on_readable(&mut self, ctx: &mut Ctx) -> Result<(), EngineError> {
        let result = match self.conn.as_mut() {
            Some((conn, _)) => conn.read_into(&mut self.inbound),
            None => return Ok(()),
        };

        match result {
            Ok(count) => {
                if count > 0 {
                    self.last_receive = ctx.now;
                }
                self.parse_frames(ctx)
            }
            Err(NetError::Wait) => Ok(()),
            Err(NetError::Closed) => {
                logging::info!(self.log, "peer disconnected"; "context" => "on_readable");
                self.disconnect_and_recover(ctx);
                Ok(())
            }
            Err(err) => {
                self.fail(ctx);
                Err(err.into())
            }
        }
    }

    fn on_writable(&mut self, ctx: &mut Ctx) -> Result<(), EngineError> {
        // At most one queued frame moves to the wire per dispatch.
        if self.wbuf.is_empty() {
            if let Some(frame) = self.outq.pop_front() {
                self.wbuf
                    .push(&frame)
                    .map_err(|err| EngineError::from(err))?;
            }
        }

        let result = match self.conn.as_mut() {
            Some((conn, _)) => conn.write_from(&mut self.wbuf),
            None => return Ok(()),
        };

        match result {
            Ok(count) => {
                if count > 0 {
                    self.last_send = ctx.now;
                }
                Ok(())
            }
            Err(NetError::Wait) => Ok(()),
            Err(NetError::Closed) => {
                logging::info!(self.log, "peer disconnected"; "context" => "on_writable");
                self.disconnect_and_recover(ctx);
                Ok(())
            }
            Err(err) => {
                self.fail(ctx);
                Err(err.into())
            }
        }
    }

    fn parse_frames(&mut self, ctx: &mut Ctx) -> Result<(), EngineError> {
        let dict = self.fix.dict().clone();
        loop {
            if self.conn.is_none() && self.inbound.is_empty() {
                return Ok(());
            }
            match codec::extract(self.inbound.data(), &dict) {
                ParseOutcome::Incomplete => return Ok(()),
                ParseOutcome::Message { msg, consumed } => {
                    self.inbound.consume(consumed);
                    self.on_frame(*msg, ctx)?;
                }
                ParseOutcome::Garbled {
                    reason,
                    seq_num,
                    consumed,
                } => {
                    logging::warn!(self.log, "garbled frame";
                                   "context" => "parse_frames",
                                   "reason" => ?reason,
                                   "ref_seq_num" => seq_num,
                                   "consumed" => consumed);
                    self.inbound.consume(consumed);
                    let reject = self.fix.reject_garbled(reason, seq_num)?;
                    self.outq.push_back(reject);
                }
            }
        }
    }

    fn on_frame(&mut self, msg: FixMessage, ctx: &mut Ctx) -> Result<(), EngineError> {
        self.test_request_sent = false;

        match self.phase {
            Phase::Login => self.on_login_frame(msg, ctx),
            Phase::InSession | Phase::Logout => {
                let actions = self.fix.on_message(msg);
                self.apply_actions(actions, ctx)
            }
            phase => {
                logging::debug!(self.log, "dropping frame outside session";
                                "context" => "on_frame",
                                "phase" => ?phase);
                Ok(())
            }
        }
    }

    fn on_login_frame(&mut self, msg: FixMessage, ctx: &mut Ctx) -> Result<(), EngineError> {
        if let Err(err) = self.fix.validate_logon(&msg) {
            logging::error!(self.log, "login rejected";
                            "context" => "on_login_frame",
                            "error" => %err);
            self.disconnect_and_recover(ctx);
            return Err(err.into());
        }
        if !(self.validator)(&msg) {
            let err = SessionError::new(SessionErrorKind::LoginFailed);
            logging::error!(self.log, "login validator refused peer";
                            "context" => "on_login_frame");
            self.disconnect_and_recover(ctx);
            return Err(err.into());
        }

        let actions = self.fix.on_message(msg);
        self.apply_actions(actions, ctx)
    }

    fn apply_actions(&mut self, actions: Vec<Action>, ctx: &mut Ctx) -> Result<(), EngineError> {
        for action in actions {
            match action {
                Action::Transmit(bytes) => self.outq.push_back(bytes),
                Action::Deliver(msg) => self.deliver_upstream(msg, ctx)?,
                Action::LogonAccepted { heartbeat, reset } => {
                    self.on_logon_accepted(heartbeat, reset, ctx)?;
                }
                Action::LogoutReplied => {
                    logging::info!(self.log, "peer initiated logout"; "context" => "apply_actions");
                    self.flush_now(ctx);
                    self.stop(ctx);
                    return Ok(());
                }
                Action::LogoutConfirmed => {
                    logging::info!(self.log, "logout confirmed"; "context" => "apply_actions");
                    self.flush_now(ctx);
                    self.stop(ctx);
                    return Ok(());
                }
                Action::Fatal(err) => {
                    logging::error!(self.log, "session-rule violation";
                                    "context" => "apply_actions",
                                    "error" => %err);
                    self.flush_now(ctx);
                    self.disconnect_and_recover(ctx);
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    fn on_logon_accepted(
        &mut self,
        heartbeat: u64,
        reset: bool,
        ctx: &mut Ctx,
    ) -> Result<(), EngineError> {
        if self.phase != Phase::Login {
            logging::warn!(self.log, "unexpected Logon"; "context" => "on_logon_accepted",
                           "phase" => ?self.phase);
            return Ok(());
        }

        self.cancel_lifecycle(ctx);
        if self.side == Side::Server {
            let bytes = self.fix.logon_reply(reset)?;
            self.outq.push_back(bytes);
        }

        self.peer_heartbeat = if heartbeat > 0 {
            heartbeat
        } else {
            self.config.heartbeat_interval
        };
        self.phase = Phase::InSession;
        self.test_request_sent = false;
        self.arm_watchdog(ctx);

        logging::info!(self.log, "in session";
                       "context" => "on_logon_accepted",
                       "heartbeat" => self.peer_heartbeat,
                       "next_out" => self.fix.state().next_out,
                       "next_in" => self.fix.state().next_in);
        Ok(())
    }

    fn deliver_upstream(&mut self, msg: FixMessage, ctx: &mut Ctx) -> Result<(), EngineError> {
        match self.app.as_mut() {
            Some(AppEnd::Worker(link)) => {
                link.push(&Record::App(msg))?;
                let _ = link.on_writable();
                Ok(())
            }
            Some(AppEnd::Inline(app)) => {
                let replies = match app.handle(msg) {
                    Ok(replies) => replies,
                    Err(err) => {
                        logging::warn!(self.log, "handler raised";
                                       "context" => "deliver_upstream",
                                       "code" => err.code,
                                       "text" => &err.text);
                        return Ok(());
                    }
                };
                for reply in replies {
                    self.send_app(reply, ctx)?;
                }
                Ok(())
            }
            None => {
                logging::warn!(self.log, "no upstream application linked";
                               "context" => "deliver_upstream");
                Ok(())
            }
        }
    }

    fn on_app_ready(
        &mut self,
        readable: bool,
        writable: bool,
        ctx: &mut Ctx,
    ) -> Result<(), EngineError> {
        if writable {
            if let Some(AppEnd::Worker(link)) = self.app.as_mut() {
                let _ = link.on_writable();
            }
        }
        if !readable {
            return Ok(());
        }

        let records = match self.app.as_mut() {
            Some(AppEnd::Worker(link)) => match link.on_readable() {
                Ok(records) => records,
                Err(NetError::Wait) => return Ok(()),
                Err(NetError::Closed) => {
                    logging::warn!(self.log, "application channel closed";
                                   "context" => "on_app_ready");
                    if let Some(token) = self.app_token.take() {
                        ctx.handles.free(token);
                    }
                    if let Some(AppEnd::Worker(link)) = self.app.take() {
                        let _ = ctx.poll.deregister(link.socket());
                    }
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            },
            _ => return Ok(()),
        };

        for record in records {
            match record {
                Record::App(msg) => {
                    if self.phase == Phase::Stopped {
                        continue;
                    }
                    self.send_app(msg, ctx)?;
                }
                Record::Error { code, text } => {
                    // Handler-side exceptions are logged; the session keeps
                    // running and the message stays counted.
                    logging::warn!(self.log, "handler error";
                                   "context" => "on_app_ready",
                                   "code" => code,
                                   "text" => &text);
                }
                Record::Shutdown => {
                    logging::info!(self.log, "application shut down";
                                   "context" => "on_app_ready");
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Heartbeat watchdog
    // ------------------------------------------------------------------

    fn check_heartbeat(&mut self, ctx: &mut Ctx) -> Result<(), EngineError> {
        if self.phase != Phase::InSession {
            return Ok(());
        }

        let hb = Duration::from_secs(self.peer_heartbeat.max(1));
        let now = ctx.now;

        // Outbound silence: keep the peer fed.
        if now.duration_since(self.last_send) >= hb {
            let bytes = self.fix.heartbeat(None)?;
            self.outq.push_back(bytes);
            self.last_send = now;
        }

        // Inbound silence: probe at 1.5x, give up at 3x.
        let silence = now.duration_since(self.last_receive);
        if silence >= hb * 3 {
            logging::error!(self.log, "heartbeat timeout";
                            "context" => "check_heartbeat",
                            "silent_secs" => silence.as_secs());
            self.disconnect_and_recover(ctx);
            return Ok(());
        }
        if silence >= hb * 3 / 2 && !self.test_request_sent {
            let id = format!("ping-{}", timestamp_secs());
            let bytes = self.fix.test_request(&id)?;
            self.outq.push_back(bytes);
            self.test_request_sent = true;
        }

        self.arm_watchdog(ctx);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Disconnect / reconnect
    // ------------------------------------------------------------------

    /// Recoverable loss of the peer: close, return to Idle and either arm
    /// the reconnect timer (client) or fall back to listening (server).
    fn disconnect_and_recover(&mut self, ctx: &mut Ctx) {
        self.teardown_conn(ctx);
        self.fix.on_disconnect();

        if self.phase == Phase::Stopped {
            return;
        }
        self.phase = Phase::Idle;

        match self.side {
            Side::Client => {
                logging::info!(self.log, "reconnect armed";
                               "context" => "disconnect",
                               "interval" => self.config.reconnect_interval);
                self.arm_lifecycle(ctx, TimerKind::Reconnect, self.config.reconnect_interval);
            }
            Side::Server => {
                logging::info!(self.log, "waiting for new connection"; "context" => "disconnect");
            }
        }
    }

    /// Unrecoverable transport failure.
    fn fail(&mut self, ctx: &mut Ctx) {
        self.teardown_conn(ctx);
        self.fix.on_disconnect();
        self.phase = Phase::InError;
    }

    fn teardown_conn(&mut self, ctx: &mut Ctx) {
        self.cancel_lifecycle(ctx);
        if let Some(id) = self.watchdog_timer.take() {
            ctx.timers.cancel(id);
        }
        self.test_request_sent = false;

        if let Some((mut conn, token)) = self.conn.take() {
            let _ = ctx.poll.deregister(conn.socket());
            ctx.handles.free(token);
            conn.close();
        }
        self.inbound.clear();
        self.wbuf.clear();
        self.outq.clear();
    }

    fn reconnect(&mut self, ctx: &mut Ctx) -> Result<(), EngineError> {
        let addr = match self.last_addr {
            Some(addr) => addr,
            None => return Err(SessionError::new(SessionErrorKind::NotConnected).into()),
        };
        logging::info!(self.log, "reconnecting"; "context" => "reconnect", "address" => %addr);
        self.open_conn(addr, ctx)
    }

    fn open_conn(&mut self, addr: SocketAddr, ctx: &mut Ctx) -> Result<(), EngineError> {
        let conn = match Conn::connect(&addr) {
            Ok(conn) => conn,
            Err(NetError::Closed) => {
                // Immediate refusal; retry on the backoff cadence.
                self.disconnect_and_recover(ctx);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let token = ctx.handles.alloc(self.id, Role::Conn);
        ctx.poll.register(
            conn.socket(),
            token,
            Ready::readable() | Ready::writable(),
            PollOpt::level(),
        )?;
        self.conn = Some((conn, token));
        self.arm_lifecycle(ctx, TimerKind::Connect, self.config.connect_timeout);
        Ok(())
    }

    fn register_app(&mut self, ctx: &mut Ctx) -> Result<(), EngineError> {
        if self.app_token.is_some() {
            return Ok(());
        }
        if let Some(AppEnd::Worker(link)) = self.app.as_ref() {
            let token = ctx.handles.alloc(self.id, Role::AppLink);
            ctx.poll
                .register(link.socket(), token, Ready::readable(), PollOpt::level())?;
            self.app_token = Some(token);
        }
        Ok(())
    }

    /// Best-effort drain of queued frames, used right before teardown.
    fn flush_now(&mut self, ctx: &mut Ctx) {
        for _ in 0..64 {
            if self.wbuf.is_empty() {
                match self.outq.pop_front() {
                    Some(frame) => {
                        if self.wbuf.push(&frame).is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
            let result = match self.conn.as_mut() {
                Some((conn, _)) => conn.write_from(&mut self.wbuf),
                None => return,
            };
            match result {
                Ok(count) if count > 0 => self.last_send = ctx.now,
                _ => return,
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers / poll interest
    // ------------------------------------------------------------------

    fn arm_lifecycle(&mut self, ctx: &mut Ctx, kind: TimerKind, secs: u64) {
        self.cancel_lifecycle(ctx);
        let id = ctx.timers.add(
            ctx.now,
            Duration::from_secs(secs),
            TimerEvent::Session { id: self.id, kind },
        );
        self.lifecycle_timer = Some(id);
    }

    fn cancel_lifecycle(&mut self, ctx: &mut Ctx) {
        if let Some(id) = self.lifecycle_timer.take() {
            ctx.timers.cancel(id);
        }
    }

    fn arm_watchdog(&mut self, ctx: &mut Ctx) {
        if let Some(id) = self.watchdog_timer.take() {
            ctx.timers.cancel(id);
        }
        let id = ctx.timers.add(
            ctx.now,
            Duration::from_secs(self.config.watchdog_secs()),
            TimerEvent::Session {
                id: self.id,
                kind: TimerKind::Watchdog,
            },
        );
        self.watchdog_timer = Some(id);
    }

    fn update_interest(&self, ctx: &Ctx) {
        if let Some((conn, token)) = &self.conn {
            let mut ready = Ready::readable();
            let writing = conn.state == TransportState::Connecting
                || self.phase == Phase::TlsInit
                || !self.wbuf.is_empty()
                || !self.outq.is_empty()
                || conn.wants_write();
            if writing {
                ready |= Ready::writable();
            }
            let _ = ctx
                .poll
                .reregister(conn.socket(), *token, ready, PollOpt::level());
        }

        if let (Some(AppEnd::Worker(link)), Some(token)) = (&self.app, self.app_token) {
            let mut ready = Ready::readable();
            if link.has_egress() {
                ready |= Ready::writable();
            }
            let _ = ctx
                .poll
                .reregister(link.socket(), token, ready, PollOpt::level());
        }
    }
}
