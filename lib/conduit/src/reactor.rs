//! The readiness loop. The reactor owns the poll, the timer wheel, the
//! token arena and every session; sessions and transports are reached by id
//! only, and all dispatch happens on this one thread.

use crate::error::EngineError;
use crate::session::{Session, SessionId, TimerKind};
use crate::signal;
use crate::timer::TimerWheel;
use fixwire::logging::{self, Logger};
use fixwire::message::FixMessage;
use mio::{Events, Poll, Ready, Token};
use std::path::PathBuf;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(500);
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5);
const EVENT_CAPACITY: usize = 1024;

/// What a pollable token belongs to within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listener,
    Conn,
    AppLink,
}

/// Timer wheel entries: session-targeted lifecycle events plus the
/// reactor's own snapshot cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Session { id: SessionId, kind: TimerKind },
    Snapshot,
}

/// Maps `mio::Token`s to their owning session and role. Slots are recycled
/// through a free list, like the channel registry the tokens index into.
pub struct HandleArena {
    slots: Vec<Option<(SessionId, Role)>>,
    free: Vec<usize>,
}

impl HandleArena {
    pub fn new() -> HandleArena {
        HandleArena {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn alloc(&mut self, session: SessionId, role: Role) -> Token {
        match self.free.pop() {
            Some(at) => {
                self.slots[at] = Some((session, role));
                Token(at)
            }
            None => {
                self.slots.push(Some((session, role)));
                Token(self.slots.len() - 1)
            }
        }
    }

    pub fn free(&mut self, token: Token) {
        if let Some(slot) = self.slots.get_mut(token.0) {
            if slot.take().is_some() {
                self.free.push(token.0);
            }
        }
    }

    pub fn resolve(&self, token: Token) -> Option<(SessionId, Role)> {
        self.slots.get(token.0).copied().flatten()
    }
}

/// Mutable reactor state handed into session dispatch. Sessions register
/// sockets, arm timers and allocate tokens through this; they never hold a
/// reference back to the reactor itself.
pub struct Ctx<'a> {
    pub poll: &'a Poll,
    pub timers: &'a mut TimerWheel<TimerEvent>,
    pub handles: &'a mut HandleArena,
    pub now: Instant,
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    timers: TimerWheel<TimerEvent>,
    handles: HandleArena,
    sessions: Vec<Session>,
    savelist: Vec<(SessionId, PathBuf)>,
    log: Logger,
}

impl Reactor {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> std::io::Result<Reactor> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        Ok(Reactor {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            timers: TimerWheel::new(),
            handles: HandleArena::new(),
            sessions: Vec::new(),
            savelist: Vec::new(),
            log,
        })
    }

    /// Registers a session and returns its id.
    pub fn add_session(&mut self, mut session: Session) -> SessionId {
        let id = self.sessions.len();
        session.id = id;
        self.sessions.push(session);
        id
    }

    #[inline]
    pub fn session(&self, id: SessionId) -> &Session {
        &self.sessions[id]
    }

    #[inline]
    pub fn session_mut(&mut self, id: SessionId) -> &mut Session {
        &mut self.sessions[id]
    }

    /// Brings a session up toward `url` (`//host:port` or `tls://host:port`).
    pub fn start(&mut self, id: SessionId, url: &str) -> Result<(), EngineError> {
        let mut ctx = Ctx {
            poll: &self.poll,
            timers: &mut self.timers,
            handles: &mut self.handles,
            now: Instant::now(),
        };
        self.sessions[id].start(url, &mut ctx)
    }

    /// Queues an application message on a session.
    pub fn send(&mut self, id: SessionId, msg: FixMessage) -> Result<(), EngineError> {
        let mut ctx = Ctx {
            poll: &self.poll,
            timers: &mut self.timers,
            handles: &mut self.handles,
            now: Instant::now(),
        };
        self.sessions[id].send_app(msg, &mut ctx)
    }

    /// Initiates a clean logout exchange on a session.
    pub fn logout(&mut self, id: SessionId) -> Result<(), EngineError> {
        let mut ctx = Ctx {
            poll: &self.poll,
            timers: &mut self.timers,
            handles: &mut self.handles,
            now: Instant::now(),
        };
        self.sessions[id].logout(&mut ctx)
    }

    /// Hard-stops one session.
    pub fn stop(&mut self, id: SessionId) {
        let mut ctx = Ctx {
            poll: &self.poll,
            timers: &mut self.timers,
            handles: &mut self.handles,
            now: Instant::now(),
        };
        self.sessions[id].stop(&mut ctx);
    }

    /// Cooperative stop of every session.
    pub fn stop_all(&mut self) {
        for id in 0..self.sessions.len() {
            let mut ctx = Ctx {
                poll: &self.poll,
                timers: &mut self.timers,
                handles: &mut self.handles,
                now: Instant::now(),
            };
            self.sessions[id].stop(&mut ctx);
        }
    }

    /// True when there is nothing to run (no sessions, or all stopped).
    pub fn stopped(&self) -> bool {
        self.sessions.iter().all(|session| session.is_stopped())
    }

    /// One poll/dispatch/timer pass with a log-and-continue error policy.
    /// `run` is this in a loop with the user's policy.
    pub fn poll_once(&mut self) -> Result<(), EngineError> {
        let log = self.log.clone();
        self.iterate(&mut |err| {
            logging::warn!(log, "dispatch error"; "error" => %err);
            true
        })
    }

    /// Runs until every session reaches STOPPED. Sessions in the savelist
    /// snapshot their state every five seconds and on shutdown; dispatch
    /// errors are offered to `exc_policy`, which returns the continue flag.
    pub fn run(
        &mut self,
        savelist: &[(SessionId, PathBuf)],
        exc_policy: &mut dyn FnMut(&EngineError) -> bool,
    ) -> Result<(), EngineError> {
        signal::install();
        self.savelist = savelist.to_vec();
        if !self.savelist.is_empty() {
            self.timers
                .add(Instant::now(), SNAPSHOT_INTERVAL, TimerEvent::Snapshot);
        }

        while !self.stopped() {
            self.iterate(exc_policy)?;
            if signal::triggered() {
                logging::info!(self.log, "termination signal received"; "context" => "run");
                self.stop_all();
            }
        }

        self.save_states();
        logging::debug!(self.log, "all sessions stopped"; "context" => "run");
        Ok(())
    }

    fn iterate(
        &mut self,
        exc_policy: &mut dyn FnMut(&EngineError) -> bool,
    ) -> Result<(), EngineError> {
        let now = Instant::now();
        let mut timeout = TICK;
        if let Some(deadline) = self.timers.next_deadline() {
            timeout = timeout.min(deadline.saturating_duration_since(now));
        }
        self.poll.poll(&mut self.events, Some(timeout))?;

        let ready: Vec<(Token, Ready)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.readiness()))
            .collect();

        for (token, readiness) in ready {
            let (id, role) = match self.handles.resolve(token) {
                Some(target) => target,
                None => continue,
            };
            let result = {
                let mut ctx = Ctx {
                    poll: &self.poll,
                    timers: &mut self.timers,
                    handles: &mut self.handles,
                    now: Instant::now(),
                };
                self.sessions[id].on_ready(
                    role,
                    readiness.is_readable(),
                    readiness.is_writable(),
                    &mut ctx,
                )
            };
            if let Err(err) = result {
                if !exc_policy(&err) {
                    self.stop_all();
                    return Err(err);
                }
            }
        }

        // Due timers fire after I/O dispatch; events armed during a
        // callback with an already-passed deadline fire in this same pass.
        loop {
            let now = Instant::now();
            match self.timers.pop_due(now) {
                None => break,
                Some(TimerEvent::Snapshot) => {
                    self.save_states();
                    self.timers.add(now, SNAPSHOT_INTERVAL, TimerEvent::Snapshot);
                }
                Some(TimerEvent::Session { id, kind }) => {
                    let result = {
                        let mut ctx = Ctx {
                            poll: &self.poll,
                            timers: &mut self.timers,
                            handles: &mut self.handles,
                            now,
                        };
                        self.sessions[id].on_timer(kind, &mut ctx)
                    };
                    if let Err(err) = result {
                        if !exc_policy(&err) {
                            self.stop_all();
                            return Err(err);
                        }
                    }
                }
            }
        }

        // Service inline-handler timers.
        for id in 0..self.sessions.len() {
            let result = {
                let mut ctx = Ctx {
                    poll: &self.poll,
                    timers: &mut self.timers,
                    handles: &mut self.handles,
                    now: Instant::now(),
                };
                self.sessions[id].on_tick(&mut ctx)
            };
            if let Err(err) = result {
                if !exc_policy(&err) {
                    self.stop_all();
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Snapshot failures are logged and do not abort the loop.
    fn save_states(&mut self) {
        for (id, path) in &self.savelist {
            if let Err(err) = self.sessions[*id].save(path) {
                logging::warn!(self.log, "state snapshot failed";
                               "context" => "save_states",
                               "session" => self.sessions[*id].name(),
                               "error" => %err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applink::{AppContext, AppError, Handler, InlineApp};
    use crate::config::SessionConfig;
    use crate::session::{AppEnd, Phase};
    use fixwire::dict::Dictionary;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_arena_alloc_free_resolve() {
        let mut arena = HandleArena::new();

        let a = arena.alloc(0, Role::Listener);
        let b = arena.alloc(0, Role::Conn);
        let c = arena.alloc(1, Role::AppLink);

        assert_eq!(arena.resolve(a), Some((0, Role::Listener)));
        assert_eq!(arena.resolve(c), Some((1, Role::AppLink)));

        arena.free(b);
        assert_eq!(arena.resolve(b), None);

        // Freed slots are recycled.
        let d = arena.alloc(2, Role::Conn);
        assert_eq!(d, b);
        assert_eq!(arena.resolve(d), Some((2, Role::Conn)));

        // Double free does not corrupt the free list.
        arena.free(b);
        arena.free(b);
        let e = arena.alloc(3, Role::Conn);
        let f = arena.alloc(3, Role::Listener);
        assert_ne!(e, f);
    }

    fn config(sender: &str, target: &str) -> SessionConfig {
        let mut config = SessionConfig::default();
        config.sender_comp_id = sender.to_string();
        config.target_comp_id = target.to_string();
        config.heartbeat_interval = 30;
        config
    }

    #[test]
    fn test_empty_reactor_is_stopped() {
        let reactor = Reactor::new(None).unwrap();
        assert!(reactor.stopped());
    }

    struct Collect {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl Handler for Collect {
        fn handle(
            &mut self,
            msg: FixMessage,
            _ctx: &mut AppContext,
        ) -> Result<Option<FixMessage>, AppError> {
            let id = msg.get_str(11).unwrap_or("?").to_string();
            self.seen.lock().unwrap().push(id);
            Ok(None)
        }
    }

    #[test]
    fn test_client_server_session_over_loopback() {
        let dict = Dictionary::builtin("4.4").unwrap();
        let mut reactor = Reactor::new(None).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut server = Session::server(dict.clone(), config("BSIDE", "ASIDE"), "srv", None);
        server.linkup(AppEnd::Inline(InlineApp::new(Box::new(Collect {
            seen: seen.clone(),
        }))));
        let sid = reactor.add_session(server);

        reactor.start(sid, "//127.0.0.1:0").unwrap();
        let port = reactor
            .session(sid)
            .local_addr()
            .expect("server must be listening")
            .port();

        let client = Session::client(dict.clone(), config("ASIDE", "BSIDE"), "cli", None);
        let cid = reactor.add_session(client);
        reactor.start(cid, &format!("//127.0.0.1:{}", port)).unwrap();

        // Drive both sessions through connect + login.
        for _ in 0..200 {
            reactor.poll_once().unwrap();
            if reactor.session(sid).phase() == Phase::InSession
                && reactor.session(cid).phase() == Phase::InSession
            {
                break;
            }
        }
        assert_eq!(reactor.session(cid).phase(), Phase::InSession);
        assert_eq!(reactor.session(sid).phase(), Phase::InSession);

        // Client sends an order; the server's inline handler sees it.
        let mut order = FixMessage::new("D");
        order.set_body(11, "oid-77");
        order.set_body(55, "FOO");
        reactor.send(cid, order).unwrap();

        for _ in 0..200 {
            reactor.poll_once().unwrap();
            if !seen.lock().unwrap().is_empty() {
                break;
            }
        }
        assert_eq!(seen.lock().unwrap().as_slice(), &["oid-77".to_string()]);

        // Clean logout initiated by the client stops both ends.
        reactor.logout(cid).unwrap();
        for _ in 0..200 {
            reactor.poll_once().unwrap();
            if reactor.session(cid).phase() == Phase::Stopped {
                break;
            }
        }
        assert_eq!(reactor.session(cid).phase(), Phase::Stopped);

        reactor.stop_all();
        assert!(reactor.stopped());
    }

    #[test]
    fn test_client_recovers_after_peer_loss() {
        let dict = Dictionary::builtin("4.4").unwrap();
        let mut reactor = Reactor::new(None).unwrap();

        let server = Session::server(dict.clone(), config("BSIDE", "ASIDE"), "srv", None);
        let sid = reactor.add_session(server);
        reactor.start(sid, "//127.0.0.1:0").unwrap();
        let port = reactor.session(sid).local_addr().unwrap().port();

        let client = Session::client(dict.clone(), config("ASIDE", "BSIDE"), "cli", None);
        let cid = reactor.add_session(client);
        reactor.start(cid, &format!("//127.0.0.1:{}", port)).unwrap();

        for _ in 0..200 {
            reactor.poll_once().unwrap();
            if reactor.session(cid).phase() == Phase::InSession {
                break;
            }
        }
        assert_eq!(reactor.session(cid).phase(), Phase::InSession);

        // Kill the server; the client notices the loss, returns to Idle and
        // arms its reconnect backoff.
        reactor.stop(sid);
        for _ in 0..200 {
            reactor.poll_once().unwrap();
            if reactor.session(cid).phase() == Phase::Idle {
                break;
            }
        }
        assert_eq!(reactor.session(cid).phase(), Phase::Idle);

        reactor.stop_all();
        assert!(reactor.stopped());
    }
}
