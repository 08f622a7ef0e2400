//! The full-duplex channel between a session (inside the reactor) and its
//! application handler. Records are length-framed bincode. The handler can
//! run worker-isolated (its own thread, blocking socket end with a 500 ms
//! tick and a private timer wheel) or inline on the reactor thread; both
//! placements satisfy the same `Handler` capability.

use crate::buffer::Buffer;
use crate::error::{ErrorKind, NetError, NetResult};
use crate::timer::{TimerId, TimerWheel};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use fixwire::logging::{self, Logger};
use fixwire::message::FixMessage;
use serde_derive::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const CHANNEL_BUF_SIZE: usize = 256 * 1024;
const WORKER_TICK: Duration = Duration::from_millis(500);

/// One record crossing the channel, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    /// A validated inbound message (session → handler) or an outbound
    /// application message (handler → session).
    App(FixMessage),
    /// A handler-side failure, re-raised and logged in the session context.
    Error { code: u32, text: String },
    /// Orderly teardown, either direction.
    Shutdown,
}

/// Frames a record: u32 length prefix + bincode payload.
pub fn frame_record(record: &Record) -> Vec<u8> {
    let payload = bincode::serialize(record).expect("record serialization cannot fail");
    let mut framed = Vec::with_capacity(payload.len() + 4);
    framed
        .write_u32::<BigEndian>(payload.len() as u32)
        .expect("vec write cannot fail");
    framed.extend_from_slice(&payload);
    framed
}

/// Pops every complete record off the front of the buffer.
pub fn drain_records(buf: &mut Buffer) -> NetResult<Vec<Record>> {
    let mut records = Vec::new();
    loop {
        let data = buf.data();
        if data.len() < 4 {
            return Ok(records);
        }
        let len = BigEndian::read_u32(&data[..4]) as usize;
        if data.len() < 4 + len {
            return Ok(records);
        }
        let record = bincode::deserialize(&data[4..4 + len])
            .map_err(|_| NetError::Fatal(ErrorKind::Io(io::ErrorKind::InvalidData)))?;
        buf.consume(4 + len);
        records.push(record);
    }
}

/// What a handler gets to work with: queueing outbound messages and its own
/// deferred callbacks, identified by caller-chosen tokens.
pub struct AppContext {
    timers: TimerWheel<u64>,
    out: Vec<FixMessage>,
    now: Instant,
}

impl AppContext {
    fn new() -> AppContext {
        AppContext {
            timers: TimerWheel::new(),
            out: Vec::new(),
            now: Instant::now(),
        }
    }

    /// Queues an application message for transmission on the session.
    #[inline]
    pub fn send(&mut self, msg: FixMessage) {
        self.out.push(msg);
    }

    /// Schedules `Handler::timer(token)` to run after `delay`.
    #[inline]
    pub fn add_timer(&mut self, delay: Duration, token: u64) -> TimerId {
        let now = self.now;
        self.timers.add(now, delay, token)
    }

    #[inline]
    pub fn cancel_timer(&mut self, id: TimerId) {
        self.timers.cancel(id);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppError {
    pub code: u32,
    pub text: String,
}

/// The application capability. Operations not provided default to no-ops.
pub trait Handler: Send {
    fn setup(&mut self, _ctx: &mut AppContext) {}

    fn handle(
        &mut self,
        _msg: FixMessage,
        _ctx: &mut AppContext,
    ) -> Result<Option<FixMessage>, AppError> {
        Ok(None)
    }

    fn timer(&mut self, _token: u64, _ctx: &mut AppContext) {}

    fn finish(&mut self, _ctx: &mut AppContext) {}
}

/// Builds the loopback socket pair connecting a session to its worker: the
/// session end is nonblocking and registered with the reactor, the worker
/// end stays blocking with the tick as its read timeout.
fn socket_pair() -> io::Result<(mio::net::TcpStream, TcpStream)> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    let worker = TcpStream::connect(listener.local_addr()?)?;
    let (session, _) = listener.accept()?;

    session.set_nodelay(true)?;
    session.set_nonblocking(true)?;
    worker.set_nodelay(true)?;
    worker.set_read_timeout(Some(WORKER_TICK))?;

    Ok((mio::net::TcpStream::from_stream(session)?, worker))
}

/// The session-side end of the channel.
pub struct AppLink {
    sock: mio::net::TcpStream,
    inbound: Buffer,
    outbound: Buffer,
    worker: Option<JoinHandle<()>>,
}

impl AppLink {
    /// Spawns a worker-isolated handler and returns the session end.
    pub fn worker<'a, L: Into<Option<&'a Logger>>>(
        handler: Box<dyn Handler>,
        log: L,
    ) -> io::Result<AppLink> {
        let (session_end, worker_end) = socket_pair()?;
        let worker_log = match log.into() {
            Some(log) => log.new(logging::o!("side" => "worker")),
            None => logging::discard(),
        };

        let worker = thread::Builder::new()
            .name("applink-worker".to_string())
            .spawn(move || {
                let mut runner = Worker::new(worker_end, handler, worker_log);
                runner.run();
            })?;

        Ok(AppLink {
            sock: session_end,
            inbound: Buffer::new(CHANNEL_BUF_SIZE),
            outbound: Buffer::new(CHANNEL_BUF_SIZE),
            worker: Some(worker),
        })
    }

    #[inline]
    pub fn socket(&self) -> &mio::net::TcpStream {
        &self.sock
    }

    /// Queues a record toward the worker.
    pub fn push(&mut self, record: &Record) -> NetResult<()> {
        self.outbound.push(&frame_record(record))
    }

    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Flushes queued records.
    pub fn on_writable(&mut self) -> NetResult<usize> {
        self.outbound.egress(&mut self.sock)
    }

    /// Reads and decodes everything the worker has sent.
    pub fn on_readable(&mut self) -> NetResult<Vec<Record>> {
        self.inbound.ingress(&mut self.sock)?;
        drain_records(&mut self.inbound)
    }

    /// Signals shutdown and joins the worker.
    pub fn shutdown(&mut self) {
        let _ = self.push(&Record::Shutdown);
        let _ = self.on_writable();
        let _ = self.sock.shutdown(std::net::Shutdown::Both);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// The worker loop: a readiness poll with a 500 ms tick during which it
/// drains its own timers. The loop owns a fresh timer wheel; nothing is
/// inherited from the reactor.
struct Worker {
    sock: TcpStream,
    handler: Box<dyn Handler>,
    ctx: AppContext,
    acc: Vec<u8>,
    log: Logger,
}

impl Worker {
    fn new(sock: TcpStream, handler: Box<dyn Handler>, log: Logger) -> Worker {
        Worker {
            sock,
            handler,
            ctx: AppContext::new(),
            acc: Vec::new(),
            log,
        }
    }

    fn run(&mut self) {
        logging::debug!(self.log, "worker starting"; "context" => "run");
        self.ctx.timers.flush();
        self.ctx.now = Instant::now();
        self.handler.setup(&mut self.ctx);
        if self.flush_outbound().is_err() {
            return;
        }

        loop {
            match self.read_record() {
                Ok(Some(Record::App(msg))) => {
                    let result = self.handler.handle(msg, &mut self.ctx);
                    let reply = match result {
                        Ok(reply) => reply,
                        Err(err) => {
                            logging::warn!(self.log, "handler raised";
                                           "context" => "run",
                                           "code" => err.code,
                                           "text" => &err.text);
                            if self
                                .send_record(&Record::Error {
                                    code: err.code,
                                    text: err.text,
                                })
                                .is_err()
                            {
                                break;
                            }
                            None
                        }
                    };
                    if let Some(reply) = reply {
                        self.ctx.out.push(reply);
                    }
                }
                Ok(Some(Record::Error { code, text })) => {
                    logging::warn!(self.log, "error record from session";
                                   "context" => "run",
                                   "code" => code,
                                   "text" => &text);
                }
                Ok(Some(Record::Shutdown)) | Ok(None) => break,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(ref err) if err.kind() == io::ErrorKind::TimedOut => {}
                Err(err) => {
                    logging::debug!(self.log, "worker channel failed";
                                    "context" => "run",
                                    "error" => %err);
                    break;
                }
            }

            self.ctx.now = Instant::now();
            while let Some(token) = self.ctx.timers.pop_due(self.ctx.now) {
                self.handler.timer(token, &mut self.ctx);
            }

            if self.flush_outbound().is_err() {
                break;
            }
        }

        self.handler.finish(&mut self.ctx);
        let _ = self.flush_outbound();
        logging::debug!(self.log, "worker stopped"; "context" => "run");
    }

    /// Reads one record, blocking for at most the tick. `Ok(None)` means
    /// end-of-stream.
    fn read_record(&mut self) -> io::Result<Option<Record>> {
        // Finish a partially accumulated frame first.
        loop {
            if self.acc.len() >= 4 {
                let len = BigEndian::read_u32(&self.acc[..4]) as usize;
                if self.acc.len() >= 4 + len {
                    let record = bincode::deserialize(&self.acc[4..4 + len])
                        .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
                    self.acc.drain(..4 + len);
                    return Ok(Some(record));
                }
            }

            let mut chunk = [0u8; 4096];
            match self.sock.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(count) => self.acc.extend_from_slice(&chunk[..count]),
                Err(err) => return Err(err),
            }
        }
    }

    fn send_record(&mut self, record: &Record) -> io::Result<()> {
        self.sock.write_all(&frame_record(record))
    }

    fn flush_outbound(&mut self) -> io::Result<()> {
        let queued: Vec<FixMessage> = self.ctx.out.drain(..).collect();
        for msg in queued {
            self.send_record(&Record::App(msg))?;
        }
        Ok(())
    }
}

/// An in-process handler: same capability, no isolation. Timers are driven
/// by the session's tick on the reactor thread.
pub struct InlineApp {
    handler: Box<dyn Handler>,
    ctx: AppContext,
    started: bool,
}

impl InlineApp {
    pub fn new(handler: Box<dyn Handler>) -> InlineApp {
        InlineApp {
            handler,
            ctx: AppContext::new(),
            started: false,
        }
    }

    /// Feeds one validated message through the handler, returning queued
    /// outbound messages, or the handler's error.
    pub fn handle(&mut self, msg: FixMessage) -> Result<Vec<FixMessage>, AppError> {
        self.ensure_setup();
        let result = self.handler.handle(msg, &mut self.ctx);
        let mut out: Vec<FixMessage> = self.ctx.out.drain(..).collect();
        match result {
            Ok(Some(reply)) => {
                out.push(reply);
                Ok(out)
            }
            Ok(None) => Ok(out),
            Err(err) => Err(err),
        }
    }

    /// Runs due handler timers; called from the session's tick.
    pub fn tick(&mut self, now: Instant) -> Vec<FixMessage> {
        self.ensure_setup();
        self.ctx.now = now;
        while let Some(token) = self.ctx.timers.pop_due(now) {
            self.handler.timer(token, &mut self.ctx);
        }
        self.ctx.out.drain(..).collect()
    }

    pub fn finish(&mut self) {
        if self.started {
            self.handler.finish(&mut self.ctx);
        }
    }

    fn ensure_setup(&mut self) {
        if !self.started {
            self.started = true;
            self.ctx.now = Instant::now();
            self.handler.setup(&mut self.ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn sample(cl_ord_id: &str) -> FixMessage {
        let mut msg = FixMessage::new("D");
        msg.set_body(11, cl_ord_id);
        msg
    }

    #[test]
    fn test_record_framing_roundtrip() {
        let mut buf = Buffer::new(4096);

        buf.push(&frame_record(&Record::App(sample("oid-1")))).unwrap();
        buf.push(&frame_record(&Record::Error {
            code: 1001,
            text: "boom".to_string(),
        }))
        .unwrap();
        buf.push(&frame_record(&Record::Shutdown)).unwrap();

        let records = drain_records(&mut buf).unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(&records[0], Record::App(msg) if msg.get_str(11) == Some("oid-1")));
        assert!(matches!(&records[1], Record::Error { code: 1001, .. }));
        assert_eq!(records[2], Record::Shutdown);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_stays_buffered() {
        let mut buf = Buffer::new(4096);
        let framed = frame_record(&Record::Shutdown);

        buf.push(&framed[..framed.len() - 1]).unwrap();
        assert!(drain_records(&mut buf).unwrap().is_empty());

        buf.push(&framed[framed.len() - 1..]).unwrap();
        let records = drain_records(&mut buf).unwrap();
        assert_eq!(records, vec![Record::Shutdown]);
    }

    struct Echo {
        prefix: String,
        finished: mpsc::Sender<()>,
    }

    impl Handler for Echo {
        fn handle(
            &mut self,
            msg: FixMessage,
            _ctx: &mut AppContext,
        ) -> Result<Option<FixMessage>, AppError> {
            let id = msg.get_str(11).unwrap_or("");
            if id == "explode" {
                return Err(AppError {
                    code: 1001,
                    text: "handler exploded".to_string(),
                });
            }
            Ok(Some(sample(&format!("{}{}", self.prefix, id))))
        }

        fn finish(&mut self, _ctx: &mut AppContext) {
            let _ = self.finished.send(());
        }
    }

    fn wait_readable(link: &mut AppLink) -> Vec<Record> {
        // The session end is nonblocking; poll briefly until the worker's
        // reply lands.
        for _ in 0..600 {
            match link.on_readable() {
                Ok(records) if !records.is_empty() => return records,
                Ok(_) => std::thread::sleep(Duration::from_millis(5)),
                Err(NetError::Wait) => std::thread::sleep(Duration::from_millis(5)),
                Err(err) => panic!("channel failed: {:?}", err),
            }
        }
        panic!("no reply from worker");
    }

    #[test]
    fn test_worker_roundtrip_and_shutdown() {
        let (finished_tx, finished_rx) = mpsc::channel();
        let mut link = AppLink::worker(
            Box::new(Echo {
                prefix: "echo-".to_string(),
                finished: finished_tx,
            }),
            None,
        )
        .unwrap();

        link.push(&Record::App(sample("oid-9"))).unwrap();
        link.on_writable().unwrap();

        let records = wait_readable(&mut link);
        assert!(
            matches!(&records[0], Record::App(msg) if msg.get_str(11) == Some("echo-oid-9"))
        );

        link.shutdown();
        finished_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("worker finish hook did not run");
    }

    #[test]
    fn test_worker_error_record() {
        let (finished_tx, _finished_rx) = mpsc::channel();
        let mut link = AppLink::worker(
            Box::new(Echo {
                prefix: String::new(),
                finished: finished_tx,
            }),
            None,
        )
        .unwrap();

        link.push(&Record::App(sample("explode"))).unwrap();
        link.on_writable().unwrap();

        let records = wait_readable(&mut link);
        match &records[0] {
            Record::Error { code, text } => {
                assert_eq!(*code, 1001);
                assert_eq!(text, "handler exploded");
            }
            other => panic!("Unexpected record {:?}", other),
        }

        link.shutdown();
    }

    struct Ticker;

    impl Handler for Ticker {
        fn setup(&mut self, ctx: &mut AppContext) {
            ctx.add_timer(Duration::from_millis(20), 1);
        }

        fn timer(&mut self, token: u64, ctx: &mut AppContext) {
            if token == 1 {
                ctx.send(sample("from-timer"));
            }
        }
    }

    #[test]
    fn test_worker_timer_generates_message() {
        let mut link = AppLink::worker(Box::new(Ticker), None).unwrap();

        let records = wait_readable(&mut link);
        assert!(
            matches!(&records[0], Record::App(msg) if msg.get_str(11) == Some("from-timer"))
        );

        link.shutdown();
    }

    #[test]
    fn test_inline_handler() {
        let (finished_tx, finished_rx) = mpsc::channel();
        let mut app = InlineApp::new(Box::new(Echo {
            prefix: "in-".to_string(),
            finished: finished_tx,
        }));

        let out = app.handle(sample("oid-1")).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get_str(11), Some("in-oid-1"));

        let err = app.handle(sample("explode")).unwrap_err();
        assert_eq!(err.code, 1001);

        app.finish();
        finished_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("finish hook did not run");
    }

    #[test]
    fn test_inline_timer_tick() {
        let mut app = InlineApp::new(Box::new(Ticker));

        // Setup arms the timer relative to the first tick's clock.
        let now = Instant::now();
        assert!(app.tick(now).is_empty());

        let out = app.tick(now + Duration::from_millis(50));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get_str(11), Some("from-timer"));
    }
}
