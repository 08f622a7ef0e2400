//! The bundled demo handlers: a sink that files away everything it
//! receives, and a source that generates a small order every thirty
//! seconds.

use conduit::applink::{AppContext, AppError, Handler};
use fixwire::message::{BodyItem, FixMessage};
use fixwire::time::utc_timestamp;
use rand::Rng;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::time::Duration;

const ORDER_TIMER: u64 = 1;
const ORDER_INTERVAL: Duration = Duration::from_secs(30);

/// Human-readable rendition of a message, SOH drawn as `|`.
pub fn render(msg: &FixMessage) -> String {
    let mut out = format!("35={}|", msg.msg_type);
    for field in msg.header_fields() {
        out.push_str(&format!(
            "{}={}|",
            field.tag,
            String::from_utf8_lossy(&field.value)
        ));
    }
    for item in msg.body_items() {
        match item {
            BodyItem::Field(field) => out.push_str(&format!(
                "{}={}|",
                field.tag,
                String::from_utf8_lossy(&field.value)
            )),
            BodyItem::Group(group) => {
                out.push_str(&format!("{}={}|", group.tag, group.entries.len()));
                for entry in &group.entries {
                    for field in entry {
                        out.push_str(&format!(
                            "{}={}|",
                            field.tag,
                            String::from_utf8_lossy(&field.value)
                        ));
                    }
                }
            }
        }
    }
    out
}

fn append_line(file: &mut Option<File>, path: &str, line: &str) -> io::Result<()> {
    if file.is_none() {
        *file = Some(OpenOptions::new().create(true).append(true).open(path)?);
    }
    let file = file.as_mut().unwrap();
    writeln!(file, "{}", line)?;
    file.flush()
}

/// Eats every incoming message, appending it to a file.
pub struct FixSink {
    path: String,
    file: Option<File>,
}

impl FixSink {
    pub fn new(path: &str) -> FixSink {
        FixSink {
            path: path.to_string(),
            file: None,
        }
    }
}

impl Handler for FixSink {
    fn handle(
        &mut self,
        msg: FixMessage,
        _ctx: &mut AppContext,
    ) -> Result<Option<FixMessage>, AppError> {
        append_line(&mut self.file, &self.path, &render(&msg)).map_err(|err| AppError {
            code: 1001,
            text: format!("sink write failed: {}", err),
        })?;
        Ok(None)
    }
}

/// Emits a randomized NewOrderSingle on a fixed cadence and files away
/// anything it receives.
pub struct FixSource {
    path: String,
    file: Option<File>,
}

impl FixSource {
    pub fn new(path: &str) -> FixSource {
        FixSource {
            path: path.to_string(),
            file: None,
        }
    }

    fn new_order(&self) -> FixMessage {
        let mut rng = rand::thread_rng();
        let mut msg = FixMessage::new("D");
        msg.set_body(11, format!("Oid-{:04}", rng.gen_range(1000..3000)));
        msg.set_body(55, "FOO");
        msg.set_body(48, "ISIN_000");
        msg.set_body(54, if rng.gen_bool(0.5) { "1" } else { "2" });
        msg.set_body(40, "1");
        msg.set_body(38, rng.gen_range(50..100u32).to_string());
        msg.set_body(15, "EUR");
        msg.set_body(60, utc_timestamp());
        msg
    }
}

impl Handler for FixSource {
    fn setup(&mut self, ctx: &mut AppContext) {
        ctx.add_timer(ORDER_INTERVAL, ORDER_TIMER);
    }

    fn handle(
        &mut self,
        msg: FixMessage,
        _ctx: &mut AppContext,
    ) -> Result<Option<FixMessage>, AppError> {
        append_line(&mut self.file, &self.path, &render(&msg)).map_err(|err| AppError {
            code: 1001,
            text: format!("source write failed: {}", err),
        })?;
        Ok(None)
    }

    fn timer(&mut self, token: u64, ctx: &mut AppContext) {
        if token != ORDER_TIMER {
            return;
        }
        let order = self.new_order();
        let _ = append_line(&mut self.file, &self.path, &render(&order));
        ctx.send(order);
        ctx.add_timer(ORDER_INTERVAL, ORDER_TIMER);
    }
}

/// Builds a handler from its `kind:path` expression.
pub fn make_handler(expr: &str) -> Result<Box<dyn Handler>, String> {
    let (kind, path) = match expr.find(':') {
        Some(at) => (&expr[..at], &expr[at + 1..]),
        None => (expr, "handler.dat"),
    };
    match kind {
        "sink" => Ok(Box::new(FixSink::new(path))),
        "source" => Ok(Box::new(FixSource::new(path))),
        other => Err(format!("unknown handler '{}', expected sink or source", other)),
    }
}
