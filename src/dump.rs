//! Message dumping.
//!
//! [`DumpTube`] logs every packet passing through it, once on the way in and
//! once on the way back, at `debug` level under the
//! `zentinel_soap_pipeline::dump` target. The logged content is taken from a
//! copy of the message so the payload stays unread for the next tube.

use crate::cloner::TubeCloner;
use crate::error::PipelineError;
use crate::packet::Packet;
use crate::tube::{NextAction, Tube, TubeId};
use std::fmt::Write as _;
use tracing::{debug, enabled, Level};

/// Target dumped messages are logged under.
pub const DUMP_TARGET: &str = "zentinel_soap_pipeline::dump";

/// Render a packet for logging without consuming its message.
pub fn render_packet(packet: &Packet) -> String {
    let mut out = String::new();
    let _ = write!(out, "packet={}", packet.id());
    if let Some(request) = packet.responding_to() {
        let _ = write!(out, " responding_to={}", request);
    }
    if let Some(action) = &packet.soap_action {
        let _ = write!(out, " soap_action=\"{}\"", action);
    }

    let Some(message) = packet.message() else {
        out.push_str(" message=<none>");
        return out;
    };

    let version = message
        .version()
        .map(|v| format!("{:?}", v))
        .unwrap_or_else(|| "xml".to_string());
    let _ = write!(out, " version={} fault={}", version, message.is_fault());
    for header in message.headers() {
        let _ = write!(out, "\n  header {}", header.xml());
    }
    match message.copy() {
        Ok(mut copy) => match copy.read_payload() {
            Ok(payload) => {
                let _ = write!(out, "\n  body {}", payload.as_str());
            }
            Err(e) => {
                let _ = write!(out, "\n  body <{}>", e);
            }
        },
        Err(_) => out.push_str("\n  body <consumed>"),
    }
    out
}

/// Logs packets in both directions and forwards them unchanged.
#[derive(Debug, Clone)]
pub struct DumpTube {
    name: String,
    next: TubeId,
}

impl DumpTube {
    pub fn new(name: impl Into<String>, next: TubeId) -> Self {
        Self {
            name: name.into(),
            next,
        }
    }

    fn dump(&self, direction: &str, packet: &Packet) {
        if enabled!(target: DUMP_TARGET, Level::DEBUG) {
            debug!(
                target: DUMP_TARGET,
                tube = %self.name,
                direction = direction,
                "{}",
                render_packet(packet)
            );
        }
    }
}

impl Tube for DumpTube {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_request(&mut self, packet: Packet) -> NextAction {
        self.dump("request", &packet);
        NextAction::invoke(self.next, packet)
    }

    fn process_response(&mut self, packet: Packet) -> NextAction {
        self.dump("response", &packet);
        NextAction::Return(packet)
    }

    fn process_exception(&mut self, error: PipelineError) -> NextAction {
        debug!(target: DUMP_TARGET, tube = %self.name, error = %error, "exception");
        NextAction::Throw(error)
    }

    fn successors(&self) -> Vec<TubeId> {
        vec![self.next]
    }

    fn copy(&self, cloner: &mut TubeCloner<'_>) -> Result<Box<dyn Tube>, PipelineError> {
        Ok(Box::new(Self {
            name: self.name.clone(),
            next: cloner.copy(self.next)?,
        }))
    }
}
