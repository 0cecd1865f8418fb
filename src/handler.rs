//! Application handler chain.
//!
//! [`SoapHandler`]s are application code that sees every message in both
//! directions. A handler declares the header blocks it understands (these feed
//! the [`HandlerConfiguration`](crate::config::HandlerConfiguration) used by
//! MustUnderstand processing) and may mark headers understood while handling
//! a message. Errors returned by a handler are wrapped into
//! [`PipelineError::Handler`]; on the server they are then answered with a
//! SOAP fault, on the client they are raised to the caller.

use crate::cloner::TubeCloner;
use crate::config::SoapVersion;
use crate::error::{PipelineError, SoapFault};
use crate::header::QName;
use crate::message::Message;
use crate::packet::Packet;
use crate::tube::{NextAction, Tube, TubeId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Error type handlers return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Application code invoked for every message.
pub trait SoapHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Header blocks this handler processes.
    fn understood_headers(&self) -> Vec<QName> {
        Vec::new()
    }

    /// Inspect or modify an outgoing request (client) or incoming request (server).
    fn handle_request(&self, packet: &mut Packet) -> Result<(), HandlerError>;

    /// Inspect or modify the matching response.
    fn handle_response(&self, packet: &mut Packet) -> Result<(), HandlerError> {
        let _ = packet;
        Ok(())
    }
}

/// Which end of the conversation a handler tube sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Ordered list of handlers. Requests visit it front to back, responses back
/// to front.
#[derive(Clone, Default)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn SoapHandler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: impl SoapHandler + 'static) -> Self {
        self.push(Arc::new(handler));
        self
    }

    pub fn push(&mut self, handler: Arc<dyn SoapHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Union of the headers every handler understands.
    pub fn understood_headers(&self) -> HashSet<QName> {
        self.handlers.iter().flat_map(|h| h.understood_headers()).collect()
    }

    fn run_requests(&self, packet: &mut Packet) -> Result<(), PipelineError> {
        for handler in &self.handlers {
            handler
                .handle_request(packet)
                .map_err(|e| PipelineError::handler(handler.name(), e))?;
        }
        Ok(())
    }

    fn run_responses(&self, packet: &mut Packet) -> Result<(), PipelineError> {
        for handler in self.handlers.iter().rev() {
            handler
                .handle_response(packet)
                .map_err(|e| PipelineError::handler(handler.name(), e))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.handlers.iter().map(|h| h.name())).finish()
    }
}

/// Runs a [`HandlerChain`] around the rest of the tubeline.
#[derive(Debug, Clone)]
pub struct HandlerTube {
    side: Side,
    version: SoapVersion,
    chain: Arc<HandlerChain>,
    next: TubeId,
}

impl HandlerTube {
    pub fn new(side: Side, version: SoapVersion, chain: Arc<HandlerChain>, next: TubeId) -> Self {
        Self {
            side,
            version,
            chain,
            next,
        }
    }

    fn fault_for(&self, error: &PipelineError) -> Message {
        let fault = error
            .to_fault(self.version)
            .unwrap_or_else(|| SoapFault::server(self.version, error.to_string()));
        Message::from_fault(&fault)
    }
}

impl Tube for HandlerTube {
    fn name(&self) -> &str {
        match self.side {
            Side::Client => "client-handlers",
            Side::Server => "server-handlers",
        }
    }

    fn process_request(&mut self, mut packet: Packet) -> NextAction {
        match self.chain.run_requests(&mut packet) {
            Ok(()) => NextAction::invoke(self.next, packet),
            Err(e) => {
                warn!(side = ?self.side, error = %e, "Handler failed on request");
                match self.side {
                    // The response still travels back through earlier tubes
                    Side::Server => NextAction::Return(packet.create_response(Some(self.fault_for(&e)))),
                    Side::Client => NextAction::Throw(e),
                }
            }
        }
    }

    fn process_response(&mut self, mut packet: Packet) -> NextAction {
        match self.chain.run_responses(&mut packet) {
            Ok(()) => NextAction::Return(packet),
            Err(e) => {
                warn!(side = ?self.side, error = %e, "Handler failed on response");
                match self.side {
                    Side::Server => {
                        debug!(packet = packet.id(), "Replacing response with fault");
                        packet.set_message(Some(self.fault_for(&e)));
                        NextAction::Return(packet)
                    }
                    Side::Client => NextAction::Throw(e),
                }
            }
        }
    }

    fn successors(&self) -> Vec<TubeId> {
        vec![self.next]
    }

    fn copy(&self, cloner: &mut TubeCloner<'_>) -> Result<Box<dyn Tube>, PipelineError> {
        Ok(Box::new(Self {
            side: self.side,
            version: self.version,
            chain: self.chain.clone(),
            next: cloner.copy(self.next)?,
        }))
    }
}
