//! SOAP MustUnderstand processing.
//!
//! A receiver must reject a message carrying a `mustUnderstand` header block
//! that targets one of its roles unless it knows that header. Servers answer
//! such a request with a MustUnderstand fault without invoking the service.
//! Clients raise the fault to the caller when a response violates the rule.

use crate::cloner::TubeCloner;
use crate::config::{HandlerConfiguration, SoapVersion};
use crate::error::{xml_escape, PipelineError, SoapFault};
use crate::header::{Header, HeaderList, QName};
use crate::message::Message;
use crate::packet::Packet;
use crate::tube::{NextAction, Pipe, Tube, TubeId};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Local name of the SOAP 1.2 header reporting a header that was not understood.
pub const NOT_UNDERSTOOD: &str = "NotUnderstood";

/// Names of the header blocks in `headers` that violate the MustUnderstand rule.
///
/// Headers already marked understood are skipped, as are headers that are
/// ignorable for `roles`. Every remaining header whose name is not in
/// `known_headers` is reported. The result is empty when the message is fine.
pub fn mis_understood_headers(
    headers: &HeaderList,
    roles: &HashSet<String>,
    known_headers: &HashSet<QName>,
) -> BTreeSet<QName> {
    let mut not_understood = BTreeSet::new();
    for (index, header) in headers.iter().enumerate() {
        if headers.is_understood(index) || header.is_ignorable(roles) {
            continue;
        }
        if !known_headers.contains(header.name()) {
            trace!(header = %header.name(), "Element not understood");
            not_understood.insert(header.name().clone());
        }
    }
    not_understood
}

/// SOAP 1.2 `NotUnderstood` header naming `qname`.
///
/// The namespace of the offending header is bound to the `abc` prefix on the
/// element itself.
pub fn not_understood_header(qname: &QName) -> Result<Header, PipelineError> {
    let ns = SoapVersion::Soap12.ns_uri();
    let xml = if qname.namespace().is_empty() {
        format!(
            r#"<S:{} xmlns:S="{}" qname="{}"/>"#,
            NOT_UNDERSTOOD,
            ns,
            xml_escape(qname.local_name())
        )
    } else {
        format!(
            r#"<S:{} xmlns:S="{}" xmlns:abc="{}" qname="abc:{}"/>"#,
            NOT_UNDERSTOOD,
            ns,
            xml_escape(qname.namespace()),
            xml_escape(qname.local_name())
        )
    };
    Header::parse(SoapVersion::Soap12, xml)
}

/// Fault message reporting `not_understood`.
///
/// SOAP 1.1 lists the names in the fault string. SOAP 1.2 additionally adds one
/// `NotUnderstood` header per name to the message.
pub fn must_understand_fault_message(
    version: SoapVersion,
    not_understood: &BTreeSet<QName>,
) -> Result<Message, PipelineError> {
    let fault = SoapFault::must_understand(version, not_understood.iter().cloned());
    let mut message = Message::from_fault(&fault);
    if version == SoapVersion::Soap12 {
        for qname in not_understood {
            message.headers_mut().add(not_understood_header(qname)?);
        }
    }
    Ok(message)
}

fn log_violation(side: &str, version: SoapVersion, not_understood: &BTreeSet<QName>) {
    warn!(
        side = side,
        soap_version = ?version,
        headers = %not_understood
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
        "MustUnderstand violation"
    );
}

/// Server-side check for inbound requests.
///
/// The handler configuration of a server never changes after it is published,
/// so it is fixed at construction and shared by all copies.
#[derive(Debug, Clone)]
pub struct ServerMuTube {
    version: SoapVersion,
    handler_config: Arc<HandlerConfiguration>,
    next: TubeId,
}

impl ServerMuTube {
    pub fn new(version: SoapVersion, handler_config: Arc<HandlerConfiguration>, next: TubeId) -> Self {
        Self {
            version,
            handler_config,
            next,
        }
    }
}

impl Tube for ServerMuTube {
    fn name(&self) -> &str {
        "server-mu"
    }

    fn process_request(&mut self, packet: Packet) -> NextAction {
        let Some(message) = packet.message() else {
            return NextAction::invoke(self.next, packet);
        };

        let not_understood = mis_understood_headers(
            message.headers(),
            self.handler_config.roles(),
            self.handler_config.known_headers(),
        );
        if not_understood.is_empty() {
            return NextAction::invoke(self.next, packet);
        }

        log_violation("server", self.version, &not_understood);
        match must_understand_fault_message(self.version, &not_understood) {
            Ok(fault) => NextAction::Return(packet.create_response(Some(fault))),
            Err(e) => NextAction::Throw(e),
        }
    }

    fn successors(&self) -> Vec<TubeId> {
        vec![self.next]
    }

    fn copy(&self, cloner: &mut TubeCloner<'_>) -> Result<Box<dyn Tube>, PipelineError> {
        Ok(Box::new(Self {
            version: self.version,
            handler_config: self.handler_config.clone(),
            next: cloner.copy(self.next)?,
        }))
    }
}

/// Client-side check for inbound responses.
///
/// A proxy may swap its handler configuration per request, so the
/// configuration in effect is taken from the request packet and remembered
/// until the matching response comes back.
#[derive(Debug, Clone)]
pub struct ClientMuTube {
    version: SoapVersion,
    binding_config: Arc<HandlerConfiguration>,
    next: TubeId,
    request: Option<(u64, Arc<HandlerConfiguration>)>,
}

impl ClientMuTube {
    pub fn new(version: SoapVersion, binding_config: Arc<HandlerConfiguration>, next: TubeId) -> Self {
        Self {
            version,
            binding_config,
            next,
            request: None,
        }
    }

    fn config_for(&self, response: &Packet) -> Arc<HandlerConfiguration> {
        match &self.request {
            Some((id, config)) if response.is_response_to(*id) => config.clone(),
            Some((id, _)) => {
                debug!(
                    request = *id,
                    response = response.id(),
                    "Response is not correlated with the last request, using binding configuration"
                );
                self.binding_config.clone()
            }
            None => self.binding_config.clone(),
        }
    }
}

impl Tube for ClientMuTube {
    fn name(&self) -> &str {
        "client-mu"
    }

    fn process_request(&mut self, packet: Packet) -> NextAction {
        let config = packet
            .handler_config()
            .cloned()
            .unwrap_or_else(|| self.binding_config.clone());
        self.request = Some((packet.id(), config));
        NextAction::invoke(self.next, packet)
    }

    fn process_response(&mut self, packet: Packet) -> NextAction {
        let config = self.config_for(&packet);
        self.request = None;

        // One-way
        let Some(message) = packet.message() else {
            return NextAction::Return(packet);
        };

        let not_understood = mis_understood_headers(message.headers(), config.roles(), config.known_headers());
        if not_understood.is_empty() {
            return NextAction::Return(packet);
        }

        log_violation("client", self.version, &not_understood);
        NextAction::Throw(SoapFault::must_understand(self.version, not_understood).into())
    }

    fn process_exception(&mut self, error: PipelineError) -> NextAction {
        self.request = None;
        NextAction::Throw(error)
    }

    fn successors(&self) -> Vec<TubeId> {
        vec![self.next]
    }

    fn copy(&self, cloner: &mut TubeCloner<'_>) -> Result<Box<dyn Tube>, PipelineError> {
        Ok(Box::new(Self {
            version: self.version,
            binding_config: self.binding_config.clone(),
            next: cloner.copy(self.next)?,
            request: None,
        }))
    }
}

/// Synchronous form of [`ServerMuTube`] wrapping the next pipe.
pub struct ServerMuPipe {
    version: SoapVersion,
    handler_config: Arc<HandlerConfiguration>,
    next: Box<dyn Pipe>,
}

impl ServerMuPipe {
    pub fn new(version: SoapVersion, handler_config: Arc<HandlerConfiguration>, next: Box<dyn Pipe>) -> Self {
        Self {
            version,
            handler_config,
            next,
        }
    }
}

impl Pipe for ServerMuPipe {
    fn name(&self) -> &str {
        "server-mu"
    }

    fn process(&mut self, packet: Packet) -> Result<Packet, PipelineError> {
        let not_understood = match packet.message() {
            Some(message) => mis_understood_headers(
                message.headers(),
                self.handler_config.roles(),
                self.handler_config.known_headers(),
            ),
            None => BTreeSet::new(),
        };
        if not_understood.is_empty() {
            return self.next.process(packet);
        }

        log_violation("server", self.version, &not_understood);
        let fault = must_understand_fault_message(self.version, &not_understood)?;
        Ok(packet.create_response(Some(fault)))
    }

    fn pre_destroy(&mut self) {
        self.next.pre_destroy();
    }

    fn copy(&self) -> Result<Box<dyn Pipe>, PipelineError> {
        Ok(Box::new(Self {
            version: self.version,
            handler_config: self.handler_config.clone(),
            next: self.next.copy()?,
        }))
    }
}

/// Synchronous form of [`ClientMuTube`] wrapping the next pipe.
pub struct ClientMuPipe {
    version: SoapVersion,
    binding_config: Arc<HandlerConfiguration>,
    next: Box<dyn Pipe>,
}

impl ClientMuPipe {
    pub fn new(version: SoapVersion, binding_config: Arc<HandlerConfiguration>, next: Box<dyn Pipe>) -> Self {
        Self {
            version,
            binding_config,
            next,
        }
    }
}

impl Pipe for ClientMuPipe {
    fn name(&self) -> &str {
        "client-mu"
    }

    fn process(&mut self, packet: Packet) -> Result<Packet, PipelineError> {
        let config = packet
            .handler_config()
            .cloned()
            .unwrap_or_else(|| self.binding_config.clone());
        let reply = self.next.process(packet)?;

        // One-way
        let Some(message) = reply.message() else {
            return Ok(reply);
        };

        let not_understood = mis_understood_headers(message.headers(), config.roles(), config.known_headers());
        if not_understood.is_empty() {
            return Ok(reply);
        }

        log_violation("client", self.version, &not_understood);
        Err(SoapFault::must_understand(self.version, not_understood).into())
    }

    fn pre_destroy(&mut self) {
        self.next.pre_destroy();
    }

    fn copy(&self) -> Result<Box<dyn Pipe>, PipelineError> {
        Ok(Box::new(Self {
            version: self.version,
            binding_config: self.binding_config.clone(),
            next: self.next.copy()?,
        }))
    }
}
