//! Standard tubeline assembly from configuration.
//!
//! Server: `[dump] -> mu -> [handlers] -> endpoint`
//! Client: `[handlers] -> mu -> [dump] -> transport`
//!
//! The MustUnderstand tube always sits outside the handler tube, and its
//! handler configuration includes every header the chain declares.

use crate::adapter::PipeAdapter;
use crate::config::{HandlerConfiguration, PipelineConfig};
use crate::dump::DumpTube;
use crate::error::PipelineError;
use crate::handler::{HandlerChain, HandlerTube, Side};
use crate::mu::{ClientMuTube, ServerMuTube};
use crate::tube::{Pipe, Tube, Tubeline, TubelineBuilder};
use std::sync::Arc;
use tracing::info;

/// Handler configuration for `config` plus the headers `chain` understands.
pub fn handler_configuration(config: &PipelineConfig, chain: &HandlerChain) -> Arc<HandlerConfiguration> {
    Arc::new(HandlerConfiguration::from_config(config, chain.understood_headers()))
}

/// Server tubeline ending in `endpoint`.
pub fn server_tubeline(
    config: &PipelineConfig,
    chain: Arc<HandlerChain>,
    endpoint: impl Tube + 'static,
) -> Result<Tubeline, PipelineError> {
    let version = config.settings.soap_version;
    let handler_config = handler_configuration(config, &chain);

    let mut b = TubelineBuilder::new();
    let mut head = b.add(endpoint);
    if !chain.is_empty() {
        head = b.add(HandlerTube::new(Side::Server, version, chain.clone(), head));
    }
    head = b.add(ServerMuTube::new(version, handler_config, head));
    if config.settings.dump_messages {
        head = b.add(DumpTube::new("server-dump", head));
    }

    let tubeline = b.build(head)?;
    info!(
        soap_version = ?version,
        handlers = chain.len(),
        tubes = ?tubeline.names(),
        "Assembled server tubeline"
    );
    Ok(tubeline)
}

/// Server tubeline ending in a synchronous endpoint.
pub fn server_tubeline_for_pipe(
    config: &PipelineConfig,
    chain: Arc<HandlerChain>,
    endpoint: impl Pipe + 'static,
) -> Result<Tubeline, PipelineError> {
    server_tubeline(config, chain, PipeAdapter::new(endpoint))
}

/// Client tubeline ending in `transport`.
pub fn client_tubeline(
    config: &PipelineConfig,
    chain: Arc<HandlerChain>,
    transport: impl Tube + 'static,
) -> Result<Tubeline, PipelineError> {
    let version = config.settings.soap_version;
    let binding_config = handler_configuration(config, &chain);

    let mut b = TubelineBuilder::new();
    let mut head = b.add(transport);
    if config.settings.dump_messages {
        head = b.add(DumpTube::new("client-dump", head));
    }
    head = b.add(ClientMuTube::new(version, binding_config, head));
    if !chain.is_empty() {
        head = b.add(HandlerTube::new(Side::Client, version, chain.clone(), head));
    }

    let tubeline = b.build(head)?;
    info!(
        soap_version = ?version,
        handlers = chain.len(),
        tubes = ?tubeline.names(),
        "Assembled client tubeline"
    );
    Ok(tubeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::FnPipe;
    use crate::config::SoapVersion;
    use crate::fiber::Fiber;
    use crate::handler::{HandlerError, SoapHandler};
    use crate::header::{Header, QName};
    use crate::message::Message;
    use crate::packet::Packet;

    const NS: &str = "urn:audit";

    struct AuditHandler;

    impl SoapHandler for AuditHandler {
        fn name(&self) -> &str {
            "audit"
        }

        fn understood_headers(&self) -> Vec<QName> {
            vec![QName::new(NS, "Audit")]
        }

        fn handle_request(&self, _packet: &mut Packet) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn endpoint() -> FnPipe<impl FnMut(Packet) -> Result<Packet, PipelineError> + Clone + Send + 'static> {
        FnPipe::new("endpoint", |packet: Packet| {
            let reply = Message::from_payload(SoapVersion::Soap11, "<done/>")?;
            Ok(packet.create_response(Some(reply)))
        })
    }

    fn audited_request() -> Packet {
        let mut message = Message::from_payload(SoapVersion::Soap11, "<op/>").unwrap();
        message.headers_mut().add(
            Header::parse(
                SoapVersion::Soap11,
                format!(
                    r#"<a:Audit xmlns:a="{NS}" xmlns:S="{}" S:mustUnderstand="1"/>"#,
                    SoapVersion::Soap11.ns_uri()
                ),
            )
            .unwrap(),
        );
        Packet::new(message)
    }

    #[test]
    fn test_server_order() {
        let config = PipelineConfig::default();
        let chain = Arc::new(HandlerChain::new().with(AuditHandler));
        let tubeline = server_tubeline_for_pipe(&config, chain, endpoint()).unwrap();
        assert_eq!(tubeline.names(), vec!["server-mu", "server-handlers", "endpoint"]);
    }

    #[test]
    fn test_dump_inserted_when_configured() {
        let mut config = PipelineConfig::default();
        config.settings.dump_messages = true;
        let tubeline = server_tubeline_for_pipe(&config, Arc::new(HandlerChain::new()), endpoint()).unwrap();
        assert_eq!(tubeline.names(), vec!["server-dump", "server-mu", "endpoint"]);

        let client = client_tubeline(&config, Arc::new(HandlerChain::new()), PipeAdapter::new(endpoint())).unwrap();
        assert_eq!(client.names(), vec!["client-mu", "client-dump", "endpoint"]);
    }

    #[test]
    fn test_handler_headers_are_known() {
        let config = PipelineConfig::default();

        let bare = server_tubeline_for_pipe(&config, Arc::new(HandlerChain::new()), endpoint()).unwrap();
        let response = Fiber::new(bare).run_sync(audited_request()).unwrap();
        assert!(response.message().unwrap().is_fault());

        let chain = Arc::new(HandlerChain::new().with(AuditHandler));
        let audited = server_tubeline_for_pipe(&config, chain, endpoint()).unwrap();
        let response = Fiber::new(audited).run_sync(audited_request()).unwrap();
        assert!(!response.message().unwrap().is_fault());
    }
}
