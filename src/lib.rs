//! SOAP message-processing pipeline for Zentinel
//!
//! Messages travel through a graph of processing stages ("tubes") driven by a
//! lightweight fiber, so a stage can suspend while waiting on I/O without
//! holding a thread. Graphs can be cloned for concurrent use, and the
//! framework enforces SOAP `mustUnderstand` semantics on both the client and
//! the server side.
//!
//! # Features
//!
//! - Tube graphs with request, response and exception processing
//! - Fiber execution with suspend/resume, blocking or async
//! - Graph cloning that preserves shared stages and cycles
//! - MustUnderstand checks with SOAP 1.1 and 1.2 fault generation
//! - Adapters between synchronous pipes and tubes
//! - XML, SOAP and Fast Infoset codecs
//! - Handler chains, message dumping and tubeline pooling
//!
//! # Example
//!
//! ```ignore
//! use zentinel_soap_pipeline::{Fiber, FnPipe, PipeAdapter, ServerMuTube, TubelineBuilder};
//!
//! let mut builder = TubelineBuilder::new();
//! let endpoint = builder.add(PipeAdapter::new(FnPipe::new("endpoint", invoke_service)));
//! let head = builder.add(ServerMuTube::new(version, handler_config, endpoint));
//!
//! let mut fiber = Fiber::new(builder.build(head)?);
//! let response = fiber.run_sync(request)?;
//! ```

pub mod adapter;
pub mod assembler;
pub mod cloner;
pub mod codec;
pub mod config;
pub mod dump;
pub mod error;
pub mod fastinfoset;
pub mod fiber;
pub mod handler;
pub mod header;
pub mod message;
pub mod mu;
pub mod packet;
pub mod parser;
pub mod pool;
pub mod tube;

pub use adapter::{FnPipe, PipeAdapter, TubeAdapter};
pub use assembler::{client_tubeline, server_tubeline};
pub use cloner::TubeCloner;
pub use codec::{Codec, CodecRegistry, ContentType, SoapCodec, XmlCodec};
pub use config::{HandlerConfiguration, PipelineConfig, SoapVersion};
pub use dump::DumpTube;
pub use error::{PipelineError, SoapFault};
pub use fastinfoset::FastInfosetCodec;
pub use fiber::{Engine, Fiber, FiberStatus, Resumer};
pub use handler::{HandlerChain, HandlerTube, Side, SoapHandler};
pub use header::{Header, HeaderList, QName};
pub use message::Message;
pub use mu::{mis_understood_headers, ClientMuPipe, ClientMuTube, ServerMuPipe, ServerMuTube};
pub use packet::Packet;
pub use parser::parse_soap_envelope;
pub use pool::TubelinePool;
pub use tube::{NextAction, Pipe, Tube, TubeId, Tubeline, TubelineBuilder};
