//! Bridges between synchronous pipes and suspendable tubes.

use crate::cloner::TubeCloner;
use crate::error::PipelineError;
use crate::fiber::Fiber;
use crate::packet::Packet;
use crate::tube::{NextAction, Pipe, Tube, Tubeline};

/// Runs a [`Pipe`] as a single-shot [`Tube`].
///
/// `process_request` runs the pipe to completion and returns its result
/// directly, so the fiber never calls back into `process_response`.
pub struct PipeAdapter {
    pipe: Box<dyn Pipe>,
}

impl PipeAdapter {
    pub fn new(pipe: impl Pipe + 'static) -> Self {
        Self { pipe: Box::new(pipe) }
    }

    pub fn from_boxed(pipe: Box<dyn Pipe>) -> Self {
        Self { pipe }
    }
}

impl Tube for PipeAdapter {
    fn name(&self) -> &str {
        self.pipe.name()
    }

    fn process_request(&mut self, packet: Packet) -> NextAction {
        self.pipe.process(packet).into()
    }

    fn process_response(&mut self, packet: Packet) -> NextAction {
        NextAction::Throw(PipelineError::IllegalState(format!(
            "pipe {} received response packet {}",
            self.pipe.name(),
            packet.id()
        )))
    }

    fn pre_destroy(&mut self) {
        self.pipe.pre_destroy();
    }

    fn copy(&self, _cloner: &mut TubeCloner<'_>) -> Result<Box<dyn Tube>, PipelineError> {
        Ok(Box::new(Self {
            pipe: self.pipe.copy()?,
        }))
    }
}

/// Runs a [`Tubeline`] as a [`Pipe`] on a fiber of its own.
///
/// `process` blocks while the tubeline is suspended.
pub struct TubeAdapter {
    name: String,
    fiber: Fiber,
}

impl TubeAdapter {
    pub fn new(name: impl Into<String>, tubeline: Tubeline) -> Self {
        Self {
            name: name.into(),
            fiber: Fiber::new(tubeline),
        }
    }

    pub fn tubeline(&self) -> &Tubeline {
        self.fiber.tubeline()
    }
}

impl Pipe for TubeAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, packet: Packet) -> Result<Packet, PipelineError> {
        self.fiber.run_sync(packet)
    }

    fn pre_destroy(&mut self) {
        self.fiber.pre_destroy();
    }

    fn copy(&self) -> Result<Box<dyn Pipe>, PipelineError> {
        Ok(Box::new(Self::new(self.name.clone(), self.fiber.tubeline().copy()?)))
    }
}

/// A pipe backed by a closure.
#[derive(Clone)]
pub struct FnPipe<F> {
    name: String,
    f: F,
}

impl<F> FnPipe<F>
where
    F: FnMut(Packet) -> Result<Packet, PipelineError> + Clone + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> Pipe for FnPipe<F>
where
    F: FnMut(Packet) -> Result<Packet, PipelineError> + Clone + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, packet: Packet) -> Result<Packet, PipelineError> {
        (self.f)(packet)
    }

    fn copy(&self) -> Result<Box<dyn Pipe>, PipelineError> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::FiberStatus;
    use crate::tube::{TubeId, TubelineBuilder};

    fn echo() -> FnPipe<impl FnMut(Packet) -> Result<Packet, PipelineError> + Clone + Send + 'static> {
        FnPipe::new("echo", |packet: Packet| {
            let mut response = packet.create_response(None);
            response.set_invocation_property("echoed", "true");
            Ok(response)
        })
    }

    /// Forwards to `next`, tagging the response on the way back.
    struct Tagger {
        next: TubeId,
    }

    impl Tube for Tagger {
        fn name(&self) -> &str {
            "tagger"
        }

        fn process_request(&mut self, packet: Packet) -> NextAction {
            NextAction::invoke(self.next, packet)
        }

        fn process_response(&mut self, mut packet: Packet) -> NextAction {
            packet.set_invocation_property("tagged", "true");
            NextAction::Return(packet)
        }

        fn successors(&self) -> Vec<TubeId> {
            vec![self.next]
        }

        fn copy(&self, cloner: &mut TubeCloner<'_>) -> Result<Box<dyn Tube>, PipelineError> {
            Ok(Box::new(Tagger {
                next: cloner.copy(self.next)?,
            }))
        }
    }

    fn tagged_echo() -> Tubeline {
        let mut b = TubelineBuilder::new();
        let terminal = b.add(PipeAdapter::new(echo()));
        let head = b.add(Tagger { next: terminal });
        b.build(head).unwrap()
    }

    #[test]
    fn test_pipe_adapter_returns_directly() {
        let mut fiber = Fiber::new(tagged_echo());
        let response = fiber.run_sync(Packet::empty()).unwrap();
        assert_eq!(response.invocation_property("echoed"), Some("true"));
        assert_eq!(response.invocation_property("tagged"), Some("true"));
    }

    #[test]
    fn test_pipe_adapter_rejects_responses() {
        let mut adapter = PipeAdapter::new(echo());
        assert!(matches!(
            adapter.process_response(Packet::empty()),
            NextAction::Throw(PipelineError::IllegalState(_))
        ));
    }

    #[test]
    fn test_pipe_error_becomes_throw() {
        let failing = FnPipe::new("failing", |_packet: Packet| {
            Err(PipelineError::handler("failing", "no backend"))
        });
        let mut fiber = Fiber::new(Tubeline::single(PipeAdapter::new(failing)));
        assert!(matches!(
            fiber.run_sync(Packet::empty()),
            Err(PipelineError::Handler { .. })
        ));
    }

    #[test]
    fn test_tube_adapter_matches_fiber_run() {
        let mut adapter = TubeAdapter::new("bridge", tagged_echo());
        let via_pipe = adapter.process(Packet::empty()).unwrap();

        let mut fiber = Fiber::new(tagged_echo());
        fiber.start(Packet::empty()).unwrap();
        let via_tube = match fiber.run() {
            FiberStatus::Completed(result) => result.unwrap(),
            FiberStatus::Suspended => panic!("non-suspending tubeline suspended"),
        };

        assert_eq!(via_pipe.invocation_properties(), via_tube.invocation_properties());
        assert_eq!(via_pipe.message().is_some(), via_tube.message().is_some());
    }

    #[test]
    fn test_tube_adapter_is_reusable_and_copyable() {
        let mut adapter = TubeAdapter::new("bridge", tagged_echo());
        adapter.process(Packet::empty()).unwrap();
        adapter.process(Packet::empty()).unwrap();

        let mut copy = adapter.copy().unwrap();
        assert_eq!(copy.name(), "bridge");
        let response = copy.process(Packet::empty()).unwrap();
        assert_eq!(response.invocation_property("tagged"), Some("true"));
    }

    #[test]
    fn test_pre_destroy_reaches_wrapped_tubeline() {
        let mut adapter = TubeAdapter::new("bridge", tagged_echo());
        adapter.pre_destroy();
        assert!(adapter.tubeline().is_destroyed());
        assert!(adapter.process(Packet::empty()).is_err());
    }
}
