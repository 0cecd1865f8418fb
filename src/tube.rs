//! Processing-graph nodes and the arena that holds them.
//!
//! A [`Tubeline`] owns every [`Tube`] of one processing graph. Tubes refer to
//! each other through [`TubeId`] handles into that arena, so a graph may share
//! nodes or contain cycles without shared ownership. A tubeline is not
//! reentrant: it is driven by exactly one [`Fiber`](crate::fiber::Fiber) at a
//! time, and concurrent invocations each use their own copy made with
//! [`Tubeline::copy`].

use crate::cloner::TubeCloner;
use crate::error::PipelineError;
use crate::fiber::Resumer;
use crate::packet::Packet;
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, trace};

/// Handle of a tube inside its [`Tubeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TubeId(pub(crate) usize);

impl TubeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TubeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Callback run once a fiber has parked, used to hand its [`Resumer`] to
/// whatever completes the pending work.
pub type SuspendHook = Box<dyn FnOnce(Resumer) + Send>;

/// What the fiber does after a tube has run.
pub enum NextAction {
    /// Run `next` with `packet`, then come back to this tube's
    /// `process_response`.
    Invoke { next: TubeId, packet: Packet },
    /// Run `next` with `packet`. This tube is not called back.
    InvokeAndForget { next: TubeId, packet: Packet },
    /// Hand `packet` back to the previous tube on the continuation stack.
    Return(Packet),
    /// Park the fiber. On resume, this tube's `process_response` receives the
    /// packet passed to [`Resumer::resume`].
    Suspend(Option<SuspendHook>),
    /// Unwind through `process_exception` of the tubes waiting for a response.
    Throw(PipelineError),
}

impl NextAction {
    pub fn invoke(next: TubeId, packet: Packet) -> Self {
        Self::Invoke { next, packet }
    }

    pub fn invoke_and_forget(next: TubeId, packet: Packet) -> Self {
        Self::InvokeAndForget { next, packet }
    }

    pub fn suspend() -> Self {
        Self::Suspend(None)
    }

    /// Suspend and pass the fiber's resumer to `hook` once it is parked.
    pub fn suspend_with(hook: impl FnOnce(Resumer) + Send + 'static) -> Self {
        Self::Suspend(Some(Box::new(hook)))
    }

    /// Short name of the action, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Invoke { .. } => "invoke",
            Self::InvokeAndForget { .. } => "invoke_and_forget",
            Self::Return(_) => "return",
            Self::Suspend(_) => "suspend",
            Self::Throw(_) => "throw",
        }
    }
}

impl From<Result<Packet, PipelineError>> for NextAction {
    fn from(result: Result<Packet, PipelineError>) -> Self {
        match result {
            Ok(packet) => Self::Return(packet),
            Err(e) => Self::Throw(e),
        }
    }
}

impl fmt::Debug for NextAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invoke { next, packet } => f
                .debug_struct("Invoke")
                .field("next", next)
                .field("packet", &packet.id())
                .finish(),
            Self::InvokeAndForget { next, packet } => f
                .debug_struct("InvokeAndForget")
                .field("next", next)
                .field("packet", &packet.id())
                .finish(),
            Self::Return(packet) => f.debug_tuple("Return").field(&packet.id()).finish(),
            Self::Suspend(hook) => f.debug_tuple("Suspend").field(&hook.is_some()).finish(),
            Self::Throw(e) => f.debug_tuple("Throw").field(e).finish(),
        }
    }
}

/// Suspend-capable processing stage.
///
/// Tubes refer to downstream tubes by [`TubeId`] and must report every id they
/// hold from [`Tube::successors`], so the tubeline can walk the graph for
/// teardown and copying.
pub trait Tube: Send {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Process a request travelling away from the caller.
    fn process_request(&mut self, packet: Packet) -> NextAction;

    /// Process a response on its way back. Only called on tubes that returned
    /// [`NextAction::Invoke`] or [`NextAction::Suspend`].
    ///
    /// The packet is not guaranteed to belong to the request this tube last
    /// saw; check any correlation state set up in `process_request`.
    fn process_response(&mut self, packet: Packet) -> NextAction {
        NextAction::Return(packet)
    }

    /// Handle an error raised further down the tubeline. Returning a packet
    /// recovers, returning [`NextAction::Throw`] keeps unwinding.
    fn process_exception(&mut self, error: PipelineError) -> NextAction {
        NextAction::Throw(error)
    }

    /// Tubes this tube may invoke.
    fn successors(&self) -> Vec<TubeId> {
        Vec::new()
    }

    /// Release resources. Called once per tube when its tubeline is destroyed.
    fn pre_destroy(&mut self) {}

    /// Create this tube's counterpart for a copy of the tubeline.
    ///
    /// Implementations copy their own state and obtain the ids of the copied
    /// successors through `cloner.copy(id)`.
    fn copy(&self, cloner: &mut TubeCloner<'_>) -> Result<Box<dyn Tube>, PipelineError> {
        let _ = cloner;
        Err(PipelineError::UnsupportedCopy(self.name().to_string()))
    }
}

/// Synchronous processing stage.
pub trait Pipe: Send {
    fn name(&self) -> &str;

    /// Turn a request into a response.
    fn process(&mut self, packet: Packet) -> Result<Packet, PipelineError>;

    /// Release resources.
    fn pre_destroy(&mut self) {}

    /// Create an independent copy for use by another invocation.
    fn copy(&self) -> Result<Box<dyn Pipe>, PipelineError> {
        Err(PipelineError::UnsupportedCopy(self.name().to_string()))
    }
}

/// An arena of tubes plus the entry point of the graph.
pub struct Tubeline {
    tubes: Vec<Box<dyn Tube>>,
    head: TubeId,
    destroyed: bool,
}

impl Tubeline {
    /// Single-tube tubeline.
    pub fn single(tube: impl Tube + 'static) -> Self {
        Self {
            tubes: vec![Box::new(tube)],
            head: TubeId(0),
            destroyed: false,
        }
    }

    pub(crate) fn from_parts(tubes: Vec<Box<dyn Tube>>, head: TubeId) -> Result<Self, PipelineError> {
        if head.0 >= tubes.len() {
            return Err(PipelineError::InvalidGraph(format!("head {} is not in the tubeline", head)));
        }
        for (index, tube) in tubes.iter().enumerate() {
            if let Some(bad) = tube.successors().into_iter().find(|s| s.0 >= tubes.len()) {
                return Err(PipelineError::InvalidGraph(format!(
                    "tube {} ({}) refers to missing tube {}",
                    index,
                    tube.name(),
                    bad
                )));
            }
        }
        Ok(Self {
            tubes,
            head,
            destroyed: false,
        })
    }

    /// Entry point of the graph.
    pub fn head(&self) -> TubeId {
        self.head
    }

    pub fn len(&self) -> usize {
        self.tubes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tubes.is_empty()
    }

    pub fn get(&self, id: TubeId) -> Option<&dyn Tube> {
        self.tubes.get(id.0).map(|t| t.as_ref())
    }

    pub(crate) fn tube_mut(&mut self, id: TubeId) -> Result<&mut (dyn Tube + 'static), PipelineError> {
        self.tubes
            .get_mut(id.0)
            .map(|t| t.as_mut())
            .ok_or_else(|| PipelineError::InvalidGraph(format!("no tube {}", id)))
    }

    /// Ids of every tube reachable from the head, in breadth-first order.
    pub fn reachable(&self) -> Vec<TubeId> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue = std::collections::VecDeque::from([self.head]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            order.push(id);
            if let Some(tube) = self.get(id) {
                queue.extend(tube.successors());
            }
        }
        order
    }

    /// Names of the reachable tubes, head first.
    pub fn names(&self) -> Vec<String> {
        self.reachable()
            .into_iter()
            .filter_map(|id| self.get(id).map(|t| t.name().to_string()))
            .collect()
    }

    /// Deep copy with identical topology, shared nodes and cycles included.
    pub fn copy(&self) -> Result<Tubeline, PipelineError> {
        TubeCloner::new(self).clone_tubeline()
    }

    /// Tear down every reachable tube exactly once. Later calls do nothing.
    pub fn pre_destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        let reachable = self.reachable();
        debug!(tubes = reachable.len(), "Destroying tubeline");
        for id in reachable {
            if let Some(tube) = self.tubes.get_mut(id.0) {
                trace!(tube = tube.name(), "pre_destroy");
                tube.pre_destroy();
            }
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl fmt::Debug for Tubeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tubeline")
            .field("head", &self.head)
            .field("tubes", &self.tubes.iter().map(|t| t.name()).collect::<Vec<_>>())
            .finish()
    }
}

/// Incremental construction of a [`Tubeline`].
///
/// Tubes are usually added back to front, each receiving the id of the tube it
/// forwards to. [`TubelineBuilder::reserve`] hands out an id before its tube
/// exists, which is how cycles are wired.
#[derive(Default)]
pub struct TubelineBuilder {
    slots: Vec<Option<Box<dyn Tube>>>,
}

impl TubelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tube and return its id.
    pub fn add(&mut self, tube: impl Tube + 'static) -> TubeId {
        self.add_boxed(Box::new(tube))
    }

    pub fn add_boxed(&mut self, tube: Box<dyn Tube>) -> TubeId {
        self.slots.push(Some(tube));
        TubeId(self.slots.len() - 1)
    }

    /// Allocate an id to be filled later with [`TubelineBuilder::set`].
    pub fn reserve(&mut self) -> TubeId {
        self.slots.push(None);
        TubeId(self.slots.len() - 1)
    }

    /// Fill a reserved slot.
    pub fn set(&mut self, id: TubeId, tube: impl Tube + 'static) -> Result<(), PipelineError> {
        match self.slots.get_mut(id.0) {
            Some(slot @ None) => {
                *slot = Some(Box::new(tube));
                Ok(())
            }
            Some(Some(_)) => Err(PipelineError::InvalidGraph(format!("tube {} is already set", id))),
            None => Err(PipelineError::InvalidGraph(format!("tube {} was never reserved", id))),
        }
    }

    /// Finish with `head` as the entry point.
    pub fn build(self, head: TubeId) -> Result<Tubeline, PipelineError> {
        let mut tubes = Vec::with_capacity(self.slots.len());
        for (index, slot) in self.slots.into_iter().enumerate() {
            match slot {
                Some(tube) => tubes.push(tube),
                None => {
                    return Err(PipelineError::InvalidGraph(format!(
                        "reserved tube #{} was never set",
                        index
                    )))
                }
            }
        }
        Tubeline::from_parts(tubes, head)
    }
}
