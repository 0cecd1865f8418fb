//! Fiber: drives one invocation through a [`Tubeline`].
//!
//! A fiber interprets the [`NextAction`]s returned by tubes. `Invoke` pushes
//! the current tube onto a continuation stack and moves on, `Return` pops the
//! stack and calls `process_response`, `Throw` pops it calling
//! `process_exception`, and `Suspend` parks the fiber until a [`Resumer`]
//! supplies the packet to continue with. The invocation completes when the
//! stack is empty.
//!
//! The fiber owns its tubeline, so one tubeline can never be driven by two
//! invocations at once. Concurrency comes from giving each fiber its own copy
//! of the master tubeline.

use crate::error::PipelineError;
use crate::packet::Packet;
use crate::tube::{NextAction, SuspendHook, TubeId, Tubeline};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of [`Fiber::run`].
#[derive(Debug)]
pub enum FiberStatus {
    /// The continuation stack is empty. Holds the final packet or the error
    /// that unwound past the first tube.
    Completed(Result<Packet, PipelineError>),
    /// A tube suspended. Call [`Fiber::run`] again after resuming.
    Suspended,
}

#[derive(Default)]
struct ResumeSlot {
    suspended: bool,
    packet: Option<Packet>,
}

#[derive(Default)]
struct ResumeState {
    slot: Mutex<ResumeSlot>,
    cond: Condvar,
    notify: Notify,
}

/// Handle used to wake a suspended fiber, possibly from another thread.
#[derive(Clone)]
pub struct Resumer {
    fiber: u64,
    state: Arc<ResumeState>,
}

impl Resumer {
    /// Continue the fiber with `packet`, delivered to `process_response` of
    /// the tube that suspended.
    pub fn resume(&self, packet: Packet) -> Result<(), PipelineError> {
        let mut slot = self.state.slot.lock();
        if !slot.suspended || slot.packet.is_some() {
            return Err(PipelineError::IllegalState(format!(
                "fiber {} is not waiting to be resumed",
                self.fiber
            )));
        }
        slot.packet = Some(packet);
        drop(slot);

        trace!(fiber = self.fiber, "Resuming fiber");
        self.state.cond.notify_all();
        self.state.notify.notify_one();
        Ok(())
    }

    /// Id of the fiber this resumer wakes.
    pub fn fiber_id(&self) -> u64 {
        self.fiber
    }
}

impl std::fmt::Debug for Resumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resumer").field("fiber", &self.fiber).finish()
    }
}

enum Step {
    Done(Result<Packet, PipelineError>),
    Suspended(Option<SuspendHook>),
}

/// One logical invocation over a privately owned tubeline.
pub struct Fiber {
    id: u64,
    tubeline: Tubeline,
    conts: Vec<TubeId>,
    next: Option<TubeId>,
    packet: Option<Packet>,
    error: Option<PipelineError>,
    started: bool,
    resume: Arc<ResumeState>,
}

impl Fiber {
    pub fn new(tubeline: Tubeline) -> Self {
        Self {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            tubeline,
            conts: Vec::new(),
            next: None,
            packet: None,
            error: None,
            started: false,
            resume: Arc::new(ResumeState::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tubeline(&self) -> &Tubeline {
        &self.tubeline
    }

    /// Give the tubeline back, e.g. to return it to a pool.
    pub fn into_tubeline(self) -> Tubeline {
        self.tubeline
    }

    /// Tear down the owned tubeline.
    pub fn pre_destroy(&mut self) {
        self.tubeline.pre_destroy();
    }

    /// Whether an invocation is in progress.
    pub fn is_running(&self) -> bool {
        self.started
    }

    pub fn is_suspended(&self) -> bool {
        self.resume.slot.lock().suspended
    }

    /// Handle for resuming this fiber after a tube suspends it.
    pub fn resumer(&self) -> Resumer {
        Resumer {
            fiber: self.id,
            state: self.resume.clone(),
        }
    }

    /// Begin an invocation at the head of the tubeline.
    pub fn start(&mut self, packet: Packet) -> Result<(), PipelineError> {
        self.start_at(self.tubeline.head(), packet)
    }

    /// Begin an invocation at `tube`.
    pub fn start_at(&mut self, tube: TubeId, packet: Packet) -> Result<(), PipelineError> {
        if self.started {
            return Err(PipelineError::IllegalState(format!("fiber {} is already running", self.id)));
        }
        if self.tubeline.is_destroyed() {
            return Err(PipelineError::IllegalState(format!(
                "fiber {} tubeline has been destroyed",
                self.id
            )));
        }
        debug!(fiber = self.id, packet = packet.id(), "Starting fiber");
        self.started = true;
        self.conts.clear();
        self.error = None;
        self.next = Some(tube);
        self.packet = Some(packet);
        Ok(())
    }

    /// Execute as far as possible without blocking.
    pub fn run(&mut self) -> FiberStatus {
        if !self.started {
            return FiberStatus::Completed(Err(PipelineError::IllegalState(format!(
                "fiber {} has not been started",
                self.id
            ))));
        }

        loop {
            {
                let mut slot = self.resume.slot.lock();
                if slot.suspended {
                    match slot.packet.take() {
                        Some(packet) => {
                            slot.suspended = false;
                            self.packet = Some(packet);
                        }
                        None => return FiberStatus::Suspended,
                    }
                }
            }

            match self.execute() {
                Step::Done(result) => {
                    self.started = false;
                    debug!(fiber = self.id, ok = result.is_ok(), "Fiber completed");
                    return FiberStatus::Completed(result);
                }
                Step::Suspended(hook) => {
                    self.resume.slot.lock().suspended = true;
                    debug!(fiber = self.id, "Fiber suspended");
                    if let Some(hook) = hook {
                        hook(self.resumer());
                    }
                }
            }
        }
    }

    /// Run `packet` through the tubeline, blocking the calling thread while
    /// the fiber is suspended.
    pub fn run_sync(&mut self, packet: Packet) -> Result<Packet, PipelineError> {
        self.start(packet)?;
        loop {
            match self.run() {
                FiberStatus::Completed(result) => return result,
                FiberStatus::Suspended => {
                    let mut slot = self.resume.slot.lock();
                    while slot.packet.is_none() {
                        self.resume.cond.wait(&mut slot);
                    }
                }
            }
        }
    }

    /// Run `packet` through the tubeline, yielding to the runtime while the
    /// fiber is suspended.
    pub async fn run_async(&mut self, packet: Packet) -> Result<Packet, PipelineError> {
        self.start(packet)?;
        let state = self.resume.clone();
        loop {
            match self.run() {
                FiberStatus::Completed(result) => return result,
                FiberStatus::Suspended => state.notify.notified().await,
            }
        }
    }

    fn take_packet(&mut self) -> Result<Packet, PipelineError> {
        self.packet
            .take()
            .ok_or_else(|| PipelineError::IllegalState(format!("fiber {} has no packet", self.id)))
    }

    fn execute(&mut self) -> Step {
        loop {
            let (last, action) = if let Some(error) = self.error.take() {
                let Some(id) = self.conts.pop() else {
                    return Step::Done(Err(error));
                };
                match self.tubeline.tube_mut(id) {
                    Ok(tube) => (id, tube.process_exception(error)),
                    Err(e) => return Step::Done(Err(e)),
                }
            } else if let Some(next) = self.next.take() {
                let packet = match self.take_packet() {
                    Ok(p) => p,
                    Err(e) => return Step::Done(Err(e)),
                };
                match self.tubeline.tube_mut(next) {
                    Ok(tube) => (next, tube.process_request(packet)),
                    Err(e) => return Step::Done(Err(e)),
                }
            } else {
                let Some(id) = self.conts.pop() else {
                    return Step::Done(self.take_packet());
                };
                let packet = match self.take_packet() {
                    Ok(p) => p,
                    Err(e) => return Step::Done(Err(e)),
                };
                match self.tubeline.tube_mut(id) {
                    Ok(tube) => (id, tube.process_response(packet)),
                    Err(e) => return Step::Done(Err(e)),
                }
            };

            trace!(
                fiber = self.id,
                tube = self.tubeline.get(last).map(|t| t.name()).unwrap_or("?"),
                action = action.kind(),
                "Tube returned"
            );

            match action {
                NextAction::Invoke { next, packet } => {
                    self.conts.push(last);
                    self.next = Some(next);
                    self.packet = Some(packet);
                }
                NextAction::InvokeAndForget { next, packet } => {
                    self.next = Some(next);
                    self.packet = Some(packet);
                }
                NextAction::Return(packet) => {
                    self.packet = Some(packet);
                }
                NextAction::Suspend(hook) => {
                    self.conts.push(last);
                    return Step::Suspended(hook);
                }
                NextAction::Throw(error) => {
                    self.packet = None;
                    self.error = Some(error);
                }
            }
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("running", &self.started)
            .field("conts", &self.conts)
            .finish()
    }
}

/// Runs fibers on a tokio runtime.
#[derive(Clone, Debug)]
pub struct Engine {
    name: String,
    handle: Handle,
}

impl Engine {
    pub fn new(name: impl Into<String>, handle: Handle) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    /// Engine on the runtime the caller is running in.
    pub fn current(name: impl Into<String>) -> Result<Self, PipelineError> {
        let handle = Handle::try_current().map_err(|e| PipelineError::IllegalState(e.to_string()))?;
        Ok(Self::new(name, handle))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start `fiber` with `packet` in the background. The fiber is handed back
    /// with its result so its tubeline can be reused.
    pub fn submit(&self, mut fiber: Fiber, packet: Packet) -> JoinHandle<(Fiber, Result<Packet, PipelineError>)> {
        debug!(engine = %self.name, fiber = fiber.id(), "Submitting fiber");
        self.handle.spawn(async move {
            let result = fiber.run_async(packet).await;
            (fiber, result)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tube::{Tube, TubelineBuilder};
    use parking_lot::Mutex as PlMutex;

    type Log = Arc<PlMutex<Vec<String>>>;

    /// Forwards to `next` and records both directions.
    struct Filter {
        name: &'static str,
        next: TubeId,
        log: Log,
    }

    impl Tube for Filter {
        fn name(&self) -> &str {
            self.name
        }

        fn process_request(&mut self, packet: Packet) -> NextAction {
            self.log.lock().push(format!("{}:req", self.name));
            NextAction::invoke(self.next, packet)
        }

        fn process_response(&mut self, packet: Packet) -> NextAction {
            self.log.lock().push(format!("{}:resp", self.name));
            NextAction::Return(packet)
        }

        fn process_exception(&mut self, error: PipelineError) -> NextAction {
            self.log.lock().push(format!("{}:err", self.name));
            NextAction::Throw(error)
        }

        fn successors(&self) -> Vec<TubeId> {
            vec![self.next]
        }
    }

    /// Terminal tube answering with a response packet.
    struct Terminal {
        log: Log,
    }

    impl Tube for Terminal {
        fn name(&self) -> &str {
            "terminal"
        }

        fn process_request(&mut self, packet: Packet) -> NextAction {
            self.log.lock().push("terminal".to_string());
            NextAction::Return(packet.create_response(None))
        }
    }

    struct Failing;

    impl Tube for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn process_request(&mut self, _packet: Packet) -> NextAction {
            NextAction::Throw(PipelineError::IllegalState("boom".into()))
        }
    }

    /// Suspends on the way out, optionally resuming from a hook.
    struct Suspending {
        hook_resumes: bool,
    }

    impl Tube for Suspending {
        fn name(&self) -> &str {
            "suspending"
        }

        fn process_request(&mut self, packet: Packet) -> NextAction {
            if self.hook_resumes {
                NextAction::suspend_with(move |resumer| {
                    std::thread::spawn(move || {
                        let _ = resumer.resume(packet.create_response(None));
                    });
                })
            } else {
                NextAction::suspend()
            }
        }

        fn process_response(&mut self, mut packet: Packet) -> NextAction {
            packet.set_invocation_property("resumed", "yes");
            NextAction::Return(packet)
        }
    }

    fn chain(log: &Log) -> Tubeline {
        let mut b = TubelineBuilder::new();
        let t = b.add(Terminal { log: log.clone() });
        let inner = b.add(Filter {
            name: "inner",
            next: t,
            log: log.clone(),
        });
        let outer = b.add(Filter {
            name: "outer",
            next: inner,
            log: log.clone(),
        });
        b.build(outer).unwrap()
    }

    #[test]
    fn test_request_forward_response_reverse() {
        let log = Log::default();
        let mut fiber = Fiber::new(chain(&log));
        let request = Packet::empty();
        let request_id = request.id();

        let response = fiber.run_sync(request).unwrap();
        assert!(response.is_response_to(request_id));
        assert_eq!(
            *log.lock(),
            vec!["outer:req", "inner:req", "terminal", "inner:resp", "outer:resp"]
        );
        assert!(!fiber.is_running());
    }

    #[test]
    fn test_invoke_and_forget_skips_response() {
        struct Forwarder {
            next: TubeId,
            log: Log,
        }

        impl Tube for Forwarder {
            fn name(&self) -> &str {
                "forwarder"
            }

            fn process_request(&mut self, packet: Packet) -> NextAction {
                NextAction::invoke_and_forget(self.next, packet)
            }

            fn process_response(&mut self, packet: Packet) -> NextAction {
                self.log.lock().push("forwarder:resp".to_string());
                NextAction::Return(packet)
            }
        }

        let log = Log::default();
        let mut b = TubelineBuilder::new();
        let t = b.add(Terminal { log: log.clone() });
        let head = b.add(Forwarder {
            next: t,
            log: log.clone(),
        });
        let mut fiber = Fiber::new(b.build(head).unwrap());
        fiber.run_sync(Packet::empty()).unwrap();
        assert_eq!(*log.lock(), vec!["terminal"]);
    }

    #[test]
    fn test_throw_unwinds_through_process_exception() {
        let log = Log::default();
        let mut b = TubelineBuilder::new();
        let f = b.add(Failing);
        let head = b.add(Filter {
            name: "outer",
            next: f,
            log: log.clone(),
        });
        let mut fiber = Fiber::new(b.build(head).unwrap());

        let result = fiber.run_sync(Packet::empty());
        assert!(matches!(result, Err(PipelineError::IllegalState(_))));
        assert_eq!(*log.lock(), vec!["outer:req", "outer:err"]);
    }

    #[test]
    fn test_exception_can_be_recovered() {
        struct Recovering {
            next: TubeId,
        }

        impl Tube for Recovering {
            fn name(&self) -> &str {
                "recovering"
            }

            fn process_request(&mut self, packet: Packet) -> NextAction {
                NextAction::invoke(self.next, packet)
            }

            fn process_exception(&mut self, _error: PipelineError) -> NextAction {
                let mut packet = Packet::empty();
                packet.set_invocation_property("recovered", "true");
                NextAction::Return(packet)
            }
        }

        let mut b = TubelineBuilder::new();
        let f = b.add(Failing);
        let head = b.add(Recovering { next: f });
        let mut fiber = Fiber::new(b.build(head).unwrap());

        let response = fiber.run_sync(Packet::empty()).unwrap();
        assert_eq!(response.invocation_property("recovered"), Some("true"));
    }

    #[test]
    fn test_suspend_and_resume_manually() {
        let mut fiber = Fiber::new(Tubeline::single(Suspending { hook_resumes: false }));
        let request = Packet::empty();
        let request_id = request.id();
        fiber.start(request).unwrap();

        assert!(matches!(fiber.run(), FiberStatus::Suspended));
        assert!(fiber.is_suspended());
        assert!(matches!(fiber.run(), FiberStatus::Suspended));

        let resumer = fiber.resumer();
        let mut reply = Packet::empty();
        reply.set_invocation_property("answer", request_id.to_string());
        resumer.resume(reply).unwrap();
        assert!(resumer.resume(Packet::empty()).is_err());

        match fiber.run() {
            FiberStatus::Completed(Ok(packet)) => {
                assert_eq!(packet.invocation_property("resumed"), Some("yes"));
                assert_eq!(packet.invocation_property("answer"), Some(request_id.to_string().as_str()));
            }
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[test]
    fn test_resume_when_not_suspended() {
        let fiber = Fiber::new(Tubeline::single(Failing));
        assert!(matches!(
            fiber.resumer().resume(Packet::empty()),
            Err(PipelineError::IllegalState(_))
        ));
    }

    #[test]
    fn test_run_sync_waits_for_resume_from_other_thread() {
        let mut fiber = Fiber::new(Tubeline::single(Suspending { hook_resumes: true }));
        let response = fiber.run_sync(Packet::empty()).unwrap();
        assert_eq!(response.invocation_property("resumed"), Some("yes"));
    }

    #[test]
    fn test_cannot_start_twice() {
        let mut fiber = Fiber::new(Tubeline::single(Suspending { hook_resumes: false }));
        fiber.start(Packet::empty()).unwrap();
        assert!(fiber.start(Packet::empty()).is_err());
    }

    #[test]
    fn test_run_without_start() {
        let mut fiber = Fiber::new(Tubeline::single(Failing));
        assert!(matches!(
            fiber.run(),
            FiberStatus::Completed(Err(PipelineError::IllegalState(_)))
        ));
    }

    #[tokio::test]
    async fn test_engine_resumes_suspended_fiber() {
        let engine = Engine::current("test").unwrap();
        let fiber = Fiber::new(Tubeline::single(Suspending { hook_resumes: false }));
        let resumer = fiber.resumer();

        let handle = engine.submit(fiber, Packet::empty());

        // Retry until the fiber has parked.
        while resumer.resume(Packet::empty()).is_err() {
            tokio::task::yield_now().await;
        }

        let (fiber, result) = handle.await.unwrap();
        assert_eq!(result.unwrap().invocation_property("resumed"), Some("yes"));
        assert!(!fiber.is_running());
    }
}
