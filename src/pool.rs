//! Pool of private tubeline copies.
//!
//! The master tubeline is built once and never driven directly. Each
//! invocation takes a copy from the pool (making a new one from the master if
//! none is idle) and gives it back when done, so copies are reused across
//! invocations without ever being used by two at once.

use crate::config::PoolConfig;
use crate::error::PipelineError;
use crate::fiber::Fiber;
use crate::packet::Packet;
use crate::tube::Tubeline;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, trace};

pub struct TubelinePool {
    master: Mutex<Tubeline>,
    idle: Mutex<Vec<Tubeline>>,
    max_idle: usize,
    created: AtomicUsize,
    shut_down: AtomicBool,
}

impl TubelinePool {
    pub fn new(master: Tubeline, config: &PoolConfig) -> Self {
        Self {
            master: Mutex::new(master),
            idle: Mutex::new(Vec::new()),
            max_idle: config.max_idle,
            created: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// A tubeline for exclusive use by one invocation.
    pub fn take(&self) -> Result<Tubeline, PipelineError> {
        if self.is_shut_down() {
            return Err(PipelineError::IllegalState("tubeline pool has been shut down".into()));
        }
        if let Some(tubeline) = self.idle.lock().pop() {
            trace!("Reusing pooled tubeline");
            return Ok(tubeline);
        }
        let copy = {
            let master = self.master.lock();
            if master.is_destroyed() {
                return Err(PipelineError::IllegalState("tubeline pool has been shut down".into()));
            }
            master.copy()?
        };
        let created = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(created = created, "Cloned master tubeline for pool");
        Ok(copy)
    }

    /// Give a tubeline back. Destroyed tubelines and tubelines beyond the idle
    /// limit are dropped, and so is everything returned after shutdown.
    pub fn recycle(&self, mut tubeline: Tubeline) {
        if tubeline.is_destroyed() {
            return;
        }
        let mut idle = self.idle.lock();
        // Checked under the idle lock so shutdown cannot drain in between
        if self.is_shut_down() {
            drop(idle);
            trace!("Destroying tubeline returned after shutdown");
            tubeline.pre_destroy();
            return;
        }
        if idle.len() < self.max_idle {
            idle.push(tubeline);
        } else {
            drop(idle);
            tubeline.pre_destroy();
        }
    }

    /// Run `packet` on a pooled tubeline, blocking while it is suspended.
    pub fn process(&self, packet: Packet) -> Result<Packet, PipelineError> {
        let mut fiber = Fiber::new(self.take()?);
        let result = fiber.run_sync(packet);
        self.recycle(fiber.into_tubeline());
        result
    }

    /// Run `packet` on a pooled tubeline, yielding while it is suspended.
    pub async fn process_async(&self, packet: Packet) -> Result<Packet, PipelineError> {
        let mut fiber = Fiber::new(self.take()?);
        let result = fiber.run_async(packet).await;
        self.recycle(fiber.into_tubeline());
        result
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Number of copies made from the master so far.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Destroy every idle copy and the master. Copies still in use are
    /// destroyed when they are recycled.
    pub fn shutdown(&self) {
        let idle: Vec<Tubeline> = {
            let mut idle = self.idle.lock();
            self.shut_down.store(true, Ordering::Release);
            std::mem::take(&mut *idle)
        };
        debug!(idle = idle.len(), "Shutting down tubeline pool");
        for mut tubeline in idle {
            tubeline.pre_destroy();
        }
        self.master.lock().pre_destroy();
    }
}

impl std::fmt::Debug for TubelinePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TubelinePool")
            .field("idle", &self.idle_count())
            .field("max_idle", &self.max_idle)
            .field("created", &self.created_count())
            .finish()
    }
}
