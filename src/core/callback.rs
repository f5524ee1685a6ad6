// src/core/callback.rs

//! Cross-thread callbacks.
//!
//! Any thread may `fire` a [`Callback`]; the call is queued on the owning
//! [`CallbackLoop`] and executed later on the reactor. Every callback
//! registered against one loop shares that loop's single queue, mutex and
//! wake-up primitive, so there is exactly one wake-up source per loop no
//! matter how many callback types exist.
//!
//! Dispatch runs one call per reactor pass. When more calls remain, the loop
//! yields back to the scheduler before taking the next one, so a burst of
//! fired calls cannot starve socket I/O.
//!
//! Payload release is handled by `Drop`: a call that is discarded (stopped
//! target, failed enqueue, coalesced away) drops its captured payload.

use crate::core::errors::CallbackError;
use crate::core::metrics;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Notify, broadcast};
use tracing::{debug, trace};

/// How repeated fires of one callback are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackMode {
    /// Every fire is kept and dispatched separately.
    Queued,
    /// Only the most recent undispatched argument is kept.
    Coalescing,
}

/// The result of a single dispatch step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing was queued.
    Empty,
    /// One call ran; `remaining` calls are still queued.
    Ran { remaining: usize },
}

/// A single unit of queued work. Dropping it without running releases the
/// payload it captured.
struct Call {
    owner: u64,
    run: Box<dyn FnOnce() + Send>,
}

struct LoopShared {
    queue: Mutex<VecDeque<Call>>,
    wake: Notify,
    next_id: AtomicU64,
}

/// The per-reactor dispatcher that owns the call queue.
#[derive(Clone)]
pub struct CallbackLoop {
    shared: Arc<LoopShared>,
}

impl Default for CallbackLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackLoop {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(LoopShared {
                queue: Mutex::new(VecDeque::new()),
                wake: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registers a new callback object against this loop.
    pub fn register<T, R, F>(&self, mode: CallbackMode, handler: F) -> Callback<T, R>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        Callback {
            inner: Arc::new(CallbackInner {
                id,
                mode,
                active: AtomicBool::new(true),
                handler: Box::new(handler),
                shared: self.shared.clone(),
                latest: Mutex::new(None),
            }),
        }
    }

    /// Pops and runs exactly one queued call.
    pub fn dispatch_once(&self) -> Dispatch {
        let call = self.shared.queue.lock().pop_front();
        let Some(call) = call else {
            return Dispatch::Empty;
        };
        trace!("dispatching call for callback {}", call.owner);
        (call.run)();
        metrics::CALLS_DISPATCHED_TOTAL.inc();
        Dispatch::Ran {
            remaining: self.queued(),
        }
    }

    /// The number of calls currently waiting for dispatch.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Drives dispatch on the current task until shutdown is signalled.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = self.shared.wake.notified() => {}
            }
            while let Dispatch::Ran { remaining } = self.dispatch_once() {
                if remaining == 0 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        }
        let discarded = self.discard_all();
        debug!("callback loop stopped, {} queued calls discarded", discarded);
    }

    /// Drops every queued call, releasing their payloads.
    pub fn discard_all(&self) -> usize {
        let calls = std::mem::take(&mut *self.shared.queue.lock());
        calls.len()
    }
}

/// Delivery of a result into another callback, erasing that callback's own
/// result type.
trait Deliver<R>: Send + Sync {
    fn deliver(&self, value: R) -> Result<(), CallbackError>;
}

struct Pending<T, R> {
    data: T,
    notify: Option<Arc<dyn Deliver<R>>>,
}

struct CallbackInner<T, R> {
    id: u64,
    mode: CallbackMode,
    active: AtomicBool,
    handler: Box<dyn Fn(T) -> R + Send + Sync>,
    shared: Arc<LoopShared>,
    latest: Mutex<Option<Pending<T, R>>>,
}

impl<T, R> CallbackInner<T, R> {
    fn invoke(&self, data: T, notify: Option<Arc<dyn Deliver<R>>>) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let result = (self.handler)(data);
        if let Some(target) = notify
            && let Err(e) = target.deliver(result)
        {
            debug!("callback {} result discarded: {}", self.id, e);
        }
    }
}

/// A handle to a registered callback object. Clones share the same object.
pub struct Callback<T, R = ()> {
    inner: Arc<CallbackInner<T, R>>,
}

impl<T, R> Clone for Callback<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R, X> Deliver<R> for Callback<R, X>
where
    R: Send + 'static,
    X: Send + 'static,
{
    fn deliver(&self, value: R) -> Result<(), CallbackError> {
        self.fire(value)
    }
}

impl<T, R> Callback<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Queues `data` for the handler on the reactor.
    pub fn fire(&self, data: T) -> Result<(), CallbackError> {
        self.submit(data, None)
    }

    /// Queues `data`, and forwards the handler's result to `notify`.
    pub fn fire_with_notify<X>(&self, data: T, notify: &Callback<R, X>) -> Result<(), CallbackError>
    where
        X: Send + 'static,
    {
        self.submit(data, Some(Arc::new(notify.clone())))
    }

    /// Marks the callback inactive and discards its queued calls.
    pub fn stop(&self) {
        self.inner.active.store(false, Ordering::Release);
        let discarded: Vec<Call> = {
            let mut queue = self.inner.shared.queue.lock();
            let mut kept = VecDeque::with_capacity(queue.len());
            let mut dropped = Vec::new();
            for call in queue.drain(..) {
                if call.owner == self.inner.id {
                    dropped.push(call);
                } else {
                    kept.push_back(call);
                }
            }
            *queue = kept;
            dropped
        };
        let latest = self.inner.latest.lock().take();
        debug!(
            "callback {} stopped, {} queued calls discarded",
            self.inner.id,
            discarded.len() + usize::from(latest.is_some())
        );
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> CallbackMode {
        self.inner.mode
    }

    fn submit(&self, data: T, notify: Option<Arc<dyn Deliver<R>>>) -> Result<(), CallbackError> {
        if !self.is_active() {
            return Err(CallbackError::Stopped);
        }

        match self.inner.mode {
            CallbackMode::Queued => {
                let inner = self.inner.clone();
                self.enqueue(Call {
                    owner: self.inner.id,
                    run: Box::new(move || inner.invoke(data, notify)),
                })?;
            }
            CallbackMode::Coalescing => {
                let previous = self.inner.latest.lock().replace(Pending { data, notify });
                if previous.is_some() {
                    // A dispatch is already queued and will pick up the new value.
                    return Ok(());
                }
                let inner = self.inner.clone();
                let enqueued = self.enqueue(Call {
                    owner: self.inner.id,
                    run: Box::new(move || {
                        let pending = inner.latest.lock().take();
                        if let Some(pending) = pending {
                            inner.invoke(pending.data, pending.notify);
                        }
                    }),
                });
                if let Err(e) = enqueued {
                    let _orphan = self.inner.latest.lock().take();
                    return Err(e);
                }
            }
        }

        metrics::CALLS_FIRED_TOTAL.inc();
        self.inner.shared.wake.notify_one();
        Ok(())
    }

    fn enqueue(&self, call: Call) -> Result<(), CallbackError> {
        let rejected = {
            let mut queue = self.inner.shared.queue.lock();
            match queue.try_reserve(1) {
                Ok(()) => {
                    queue.push_back(call);
                    None
                }
                Err(_) => Some(call),
            }
        };
        match rejected {
            Some(_call) => Err(CallbackError::Alloc),
            None => Ok(()),
        }
    }
}
