//! Execution contexts and their run loops.
//!
//! Handles are confined to the context that opened them. By default every
//! thread has its own context; a tokio task (or any code that hops between
//! threads) can create an `ExecutionContext` and `enter()` it before touching
//! its handles.
//!
//! Each context owns a FIFO run loop. Notification deliveries and
//! auto-refreshes scheduled for a context only run when that context drains
//! its loop, either synchronously with `run_pending()` or asynchronously with
//! `run_until(..)`.

use super::handle::HandleInner;
use crate::core::ContextId;
use crate::notify::hub::{ChangeNotification, Subscription};
use log::debug;
use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ENTERED: RefCell<Vec<ExecutionContext>> = const { RefCell::new(Vec::new()) };
    static THREAD_DEFAULT: ExecutionContext = ExecutionContext::new();
}

/// Work scheduled onto a context's run loop.
pub(crate) enum Task {
    Deliver {
        subscription: Arc<Subscription>,
        notification: Arc<ChangeNotification>,
    },
    AutoRefresh {
        handle: Weak<HandleInner>,
    },
}

impl Task {
    fn run(self) {
        match self {
            Task::Deliver {
                subscription,
                notification,
            } => subscription.deliver(&notification),
            Task::AutoRefresh { handle } => {
                if let Some(handle) = handle.upgrade() {
                    handle.auto_refresh_tick();
                }
            }
        }
    }
}

struct RunLoop {
    id: ContextId,
    sender: UnboundedSender<Task>,
    receiver: AsyncMutex<UnboundedReceiver<Task>>,
    pending: Arc<AtomicUsize>,
}

#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<RunLoop>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(RunLoop {
                id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::SeqCst)),
                sender,
                receiver: AsyncMutex::new(receiver),
                pending: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Innermost entered context of this thread, or the thread's own context.
    pub fn current() -> ExecutionContext {
        ENTERED
            .with(|stack| stack.borrow().last().cloned())
            .unwrap_or_else(|| THREAD_DEFAULT.with(Clone::clone))
    }

    pub(crate) fn current_id() -> ContextId {
        ENTERED
            .with(|stack| stack.borrow().last().map(ExecutionContext::id))
            .unwrap_or_else(|| THREAD_DEFAULT.with(ExecutionContext::id))
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// Makes this the current context of the calling thread until the guard
    /// is dropped.
    pub fn enter(&self) -> ContextGuard {
        ENTERED.with(|stack| stack.borrow_mut().push(self.clone()));
        ContextGuard {
            _not_send: PhantomData,
        }
    }

    /// Number of tasks queued and not yet run.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Runs every task that is queued right now, in FIFO order.
    ///
    /// Tasks queued while draining run too. Returns 0 without doing anything
    /// if the loop is already being drained, which includes calls made from
    /// inside a notification callback.
    pub fn run_pending(&self) -> usize {
        let Ok(mut receiver) = self.inner.receiver.try_lock() else {
            return 0;
        };
        let _entered = self.enter();
        let mut ran = 0;
        while let Ok(task) = receiver.try_recv() {
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
            task.run();
            ran += 1;
        }
        ran
    }

    /// Runs tasks as they arrive until `stop` completes.
    pub async fn run_until<F: Future>(&self, stop: F) -> F::Output {
        tokio::pin!(stop);
        let mut receiver = self.inner.receiver.lock().await;
        loop {
            tokio::select! {
                biased;
                output = &mut stop => return output,
                task = receiver.recv() => {
                    let Some(task) = task else {
                        return stop.await;
                    };
                    self.inner.pending.fetch_sub(1, Ordering::SeqCst);
                    let _entered = self.enter();
                    task.run();
                }
            }
        }
    }

    pub(crate) fn sender(&self) -> ContextSender {
        ContextSender {
            id: self.inner.id,
            sender: self.inner.sender.clone(),
            pending: Arc::clone(&self.inner.pending),
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .field("pending", &self.pending())
            .finish()
    }
}

/// Restores the previously current context on drop.
pub struct ContextGuard {
    _not_send: PhantomData<Rc<()>>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        ENTERED.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Enqueue side of a run loop.
///
/// Holds no reference to the loop itself, so handles and subscriptions never
/// keep a context alive.
#[derive(Clone)]
pub(crate) struct ContextSender {
    id: ContextId,
    sender: UnboundedSender<Task>,
    pending: Arc<AtomicUsize>,
}

impl ContextSender {
    pub(crate) fn id(&self) -> ContextId {
        self.id
    }

    pub(crate) fn send(&self, task: Task) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(task).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            debug!("context {} no longer exists; dropping scheduled task", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_thread_has_its_own_context() {
        let here = ExecutionContext::current().id();
        assert_eq!(ExecutionContext::current().id(), here);

        let there = std::thread::spawn(|| ExecutionContext::current().id())
            .join()
            .unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_enter_nests_and_restores() {
        let outer = ExecutionContext::current().id();
        let first = ExecutionContext::new();
        let second = ExecutionContext::new();
        {
            let _a = first.enter();
            assert_eq!(ExecutionContext::current_id(), first.id());
            {
                let _b = second.enter();
                assert_eq!(ExecutionContext::current_id(), second.id());
            }
            assert_eq!(ExecutionContext::current_id(), first.id());
        }
        assert_eq!(ExecutionContext::current_id(), outer);
    }

    #[test]
    fn test_send_to_dropped_context_is_ignored() {
        let context = ExecutionContext::new();
        let sender = context.sender();
        drop(context);
        sender.send(Task::AutoRefresh { handle: Weak::new() });
        assert_eq!(sender.pending.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_run_pending_drains_queue() {
        let context = ExecutionContext::new();
        let sender = context.sender();
        sender.send(Task::AutoRefresh { handle: Weak::new() });
        sender.send(Task::AutoRefresh { handle: Weak::new() });
        assert_eq!(context.pending(), 2);
        assert_eq!(context.run_pending(), 2);
        assert_eq!(context.pending(), 0);
        assert_eq!(context.run_pending(), 0);
    }
}
