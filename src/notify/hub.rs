//! Per-file registry of change subscriptions.
//!
//! A commit never runs callbacks itself. It asks the hub to schedule one
//! delivery per live subscription onto the subscription's context; the
//! callback runs whenever that context drains its run loop.

use crate::connection::context::{ContextSender, Task};
use crate::core::{HandleId, Version};
use log::{debug, warn};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub type ChangeCallback = Box<dyn FnMut(&ChangeNotification) + Send + 'static>;

thread_local! {
    /// Tokens whose callbacks are running on this thread, innermost last.
    static DELIVERING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// A handle of this process committed.
    DidChange,
    /// A newer version written by another process was imported.
    ExternalChange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub kind: NotificationKind,
    pub path: PathBuf,
    pub version: Version,
    /// Handle that committed, for local commits.
    pub committer: Option<HandleId>,
}

pub(crate) struct Subscription {
    token: u64,
    handle: HandleId,
    active: AtomicBool,
    callback: Mutex<ChangeCallback>,
    sender: ContextSender,
}

impl Subscription {
    pub(crate) fn deliver(&self, notification: &ChangeNotification) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        let mut callback = self.callback.lock();
        // Removal may have completed while this thread waited for the lock.
        if !self.active.load(Ordering::SeqCst) {
            return;
        }

        DELIVERING.with(|stack| stack.borrow_mut().push(self.token));
        let _restore = DeliveringGuard;
        (*callback)(notification);
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        let delivering_here = DELIVERING.with(|stack| stack.borrow().contains(&self.token));
        if !delivering_here {
            // Blocks until an in-flight delivery on another thread returns.
            drop(self.callback.lock());
        }
    }
}

struct DeliveringGuard;

impl Drop for DeliveringGuard {
    fn drop(&mut self) {
        DELIVERING.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

pub struct NotificationHub {
    path: PathBuf,
    next_token: AtomicU64,
    subscriptions: Mutex<BTreeMap<u64, Arc<Subscription>>>,
}

impl NotificationHub {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            next_token: AtomicU64::new(1),
            subscriptions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        handle: HandleId,
        sender: ContextSender,
        callback: ChangeCallback,
    ) -> NotificationToken {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let context = sender.id();
        let subscription = Arc::new(Subscription {
            token,
            handle,
            active: AtomicBool::new(true),
            callback: Mutex::new(callback),
            sender,
        });
        self.subscriptions.lock().insert(token, subscription);
        debug!("registered listener {} for {} on {}", token, handle, context);

        NotificationToken {
            id: token,
            handle,
            hub: Arc::downgrade(self),
        }
    }

    /// Returns whether the token was still registered.
    ///
    /// Once this returns the callback will not start again, and any delivery
    /// of it running on another thread has finished.
    pub fn unregister(&self, token: u64) -> bool {
        let removed = self.subscriptions.lock().remove(&token);
        match removed {
            Some(subscription) => {
                subscription.deactivate();
                debug!("removed listener {} from {}", token, self.path.display());
                true
            }
            None => false,
        }
    }

    /// Removes every subscription of a released handle.
    pub(crate) fn unregister_handle(&self, handle: HandleId) -> usize {
        let removed: Vec<Arc<Subscription>> = {
            let mut subscriptions = self.subscriptions.lock();
            let tokens: Vec<u64> = subscriptions
                .values()
                .filter(|subscription| subscription.handle == handle)
                .map(|subscription| subscription.token)
                .collect();
            tokens
                .into_iter()
                .filter_map(|token| subscriptions.remove(&token))
                .collect()
        };
        for subscription in &removed {
            subscription.deactivate();
        }
        removed.len()
    }

    /// Queues one delivery per subscription, in token order.
    pub(crate) fn schedule(&self, notification: ChangeNotification) -> usize {
        let targets: Vec<Arc<Subscription>> =
            self.subscriptions.lock().values().cloned().collect();
        if targets.is_empty() {
            return 0;
        }

        let notification = Arc::new(notification);
        for subscription in &targets {
            subscription.sender.send(Task::Deliver {
                subscription: Arc::clone(subscription),
                notification: Arc::clone(&notification),
            });
        }
        debug!(
            "scheduled {} deliveries of {:?} {} for {}",
            targets.len(),
            notification.kind,
            notification.version,
            self.path.display()
        );
        targets.len()
    }

    pub fn listener_count(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

/// Association of a change callback with a handle.
///
/// Dropping the token does not unregister the callback; call
/// `Database::remove_listener` or `unregister` for that.
pub struct NotificationToken {
    id: u64,
    handle: HandleId,
    hub: Weak<NotificationHub>,
}

impl NotificationToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    /// Unregisters from any thread. Returns false if the token was already
    /// removed, or its handle released.
    pub fn unregister(&self) -> bool {
        match self.hub.upgrade() {
            Some(hub) => hub.unregister(self.id),
            None => {
                warn!("listener {} outlived its file", self.id);
                false
            }
        }
    }
}

impl fmt::Debug for NotificationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationToken")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::context::ExecutionContext;
    use std::sync::Barrier;
    use std::time::Duration;

    fn notification(version: u64) -> ChangeNotification {
        ChangeNotification {
            kind: NotificationKind::DidChange,
            path: PathBuf::from("hub.vault"),
            version: Version(version),
            committer: None,
        }
    }

    #[test]
    fn test_deliveries_run_on_context_in_order() {
        let hub = Arc::new(NotificationHub::new("hub.vault"));
        let context = ExecutionContext::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        hub.register(
            HandleId(1),
            context.sender(),
            Box::new(move |n: &ChangeNotification| sink.lock().push(n.version)),
        );

        hub.schedule(notification(1));
        hub.schedule(notification(2));
        assert!(seen.lock().is_empty());

        context.run_pending();
        assert_eq!(*seen.lock(), vec![Version(1), Version(2)]);
    }

    #[test]
    fn test_unregistered_token_is_not_delivered() {
        let hub = Arc::new(NotificationHub::new("hub.vault"));
        let context = ExecutionContext::new();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let token = hub.register(
            HandleId(1),
            context.sender(),
            Box::new(move |_: &ChangeNotification| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        hub.schedule(notification(1));
        assert!(token.unregister());
        assert!(!token.unregister());
        context.run_pending();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unregister_waits_for_inflight_delivery() {
        let hub = Arc::new(NotificationHub::new("hub.vault"));
        let context = ExecutionContext::new();
        let started = Arc::new(Barrier::new(2));
        let finished = Arc::new(AtomicBool::new(false));

        let token = {
            let started = Arc::clone(&started);
            let finished = Arc::clone(&finished);
            hub.register(
                HandleId(1),
                context.sender(),
                Box::new(move |_: &ChangeNotification| {
                    started.wait();
                    std::thread::sleep(Duration::from_millis(50));
                    finished.store(true, Ordering::SeqCst);
                }),
            )
        };
        hub.schedule(notification(1));

        let runner = {
            let context = context.clone();
            std::thread::spawn(move || context.run_pending())
        };
        started.wait();
        assert!(token.unregister());
        assert!(finished.load(Ordering::SeqCst));
        runner.join().unwrap();
    }

    #[test]
    fn test_callback_can_unregister_itself() {
        let hub = Arc::new(NotificationHub::new("hub.vault"));
        let context = ExecutionContext::new();
        let slot: Arc<Mutex<Option<NotificationToken>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicU64::new(0));

        let token = {
            let slot = Arc::clone(&slot);
            let calls = Arc::clone(&calls);
            hub.register(
                HandleId(1),
                context.sender(),
                Box::new(move |_: &ChangeNotification| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if let Some(token) = slot.lock().take() {
                        token.unregister();
                    }
                }),
            )
        };
        *slot.lock() = Some(token);

        hub.schedule(notification(1));
        hub.schedule(notification(2));
        context.run_pending();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn test_unregister_handle() {
        let hub = Arc::new(NotificationHub::new("hub.vault"));
        let context = ExecutionContext::new();
        hub.register(HandleId(1), context.sender(), Box::new(|_: &ChangeNotification| {}));
        hub.register(HandleId(1), context.sender(), Box::new(|_: &ChangeNotification| {}));
        hub.register(HandleId(2), context.sender(), Box::new(|_: &ChangeNotification| {}));

        assert_eq!(hub.unregister_handle(HandleId(1)), 2);
        assert_eq!(hub.listener_count(), 1);
    }
}
