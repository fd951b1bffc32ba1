//! Binding of OS threads (and the coroutines they run) to mutators.
//!
//! A thread calls [`ThreadHolder::register`] once before touching the
//! managed heap. The holder lives in thread-local storage; when the thread
//! exits, or calls [`ThreadHolder::unregister`], the mutator's SATB node is
//! retired, the mutator is moved into a saferegion and it leaves the
//! registry.
//!
//! Coroutines scheduled on the thread share its mutator. The holder only
//! records which ones are bound, so the runtime can tell whose roots the
//! mutator is currently carrying.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::RuntimeContext;
use crate::log::fatal;
use crate::mutator::Mutator;

/// Identifier the embedder assigns to a coroutine.
pub type CoroutineId = u64;

thread_local! {
    static CURRENT: RefCell<Registration> = const { RefCell::new(Registration(None)) };
}

/// Detaches the holder when the thread's TLS is torn down.
struct Registration(Option<Arc<ThreadHolder>>);

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(holder) = self.0.take() {
            holder.detach();
        }
    }
}

/// Registration of one thread with a runtime.
pub struct ThreadHolder {
    mutator: Arc<Mutator>,
    coroutines: Mutex<Vec<CoroutineId>>,
}

impl ThreadHolder {
    /// Register the calling thread with `context`.
    ///
    /// Registering twice with the same context returns the existing
    /// holder. A thread can only belong to one runtime at a time.
    pub fn register(context: &Arc<RuntimeContext>) -> Arc<Self> {
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            if let Some(holder) = &current.0 {
                if !Arc::ptr_eq(holder.mutator.context(), context) {
                    fatal!("thread is already registered with another runtime");
                }
                return Arc::clone(holder);
            }
            let holder = Arc::new(Self {
                mutator: Mutator::new_mutator(context),
                coroutines: Mutex::new(Vec::new()),
            });
            current.0 = Some(Arc::clone(&holder));
            holder
        })
    }

    /// Deregister the calling thread. Returns `false` if it was not
    /// registered.
    pub fn unregister() -> bool {
        let holder = CURRENT.with(|current| current.borrow_mut().0.take());
        holder.is_some_and(|holder| {
            holder.detach();
            true
        })
    }

    /// The calling thread's holder, if registered.
    #[must_use]
    pub fn current() -> Option<Arc<Self>> {
        CURRENT
            .try_with(|current| current.borrow().0.clone())
            .ok()
            .flatten()
    }

    /// The calling thread's mutator, if registered.
    #[must_use]
    pub fn current_mutator() -> Option<Arc<Mutator>> {
        Self::current().map(|holder| Arc::clone(&holder.mutator))
    }

    /// The mutator shared by everything bound to this holder.
    #[must_use]
    pub const fn mutator(&self) -> &Arc<Mutator> {
        &self.mutator
    }

    /// Bind a coroutine to this thread's mutator.
    ///
    /// Returns `false` if it was already bound.
    pub fn bind_coroutine(&self, id: CoroutineId) -> bool {
        let mut coroutines = self.coroutines.lock();
        if coroutines.contains(&id) {
            return false;
        }
        coroutines.push(id);
        true
    }

    /// Unbind a coroutine. Returns `false` if it was not bound.
    pub fn unbind_coroutine(&self, id: CoroutineId) -> bool {
        let mut coroutines = self.coroutines.lock();
        let before = coroutines.len();
        coroutines.retain(|&c| c != id);
        before != coroutines.len()
    }

    /// Coroutines currently bound, in binding order.
    #[must_use]
    pub fn coroutines(&self) -> Vec<CoroutineId> {
        self.coroutines.lock().clone()
    }

    fn detach(&self) {
        let mutator = &self.mutator;
        // The node is flushed while running: inside a saferegion the
        // collector may retire it concurrently.
        mutator.leave_saferegion();
        mutator.flush_satb_buffer();
        mutator.set_raw_object(None);
        mutator.enter_saferegion(true);
        mutator.wait_for_observers();
        self.coroutines.lock().clear();
        mutator.context().mutators().unregister(mutator);
    }
}

impl fmt::Debug for ThreadHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHolder")
            .field("mutator", &self.mutator.id())
            .field("coroutines", &self.coroutines.lock().len())
            .finish()
    }
}
