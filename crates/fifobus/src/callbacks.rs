use std::sync::{Arc, Mutex};

/// Holder for one caller-supplied handler.
///
/// Handlers are invoked from reader threads, so they are stored behind an
/// `Arc`: the invoking thread clones the handle and locks only the handler
/// itself while calling it. That lets `close()` wipe the slot without waiting
/// on a callback that is mid-flight (the callback finishes on its own clone),
/// and joining the reader before the wipe guarantees nothing fires after
/// close returns.
pub(crate) struct CallbackSlot<T: ?Sized> {
    inner: Mutex<Option<Arc<Mutex<Box<T>>>>>,
}

impl<T: ?Sized> CallbackSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub(crate) fn set(&self, cb: Box<T>) {
        *self.inner.lock().unwrap() = Some(Arc::new(Mutex::new(cb)));
    }

    pub(crate) fn clear(&self) {
        *self.inner.lock().unwrap() = None;
    }

    pub(crate) fn get(&self) -> Option<Arc<Mutex<Box<T>>>> {
        self.inner.lock().unwrap().clone()
    }
}
