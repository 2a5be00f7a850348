//! §4.7's bounded FIFO of spare handler instances: borrow on dispatch,
//! return or destroy on completion, fall back to a freshly built instance
//! when the pool is empty.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Lets [`InstancePool::release`] invoke a handler's `destroy` hook when
/// an instance is evicted instead of returned (§4.7: "otherwise call the
/// handler's destroy hook").
pub(crate) trait DestroyInstance {
    fn destroy_instance(&mut self);
}

pub(crate) struct InstancePool<T> {
    factory: Box<dyn Fn() -> T + Send + Sync>,
    spares: Mutex<VecDeque<T>>,
    max: usize,
}

impl<T> InstancePool<T> {
    pub(crate) fn new<F>(max: usize, prewarm: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let mut spares = VecDeque::with_capacity(max);
        for _ in 0..prewarm.min(max) {
            spares.push_back(factory());
        }
        InstancePool {
            factory: Box::new(factory),
            spares: Mutex::new(spares),
            max,
        }
    }

    /// Borrows a spare instance if one is available; otherwise builds a
    /// fresh one from the registered factory (§4.7: "fall back to the
    /// prototype").
    pub(crate) fn acquire(&self) -> T {
        if let Some(instance) = self.spares.lock().unwrap().pop_front() {
            instance
        } else {
            (self.factory)()
        }
    }

    /// Returns `instance` to the pool if there is room; otherwise its
    /// destroy hook runs before it is dropped.
    pub(crate) fn release(&self, mut instance: T)
    where
        T: DestroyInstance,
    {
        let mut spares = self.spares.lock().unwrap();
        if spares.len() < self.max {
            spares.push_back(instance);
        } else {
            drop(spares);
            instance.destroy_instance();
        }
    }

    #[cfg(test)]
    pub(crate) fn spare_count(&self) -> usize {
        self.spares.lock().unwrap().len()
    }
}
