//! Leased container of pre-loaded model instances.

use std::{
    sync::{Condvar, Mutex},
    time::Duration,
};

use ml_core::Model;

/// Pool of model instances shared by the inference workers.
///
/// Every model is either inside the pool or leased to exactly one worker;
/// the sum of both is the initial size for the pool's whole lifetime.
/// Workers lease with a bounded wait and hold the instance until the
/// pipeline stops (lease-for-the-lifetime-of-the-worker), so the pool must
/// be sized at least as large as the worker count for full parallelism.
pub struct ModelPool {
    slots: Mutex<Vec<Box<dyn Model>>>,
    available: Condvar,
    initial_size: usize,
}

impl ModelPool {
    pub fn new(models: Vec<Box<dyn Model>>) -> Self {
        let initial_size = models.len();
        Self {
            slots: Mutex::new(models),
            available: Condvar::new(),
            initial_size,
        }
    }

    /// Wait up to `timeout` to lease a model. A zero timeout polls.
    pub fn lease(&self, timeout: Duration) -> Option<Box<dyn Model>> {
        let mut slots = self.slots.lock().unwrap();
        if slots.is_empty() && !timeout.is_zero() {
            let (guard, _timeout_result) = self
                .available
                .wait_timeout_while(slots, timeout, |slots| slots.is_empty())
                .unwrap();
            slots = guard;
        }
        slots.pop()
    }

    /// Return a leased model; never blocks.
    pub fn release(&self, model: Box<dyn Model>) {
        let mut slots = self.slots.lock().unwrap();
        debug_assert!(slots.len() < self.initial_size, "release without lease");
        slots.push(model);
        drop(slots);
        self.available.notify_one();
    }

    /// Models currently inside the pool.
    pub fn available_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    /// Models currently leased to workers.
    pub fn leased_count(&self) -> usize {
        self.initial_size - self.available_count()
    }

    pub fn initial_size(&self) -> usize {
        self.initial_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ml_core::{Model, ModelError};
    use std::path::Path;
    use video_ingest::Frame;

    struct NullModel;

    impl Model for NullModel {
        fn load(&mut self, _path: &Path) -> Result<(), ModelError> {
            Ok(())
        }
        fn run(&mut self, _frame: &mut Frame) -> Result<(), ModelError> {
            Ok(())
        }
        fn name(&self) -> &'static str {
            "NullModel"
        }
    }

    fn pool_of(n: usize) -> ModelPool {
        ModelPool::new((0..n).map(|_| Box::new(NullModel) as Box<dyn Model>).collect())
    }

    #[test]
    fn conservation_holds_across_lease_and_release() {
        let pool = pool_of(3);
        assert_eq!(pool.available_count() + pool.leased_count(), 3);

        let first = pool.lease(Duration::ZERO).unwrap();
        let second = pool.lease(Duration::ZERO).unwrap();
        assert_eq!(pool.available_count(), 1);
        assert_eq!(pool.leased_count(), 2);
        assert_eq!(pool.available_count() + pool.leased_count(), 3);

        pool.release(first);
        pool.release(second);
        assert_eq!(pool.available_count(), 3);
        assert_eq!(pool.leased_count(), 0);
    }

    #[test]
    fn lease_times_out_when_exhausted() {
        let pool = pool_of(1);
        let held = pool.lease(Duration::ZERO).unwrap();
        assert!(pool.lease(Duration::from_millis(20)).is_none());
        pool.release(held);
        assert!(pool.lease(Duration::ZERO).is_some());
    }

    #[test]
    fn release_wakes_a_waiting_leaser() {
        use std::sync::Arc;
        use std::thread;

        let pool = Arc::new(pool_of(1));
        let held = pool.lease(Duration::ZERO).unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.lease(Duration::from_secs(2)).is_some())
        };
        thread::sleep(Duration::from_millis(50));
        pool.release(held);
        assert!(waiter.join().unwrap());
    }
}
