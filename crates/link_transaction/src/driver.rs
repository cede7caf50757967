//! The scheduling backend shared by verification and execution.
//!
//! Work inside a phase is fanned out over a bounded worker pool; the pool
//! size adapts to the machine. In debug mode everything runs synchronously on
//! the calling thread, which makes failures reproducible.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use rayon::prelude::*;

use crate::config::TransactionConfig;

/// Drives parallel phases and carries the cancellation flag that a signal
/// handler flips.
pub struct TransactionDriver {
    serial: bool,
    cancel_flag: Arc<AtomicBool>,
}

impl TransactionDriver {
    /// A driver configured from the transaction configuration.
    pub fn new(config: &TransactionConfig) -> Self {
        Self {
            serial: config.debug,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The flag observed at phase boundaries. Handed to the signal handler
    /// registered for the duration of `execute`.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel_flag.clone()
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    /// Runs `work` over every item, collecting the non-`None` results. Order
    /// of results follows item order. In-flight work is never interrupted;
    /// cancellation is observed by the caller between phases.
    pub fn run_each<T, R>(
        &self,
        items: &mut [T],
        work: impl Fn(&mut T) -> Option<R> + Send + Sync,
    ) -> Vec<R>
    where
        T: Send,
        R: Send,
    {
        if self.serial {
            items.iter_mut().filter_map(work).collect()
        } else {
            items.par_iter_mut().filter_map(work).collect()
        }
    }
}

/// Registers a SIGINT handler for the lifetime of the guard; receipt flips
/// the driver's cancellation flag instead of killing the process. The
/// handler is released again when the guard drops, per the usual
/// acquire/release discipline around `execute`.
pub struct SignalGuard {
    signal_id: Option<signal_hook::SigId>,
}

impl SignalGuard {
    /// Installs the handler. Failure to install is logged, not fatal; the
    /// transaction then simply cannot be interrupted gracefully.
    pub fn install(flag: Arc<AtomicBool>) -> Self {
        match signal_hook::flag::register(signal_hook::consts::SIGINT, flag) {
            Ok(signal_id) => Self {
                signal_id: Some(signal_id),
            },
            Err(e) => {
                tracing::warn!("unable to install interrupt handler: {e}");
                Self { signal_id: None }
            }
        }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        if let Some(signal_id) = self.signal_id.take() {
            signal_hook::low_level::unregister(signal_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_config;

    #[test]
    fn test_run_each_collects_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let driver = TransactionDriver::new(&test_config(dir.path()));
        let mut items: Vec<u32> = (0..64).collect();
        let results = driver.run_each(&mut items, |n| (*n % 2 == 0).then_some(*n * 10));
        assert_eq!(results.len(), 32);
        assert_eq!(results[0], 0);
        assert_eq!(results[31], 620);
    }

    #[test]
    fn test_debug_mode_runs_serially() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.debug = true;
        let driver = TransactionDriver::new(&config);
        let mut items = vec![1u32, 2, 3];
        let results = driver.run_each(&mut items, |n| Some(*n));
        assert_eq!(results, vec![1, 2, 3]);
    }
}
