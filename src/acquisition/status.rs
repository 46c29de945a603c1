use crate::error::{Error, Result, TriggerFault};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

const NO_FAULT: u8 = 0;
const FIRST_TRIGGER_NOT_FOUND: u8 = 1;
const JITTER_EXCEEDED: u8 = 2;

/// Flags and counters written by the audio callback and polled by the
/// control thread after every cycle. Errors never cross the callback
/// boundary any other way.
#[derive(Debug, Default)]
pub struct AcquisitionStatus {
    trigger_fault: AtomicU8,
    write_failed: AtomicBool,
    queue_overrun: AtomicBool,
    finished: AtomicBool,
    completed_epochs: AtomicU64,
    pool_misses: AtomicU64,
    malformed_blocks: AtomicU64,
    trigger_tests_passed: AtomicU64,
    trigger_tests_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub trigger_fault: Option<TriggerFault>,
    pub write_failed: bool,
    pub queue_overrun: bool,
    pub finished: bool,
    pub completed_epochs: u64,
    pub pool_misses: u64,
    pub malformed_blocks: u64,
    pub trigger_tests_passed: u64,
    pub trigger_tests_failed: u64,
}

impl StatusSnapshot {
    /// First sticky fault, if any, as an error for the control thread.
    pub fn check(&self) -> Result<()> {
        if let Some(fault) = self.trigger_fault {
            return Err(Error::Trigger(fault));
        }
        if self.write_failed {
            return Err(Error::WriteFailed);
        }
        if self.queue_overrun {
            return Err(Error::QueueOverrun);
        }
        Ok(())
    }
}

impl AcquisitionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the first fault raised.
    pub(crate) fn raise_trigger_fault(&self, fault: TriggerFault) {
        let code = match fault {
            TriggerFault::FirstTriggerNotFound => FIRST_TRIGGER_NOT_FOUND,
            TriggerFault::JitterExceeded => JITTER_EXCEEDED,
        };
        let _ = self.trigger_fault.compare_exchange(
            NO_FAULT,
            code,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn raise_write_failed(&self) {
        self.write_failed.store(true, Ordering::Release);
    }

    pub(crate) fn raise_queue_overrun(&self) {
        self.queue_overrun.store(true, Ordering::Release);
    }

    pub(crate) fn set_finished(&self, finished: bool) {
        self.finished.store(finished, Ordering::Release);
    }

    pub(crate) fn record_completed(&self) {
        self.completed_epochs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pool_miss(&self) {
        self.pool_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed_block(&self) {
        self.malformed_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_trigger_test(&self, passed: bool) {
        if passed {
            self.trigger_tests_passed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.trigger_tests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn trigger_fault(&self) -> Option<TriggerFault> {
        match self.trigger_fault.load(Ordering::Acquire) {
            FIRST_TRIGGER_NOT_FOUND => Some(TriggerFault::FirstTriggerNotFound),
            JITTER_EXCEEDED => Some(TriggerFault::JitterExceeded),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            trigger_fault: self.trigger_fault(),
            write_failed: self.write_failed.load(Ordering::Acquire),
            queue_overrun: self.queue_overrun.load(Ordering::Acquire),
            finished: self.finished.load(Ordering::Acquire),
            completed_epochs: self.completed_epochs.load(Ordering::Relaxed),
            pool_misses: self.pool_misses.load(Ordering::Relaxed),
            malformed_blocks: self.malformed_blocks.load(Ordering::Relaxed),
            trigger_tests_passed: self.trigger_tests_passed.load(Ordering::Relaxed),
            trigger_tests_failed: self.trigger_tests_failed.load(Ordering::Relaxed),
        }
    }

    /// Clears faults and counters. Only called while the callback is idle.
    pub(crate) fn reset(&self) {
        self.trigger_fault.store(NO_FAULT, Ordering::Release);
        self.write_failed.store(false, Ordering::Release);
        self.queue_overrun.store(false, Ordering::Release);
        self.finished.store(false, Ordering::Release);
        self.completed_epochs.store(0, Ordering::Relaxed);
        self.pool_misses.store(0, Ordering::Relaxed);
        self.malformed_blocks.store(0, Ordering::Relaxed);
        self.trigger_tests_passed.store(0, Ordering::Relaxed);
        self.trigger_tests_failed.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_trigger_fault_is_sticky() {
        let status = AcquisitionStatus::new();
        assert!(status.snapshot().check().is_ok());
        status.raise_trigger_fault(TriggerFault::JitterExceeded);
        status.raise_trigger_fault(TriggerFault::FirstTriggerNotFound);
        assert_eq!(status.trigger_fault(), Some(TriggerFault::JitterExceeded));
        assert!(matches!(
            status.snapshot().check(),
            Err(Error::Trigger(TriggerFault::JitterExceeded))
        ));
        status.reset();
        assert_eq!(status.snapshot(), StatusSnapshot::default());
    }

    #[test]
    fn counters_accumulate() {
        let status = AcquisitionStatus::new();
        status.record_trigger_test(true);
        status.record_trigger_test(true);
        status.record_trigger_test(false);
        status.record_completed();
        let snapshot = status.snapshot();
        assert_eq!(snapshot.trigger_tests_passed, 2);
        assert_eq!(snapshot.trigger_tests_failed, 1);
        assert_eq!(snapshot.completed_epochs, 1);
    }
}
