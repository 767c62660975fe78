use std::time::Duration;

use tokio::{
    sync::mpsc::UnboundedSender,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};

/// One cancellable timer whose firings are posted onto the engine queue.
///
/// Every arm bumps the generation and every firing carries the generation it was
/// armed with, so a firing that was already queued when the slot got cancelled or
/// re-armed is recognised as stale by [`TimerSlot::accept`].
#[derive(Debug, Default)]
pub struct TimerSlot {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    pub fn arm_once<E, F>(&mut self, delay: Duration, tx: &UnboundedSender<E>, make: F) -> u64
    where
        E: Send + 'static,
        F: FnOnce(u64) -> E + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        let tx = tx.clone();
        self.handle = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(make(generation));
        }));
        generation
    }

    /// Fires every `period`, first at `now + period`.
    pub fn arm_interval<E, F>(&mut self, period: Duration, tx: &UnboundedSender<E>, make: F) -> u64
    where
        E: Send + 'static,
        F: Fn(u64) -> E + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        let tx = tx.clone();
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(make(generation)).is_err() {
                    break;
                }
            }
        }));
        generation
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }

    /// True when a firing belongs to the currently armed timer.
    pub fn accept(&self, generation: u64) -> bool {
        self.handle.is_some() && self.generation == generation
    }

    /// Like [`TimerSlot::accept`] for one-shot timers; a live firing disarms the slot.
    pub fn accept_once(&mut self, generation: u64) -> bool {
        if !self.accept(generation) {
            return false;
        }
        self.handle = None;
        true
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/timer_tests.rs"]
mod tests;
