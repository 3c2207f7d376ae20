use std::{future::Future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

#[derive(Default)]
struct TimerSlot {
    // Bumped on every start/stop so a sleeper that already woke up can tell
    // it has been superseded.
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// A debounced one-shot timer.
///
/// Every call to [`ResettableTimer::start`] cancels the pending fire (if any)
/// and arms the timer again for the full duration. [`ResettableTimer::stop`]
/// cancels without re-arming. The callback runs at most once per `start`.
pub struct ResettableTimer {
    duration: Duration,
    slot: Arc<Mutex<TimerSlot>>,
}

impl ResettableTimer {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            slot: Arc::new(Mutex::new(TimerSlot::default())),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Arms the timer. `on_fire` is polled only once the duration elapses
    /// without an intervening `start` or `stop`.
    pub fn start<F>(&self, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
        slot.generation += 1;

        let generation = slot.generation;
        let shared = self.slot.clone();
        let duration = self.duration;
        slot.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            {
                let mut slot = shared.lock();
                if slot.generation != generation {
                    return;
                }
                // Detach instead of aborting: the callback below may stop
                // this very timer.
                slot.handle = None;
            }
            on_fire.await;
        }));
    }

    pub fn stop(&self) {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot.lock().handle.is_some()
    }
}

impl Drop for ResettableTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.slot.lock().handle.take() {
            handle.abort();
        }
    }
}
