use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};
use fw_update::RestartScheduler;

/// One-shot restart request raised by a successful finalize.
pub struct RestartSignal {
    delay_ms: Signal<CriticalSectionRawMutex, u32>,
}

impl RestartSignal {
    pub const fn new() -> Self {
        Self {
            delay_ms: Signal::new(),
        }
    }

    pub fn request(&self, delay_ms: u32) {
        self.delay_ms.signal(delay_ms);
    }

    pub fn is_requested(&self) -> bool {
        self.delay_ms.signaled()
    }

    /// Waits for a request and returns its delay.
    pub async fn wait(&self) -> u32 {
        self.delay_ms.wait().await
    }
}

impl Default for RestartSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl RestartScheduler for &RestartSignal {
    fn schedule_restart(&mut self, delay_ms: u32) {
        self.request(delay_ms);
    }
}

/// Waits for a restart request, lets the delay pass so the triggering
/// write can be acknowledged, then calls `reset`.
pub async fn restart_task<R: FnOnce()>(signal: &RestartSignal, reset: R) {
    let delay_ms = signal.wait().await;
    info!("restarting in {} ms", delay_ms);
    Timer::after(Duration::from_millis(u64::from(delay_ms))).await;
    reset();
}
