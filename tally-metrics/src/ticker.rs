use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Fires at a fixed period on the wall clock.
///
/// With `sync` enabled, ticks fall on multiples of the period since the epoch plus the offset, so
/// all threads with the same period tick together. Otherwise the first tick is one period after
/// creation.
#[derive(Debug)]
pub struct Ticker {
    period: u64,
    next: u64,
}

impl Ticker {
    /// Creates a ticker. The period is at least one millisecond.
    pub fn new(period: Duration, offset: Duration, sync: bool) -> Self {
        let period = (period.as_millis() as u64).max(1);
        let offset = offset.as_millis() as u64 % period;
        let now = now_ms();

        let next = if sync {
            (now / period + 1) * period + offset
        } else {
            now + period + offset
        };

        Self { period, next }
    }

    /// Blocks until the next tick and returns its timestamp in milliseconds since the epoch.
    ///
    /// Returns `None` as soon as `shutdown` receives a message or is disconnected, also when the
    /// next tick is already due. Ticks missed while the caller was busy are skipped.
    pub fn wait(&mut self, shutdown: &Receiver<()>) -> Option<u64> {
        match shutdown.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return None,
            Err(TryRecvError::Empty) => {}
        }

        loop {
            let now = now_ms();
            if now >= self.next {
                break;
            }

            match shutdown.recv_timeout(Duration::from_millis(self.next - now)) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return None,
            }
        }

        let tick = self.next;
        self.next += self.period;

        let now = now_ms();
        if now >= self.next {
            let missed = (now - self.next) / self.period + 1;
            tally_log::warn!(missed, "tick overran its period, skipping ticks");
            self.next += missed * self.period;
        }

        Some(tick)
    }
}
