use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Upper bound of the percentage range reserved for hashing.
///
/// Hashing reports into `[0, HASH_PHASE_END]`, chunk upload into
/// `[HASH_PHASE_END, 100]`, so the displayed value does not jump back when
/// the first phase ends.
pub const HASH_PHASE_END: f64 = 10.0;

/// Maps a hashing ratio (`0.0..=1.0`) into the hashing range.
pub fn hashing_percent(ratio: f64) -> f64 {
    ratio.clamp(0.0, 1.0) * HASH_PHASE_END
}

/// Maps acknowledged chunks into the upload range.
pub fn upload_percent(uploaded: u64, chunk_count: u64) -> f64 {
    if chunk_count == 0 {
        return 100.0;
    }
    let ratio = (uploaded as f64 / chunk_count as f64).min(1.0);
    HASH_PHASE_END + ratio * (100.0 - HASH_PHASE_END)
}

/// Formats a byte rate for status messages, e.g. `"1.5 MiB/s"`.
pub fn format_rate(bytes_per_second: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KiB/s", "MiB/s", "GiB/s"];
    let mut value = bytes_per_second.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Formats a remaining-time estimate, e.g. `"42s"` or `"1h05m"`.
pub fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m{:02}s", secs / 60, secs % 60),
        _ => format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60),
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

/// Transfer rate over a sliding time window.
#[derive(Debug)]
pub struct SpeedCalculator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    max_samples: usize,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 100)
    }
}

impl SpeedCalculator {
    /// Creates a calculator keeping at most `max_samples` within `window`.
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
            max_samples: max_samples.max(2),
        }
    }

    /// Records `bytes` transferred now.
    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    /// Records `bytes` transferred at `at`.
    pub fn record_at(&mut self, at: Instant, bytes: u64) {
        self.samples.push_back((at, bytes));
        while let Some(&(first, _)) = self.samples.front() {
            if at.duration_since(first) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Average bytes per second across the window; 0.0 with fewer than
    /// two samples.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(&(first, _)), Some(&(last, _))) = (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let elapsed = last.duration_since(first);
        if self.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }
        // The first sample opens the window; its bytes predate it.
        let bytes: u64 = self.samples.iter().skip(1).map(|(_, b)| b).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to move `remaining_bytes` at the current rate.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let rate = self.bytes_per_second();
        if rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / rate))
    }
}
