//! Small value types shared across the engine: transfer-rate accounting and
//! the string parsers used by the settings layer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sliding-window byte rate counter. One instance per connection, plus the
/// process-global pair in [`NetStats`].
#[derive(Debug)]
pub struct RateCalc {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    in_window: u64,
    total: u64,
}

impl RateCalc {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            in_window: 0,
            total: 0,
        }
    }

    pub fn add(&mut self, bytes: u64) {
        self.add_at(Instant::now(), bytes);
    }

    fn add_at(&mut self, now: Instant, bytes: u64) {
        self.prune(now);
        self.samples.push_back((now, bytes));
        self.in_window += bytes;
        self.total += bytes;
    }

    /// Current rate in bytes per second, averaged over the window.
    pub fn rate(&mut self) -> u64 {
        self.rate_at(Instant::now())
    }

    fn rate_at(&mut self, now: Instant) -> u64 {
        self.prune(now);
        let secs = self.window.as_secs().max(1);
        self.in_window / secs
    }

    /// Total bytes ever accounted.
    pub fn total(&self) -> u64 {
        self.total
    }

    fn prune(&mut self, now: Instant) {
        while let Some((t, bytes)) = self.samples.front().copied() {
            if now.duration_since(t) <= self.window {
                break;
            }
            self.in_window -= bytes;
            self.samples.pop_front();
        }
    }
}

impl Default for RateCalc {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

/// Process-global network counters, updated on every successful read/write.
#[derive(Debug, Default)]
pub struct NetStats {
    rx: AtomicU64,
    tx: AtomicU64,
}

impl NetStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_rx(&self, bytes: u64) {
        self.rx.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_tx(&self, bytes: u64) {
        self.tx.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn rx(&self) -> u64 {
        self.rx.load(Ordering::Relaxed)
    }

    pub fn tx(&self) -> u64 {
        self.tx.load(Ordering::Relaxed)
    }
}

/// Parses a boolean setting value. Accepts `1/t/y/true/yes/on` and
/// `0/f/n/false/no/off`, case-insensitive.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "y" | "true" | "yes" | "on" => Some(true),
        "0" | "f" | "n" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parses an interval into seconds. A bare number is seconds; otherwise a
/// sequence of `<num><unit>` groups with units `s`, `m`, `h`, `d` ("1h30m").
pub fn parse_interval(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse().ok();
    }
    let mut total: u64 = 0;
    let mut num: Option<u64> = None;
    for c in s.chars() {
        match c {
            '0'..='9' => {
                let d = c as u64 - '0' as u64;
                num = Some(num.unwrap_or(0).checked_mul(10)?.checked_add(d)?);
            }
            's' | 'm' | 'h' | 'd' => {
                let n = num.take()?;
                let mult = match c {
                    's' => 1,
                    'm' => 60,
                    'h' => 3600,
                    _ => 86400,
                };
                total = total.checked_add(n.checked_mul(mult)?)?;
            }
            c if c.is_whitespace() => {}
            _ => return None,
        }
    }
    // A trailing bare number ("1h30") is taken as seconds.
    if let Some(n) = num {
        total = total.checked_add(n)?;
    }
    Some(total)
}

/// Formats a byte count for log messages ("1.4 MiB").
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_window_prunes() {
        let start = Instant::now();
        let mut rc = RateCalc::new(Duration::from_secs(10));
        rc.add_at(start, 1000);
        rc.add_at(start + Duration::from_secs(5), 500);
        assert_eq!(rc.rate_at(start + Duration::from_secs(5)), 150);
        // First sample falls out of the window.
        assert_eq!(rc.rate_at(start + Duration::from_secs(11)), 50);
        assert_eq!(rc.total(), 1500);
    }

    #[test]
    fn net_stats_accumulate() {
        let stats = NetStats::new();
        stats.add_rx(10);
        stats.add_rx(5);
        stats.add_tx(7);
        assert_eq!(stats.rx(), 15);
        assert_eq!(stats.tx(), 7);
    }

    #[test]
    fn bool_values() {
        for v in ["1", "t", "y", "true", "YES", "On"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["0", "f", "n", "FALSE", "no", "off"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn intervals() {
        assert_eq!(parse_interval("600"), Some(600));
        assert_eq!(parse_interval("10m"), Some(600));
        assert_eq!(parse_interval("1h30m"), Some(5400));
        assert_eq!(parse_interval("1d"), Some(86400));
        assert_eq!(parse_interval("1h30"), Some(3630));
        assert_eq!(parse_interval("0"), Some(0));
        assert_eq!(parse_interval(""), None);
        assert_eq!(parse_interval("m"), None);
        assert_eq!(parse_interval("12x"), None);
    }

    #[test]
    fn sizes() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KiB");
        assert_eq!(format_size(3 << 20), "3.0 MiB");
    }
}
