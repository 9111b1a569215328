//! Interval reporter: a periodic one-line link status on the terminal.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracemux_frame::tpiu::{LED_DATA, LED_HEARTBEAT, LED_OVERFLOW, LED_TX};
use tracemux_frame::TpiuStats;

use crate::ring::BlockRing;

const CURSOR_PREV_LINE: &str = "\x1b[1A";
const CLEAR_LINE: &str = "\x1b[2K";

pub struct Monitor {
    pub interval_ms: u64,
    pub interval_bytes: Arc<AtomicU64>,
    /// Configured peak rate in bits/sec; 0 suppresses the utilisation figure.
    pub max_data_rate: u32,
    pub tpiu_stats: Option<Arc<TpiuStats>>,
    pub ring: Arc<BlockRing>,
    pub ending: Arc<AtomicBool>,
}

impl Monitor {
    /// Sleep/report until shutdown. Each cycle takes the byte counter and
    /// redraws a single status line in place.
    pub fn run(self) {
        let interval = Duration::from_millis(self.interval_ms);
        let mut first = true;
        while !self.ending.load(Ordering::Acquire) {
            std::thread::sleep(interval);

            let bytes = self.interval_bytes.swap(0, Ordering::AcqRel);
            let bits_per_sec = bytes * 8 * 1000 / self.interval_ms;
            let line = render(
                bits_per_sec,
                self.max_data_rate,
                self.tpiu_stats.as_deref(),
                self.ring.dropped_blocks(),
            );

            let mut stdout = std::io::stdout().lock();
            if first {
                first = false;
                let _ = writeln!(stdout, "{line}");
            } else {
                let _ = writeln!(stdout, "{CURSOR_PREV_LINE}{CLEAR_LINE}{line}");
            }
            let _ = stdout.flush();
        }
    }
}

fn render(bits_per_sec: u64, max_data_rate: u32, tpiu: Option<&TpiuStats>, dropped: u64) -> String {
    let mut line = format_rate(bits_per_sec);

    if max_data_rate > 100 {
        // Percentage as a division first to dodge overflow on fast links.
        let full = (bits_per_sec * 100 / u64::from(max_data_rate)).min(100);
        line.push_str(&format!(" ({full:3}% full)"));
    }

    if let Some(stats) = tpiu {
        let leds = stats.take_leds();
        line.push_str(&format!(
            " LEDS: {}{}{}{} Frames: {} Pending: {} Lost: {}",
            if leds & LED_DATA != 0 { 'd' } else { '-' },
            if leds & LED_TX != 0 { 't' } else { '-' },
            if leds & LED_OVERFLOW != 0 { 'O' } else { '-' },
            if leds & LED_HEARTBEAT != 0 { 'h' } else { '-' },
            stats.total_frames.load(Ordering::Relaxed),
            stats.pending.load(Ordering::Relaxed),
            stats.lost_frames.load(Ordering::Relaxed),
        ));
    }

    if dropped > 0 {
        line.push_str(&format!(" Dropped: {dropped}"));
    }

    line
}

fn format_rate(bits_per_sec: u64) -> String {
    if bits_per_sec >= 1_000_000 {
        format!(
            "{:4}.{} MBits/sec",
            bits_per_sec / 1_000_000,
            (bits_per_sec / 100_000) % 10
        )
    } else if bits_per_sec >= 1_000 {
        format!(
            "{:4}.{} KBits/sec",
            bits_per_sec / 1_000,
            (bits_per_sec / 100) % 10
        )
    } else {
        format!("{bits_per_sec:5}  Bits/sec")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_autoranges() {
        assert_eq!(format_rate(0), "    0  Bits/sec");
        assert_eq!(format_rate(999), "  999  Bits/sec");
        assert_eq!(format_rate(1_500), "   1.5 KBits/sec");
        assert_eq!(format_rate(999_900), " 999.9 KBits/sec");
        assert_eq!(format_rate(2_400_000), "   2.4 MBits/sec");
    }

    #[test]
    fn utilisation_is_clamped() {
        let line = render(2_000_000, 1_000_000, None, 0);
        assert!(line.contains("(100% full)"), "line was {line:?}");

        let line = render(500_000, 1_000_000, None, 0);
        assert!(line.contains("( 50% full)"), "line was {line:?}");
    }

    #[test]
    fn no_rate_no_percentage() {
        let line = render(500, 0, None, 0);
        assert!(!line.contains('%'));
    }

    #[test]
    fn tpiu_stats_are_appended() {
        let stats = TpiuStats::default();
        stats.total_frames.store(42, Ordering::Relaxed);
        stats.lost_frames.store(3, Ordering::Relaxed);
        stats.set_led(LED_DATA);
        stats.set_led(LED_HEARTBEAT);

        let line = render(0, 0, Some(&stats), 0);
        assert!(line.contains("LEDS: d--h"), "line was {line:?}");
        assert!(line.contains("Frames: 42"));
        assert!(line.contains("Lost: 3"));
        // Activity bits are cleared by the report.
        let line = render(0, 0, Some(&stats), 0);
        assert!(line.contains("LEDS: ----"), "line was {line:?}");
    }

    #[test]
    fn dropped_blocks_surface_in_the_report() {
        let line = render(0, 0, None, 7);
        assert!(line.ends_with("Dropped: 7"));
        let line = render(0, 0, None, 0);
        assert!(!line.contains("Dropped"));
    }
}
