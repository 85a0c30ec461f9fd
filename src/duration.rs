//! Compact "uptime style" rendering of durations.

use std::time::Duration;

/// Marker used for durations shorter than one second.
pub const NOW: &str = "now";

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Render a duration as days, hours, minutes and seconds.
///
/// Zero components are left out and seconds are only shown below one hour,
/// so 5 s is `"5s"`, 3670 s is `"1h 1m"` and 2 days 3 hours is `"2d 3h"`.
/// Anything under one second renders as [`NOW`].
pub fn day_string(duration: Duration) -> String {
    let total = duration.as_secs();
    if total == 0 {
        return NOW.to_string();
    }

    let days = total / DAY;
    let hours = (total % DAY) / HOUR;
    let minutes = (total % HOUR) / MINUTE;
    let seconds = if total < HOUR { total % MINUTE } else { 0 };

    let parts: Vec<String> = [(days, 'd'), (hours, 'h'), (minutes, 'm'), (seconds, 's')]
        .into_iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{value}{unit}"))
        .collect();

    parts.join(" ")
}
