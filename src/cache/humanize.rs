//! Presentation helpers for sizes and durations.

const SIZE_UNITS: [&str; 9] = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// Format a byte count with binary (1024) units, e.g. `1536` -> `1.5 KB`.
///
/// Plain bytes are shown without decimals.
pub fn human_readable_size(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{} {}", bytes, SIZE_UNITS[0]);
    }

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, SIZE_UNITS[unit])
}

/// Format whole seconds as days, hours, minutes and seconds.
///
/// Units with a zero value are left out, e.g. `3605` -> `1 hour 5 seconds`.
pub fn human_readable_duration(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = seconds % 86_400 / 3_600;
    let minutes = seconds % 3_600 / 60;
    let secs = seconds % 60;

    let parts: Vec<String> = [(days, "day"), (hours, "hour"), (minutes, "minute"), (secs, "second")]
        .into_iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| {
            let plural = if value == 1 { "" } else { "s" };
            format!("{value} {unit}{plural}")
        })
        .collect();

    if parts.is_empty() {
        "0 seconds".to_string()
    } else {
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(human_readable_size(0), "0 B");
        assert_eq!(human_readable_size(512), "512 B");
        assert_eq!(human_readable_size(1023), "1023 B");
        assert_eq!(human_readable_size(1024), "1.0 KB");
        assert_eq!(human_readable_size(1536), "1.5 KB");
        assert_eq!(human_readable_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(human_readable_size(3 * 1024u64.pow(4)), "3.0 TB");
        assert_eq!(human_readable_size(u64::MAX), "16.0 EB");
    }

    #[test]
    fn durations() {
        assert_eq!(human_readable_duration(0), "0 seconds");
        assert_eq!(human_readable_duration(1), "1 second");
        assert_eq!(human_readable_duration(59), "59 seconds");
        assert_eq!(human_readable_duration(60), "1 minute");
        assert_eq!(human_readable_duration(3_605), "1 hour 5 seconds");
        assert_eq!(human_readable_duration(90_061), "1 day 1 hour 1 minute 1 second");
        assert_eq!(human_readable_duration(2 * 86_400 + 2 * 3_600), "2 days 2 hours");
    }
}
