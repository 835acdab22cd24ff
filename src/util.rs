//! Formatting and small string helpers shared across modules

/// Format a byte count using binary units.
pub fn format_byte_size(bytes: i64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

/// Format a second count as h/m/s.
pub fn format_seconds(total_seconds: i64) -> String {
    let total_seconds = total_seconds.max(0);
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Truncate a string to at most `n` bytes (digests are ASCII).
pub fn shorten(s: &str, n: usize) -> &str {
    if s.len() <= n { s } else { &s[..n] }
}

/// True when the text contains anything outside printable ASCII.
pub fn has_invalid_char(text: &str) -> bool {
    text.chars().any(|c| c < ' ' || c > '~')
}

/// Compare two version-ish tags segment by segment: numeric segments
/// compare numerically, everything else lexicographically. `1.10 > 1.9`,
/// `2.0 > 1.9.9`, `latest` and friends compare as plain strings.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    let split = |v: &str| -> Vec<String> {
        v.trim_start_matches(['v', 'V'])
            .split(['.', '-', '_'])
            .map(str::to_string)
            .collect()
    };

    let sa = split(a);
    let sb = split(b);
    for i in 0..sa.len().max(sb.len()) {
        let pa = sa.get(i).map(String::as_str).unwrap_or("");
        let pb = sb.get(i).map(String::as_str).unwrap_or("");
        let ord = match (pa.parse::<u64>(), pb.parse::<u64>()) {
            (Ok(na), Ok(nb)) => na.cmp(&nb),
            _ => pa.cmp(pb),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
