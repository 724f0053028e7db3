//! Small helpers shared across the controller, director, and audit
//! binaries.

use chrono::{Local, Utc};

/// Nanoseconds since the Unix epoch, used for coarse trace timestamps where
/// a full `DateTime` isn't needed.
pub fn current_timestamp_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Seconds east of UTC for the local timezone at the moment of the call,
/// as recorded in the session descriptor's `timezone` field.
pub fn local_utc_offset_seconds() -> i32 {
    Local::now().offset().local_minus_utc()
}

/// Generates a session name `YYYY-MM-DD_HH-MM-SS[_LABEL]` from the
/// controller's current wall clock.
pub fn session_name(label: Option<&str>) -> String {
    let base = Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    match label {
        Some(l) if !l.is_empty() => format!("{base}_{l}"),
        _ => base,
    }
}

/// `new,<label>,<uuid>` requires the label be alphanumeric or `-_`. The
/// empty string is valid: `--label` is optional, and an omitted label
/// reaches here as `""`.
pub fn is_valid_label(label: &str) -> bool {
    label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
