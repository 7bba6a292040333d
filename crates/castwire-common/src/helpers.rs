//! Common helper functions for Castwire.

/// Reads a boolean flag from the environment (`1`, `true`, `yes`, `on`).
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Microseconds since the Unix epoch.
pub fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Prefixes every line of `text`, used for wire traces (`> ` outbound, `< ` inbound).
pub fn prefix_lines(text: &str, prefix: &str) -> String {
    text.lines()
        .map(|line| format!("{prefix}{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Shortens an SDP blob for log output.
pub fn sdp_preview(sdp: &str) -> String {
    const PREVIEW_CHARS: usize = 10;
    let head: String = sdp.chars().take(PREVIEW_CHARS).collect();
    if sdp.chars().count() > PREVIEW_CHARS {
        format!("{head} ...")
    } else {
        head
    }
}
