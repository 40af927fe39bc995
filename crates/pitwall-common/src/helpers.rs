//! Common helper functions for Pitwall.

use crate::protocol::{BROADCAST_TARGET, NO_TARGET};

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

/// Team addresses are compared verbatim, but surrounding whitespace from
/// command lines or config files is never meaningful.
pub fn normalize_team(raw: &str) -> String {
    raw.trim().to_string()
}

/// Whether `team` collides with one of the selector keywords.
pub fn is_reserved_team(team: &str) -> bool {
    team.eq_ignore_ascii_case(BROADCAST_TARGET) || team.eq_ignore_ascii_case(NO_TARGET)
}

/// Splits a comma or semicolon separated list, dropping empty items.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split([',', ';'])
        .map(normalize_team)
        .filter(|item| !item.is_empty())
        .collect()
}
