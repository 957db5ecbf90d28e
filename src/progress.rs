//! Classification of startosinstall output lines.
//!
//! Only a handful of prefixes mean anything; every other line is passed on
//! as free-form status text.

/// Boilerplate printed when `--agreetolicense` is used.
const LICENSE_PREFIXES: &[&str] = &["By using the agreetolicense option", "If you do not agree,"];

const PREPARING: &str = "Preparing ";
const PREPARING_TO_RUN: &str = "Preparing to run ";

/// Percentage reported when a progress line cannot be parsed.
pub const UNKNOWN_PERCENT: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Status(String),
    /// 0-100, or `UNKNOWN_PERCENT`.
    Progress(i32),
    Ignored,
}

/// Parse the percentage out of a line such as `"Preparing 42.0."`.
pub fn parse_percent(line: &str) -> i32 {
    let Some(rest) = line.get(PREPARING.len()..) else {
        return UNKNOWN_PERCENT;
    };
    let number = rest.trim_end().trim_end_matches('.').trim();
    match number.parse::<f64>() {
        Ok(value) if value.is_finite() => value.trunc() as i32,
        _ => UNKNOWN_PERCENT,
    }
}

pub fn classify_line(line: &str) -> ProgressEvent {
    let msg = line.trim_end_matches(['\r', '\n']);

    if LICENSE_PREFIXES.iter().any(|prefix| msg.starts_with(prefix)) {
        return ProgressEvent::Ignored;
    }
    if msg.starts_with(PREPARING) && !msg.starts_with(PREPARING_TO_RUN) {
        return ProgressEvent::Progress(parse_percent(msg));
    }

    let trimmed = msg.trim();
    if trimmed.is_empty() {
        ProgressEvent::Ignored
    } else {
        ProgressEvent::Status(trimmed.to_string())
    }
}
