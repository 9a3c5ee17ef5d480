//! Snapshot-name template expansion
//!
//! Expands `%Y %m %d %H %M %S` against a wall-clock instant; everything else
//! passes through verbatim. Only these six tokens are recognized, so the
//! expansion is done by hand rather than handed to a full strftime.

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Default template for a policy with an empty pattern.
pub fn default_pattern(policy_name: &str) -> String {
    format!("autosnap-{}-%Y-%m-%d-%H%M%S", policy_name)
}

/// Expand `pattern` against `t`. Deterministic: equal inputs yield equal
/// output.
pub fn expand(pattern: &str, t: DateTime<Utc>) -> String {
    let mut out = String::with_capacity(pattern.len() + 16);
    let mut chars = pattern.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.peek() {
            Some('Y') => {
                chars.next();
                out.push_str(&format!("{:04}", t.year()));
            }
            Some('m') => {
                chars.next();
                out.push_str(&format!("{:02}", t.month()));
            }
            Some('d') => {
                chars.next();
                out.push_str(&format!("{:02}", t.day()));
            }
            Some('H') => {
                chars.next();
                out.push_str(&format!("{:02}", t.hour()));
            }
            Some('M') => {
                chars.next();
                out.push_str(&format!("{:02}", t.minute()));
            }
            Some('S') => {
                chars.next();
                out.push_str(&format!("{:02}", t.second()));
            }
            _ => out.push('%'),
        }
    }

    out
}

/// The literal prefix of a pattern, up to its first token. Snapshots whose
/// short name starts with this prefix are owned by the policy.
pub fn pattern_prefix(pattern: &str) -> &str {
    match pattern.find('%') {
        Some(pos) => &pattern[..pos],
        None => pattern,
    }
}
