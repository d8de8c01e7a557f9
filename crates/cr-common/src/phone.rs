//! Phone number normalization.
//!
//! Numbers arrive loosely formatted from operator input. Normalization
//! produces the gateway's expected international format; records whose
//! numbers cannot be normalized are never eligible for dispatch and never
//! participate in dedup comparisons.

/// Normalize a raw phone number to international format.
///
/// - strips spaces, dashes, dots and parentheses
/// - keeps an existing `+` prefix, rewrites a leading `00` to `+`
/// - otherwise prepends `default_prefix` (e.g. `+39`)
///
/// Returns `None` for blank input, non-digit garbage, or implausibly short
/// numbers.
pub fn normalize(raw: &str, default_prefix: &str) -> Option<String> {
    let stripped: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')' | '\t'))
        .collect();
    let stripped = stripped.trim();

    if stripped.is_empty() {
        return None;
    }

    let (prefix, digits) = if let Some(rest) = stripped.strip_prefix('+') {
        ("+", rest)
    } else if let Some(rest) = stripped.strip_prefix("00") {
        ("+", rest)
    } else {
        (default_prefix, stripped)
    };

    if digits.len() < 6 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    Some(format!("{}{}", prefix, digits))
}
