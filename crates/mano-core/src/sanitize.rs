//! Sanitization of user-derived strings before they reach a log sink.

/// Maximum length a sanitized string keeps; anything longer is truncated with
/// an ellipsis marker so a hostile input cannot flood the logs.
const MAX_LOG_FIELD_LEN: usize = 256;

const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '$', '`', '<', '>', '(', ')', '{', '}', '[', ']', '\'', '"', '\\', '*', '?',
    '!', '~', '#',
];

/// Strip control characters and shell metacharacters from a string that came
/// from outside the system. The result is safe to interpolate into log lines.
pub fn sanitize_for_log(input: &str) -> String {
    let mut out: String = input
        .chars()
        .filter(|c| !c.is_control() && !SHELL_METACHARACTERS.contains(c))
        .collect();
    if out.len() > MAX_LOG_FIELD_LEN {
        out.truncate(MAX_LOG_FIELD_LEN);
        out.push_str("...");
    }
    out
}

/// True when the string contains nothing that sanitization would remove.
/// Validated executor arguments must satisfy this byte-identically.
pub fn is_log_safe(input: &str) -> bool {
    sanitize_for_log(input) == input
}
