//! Logging utilities for sanitizing network-supplied strings so logs stay
//! single-line. Control messages arrive over MQTT and may contain anything.

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Truncates long strings with an ellipsis to cap log noise.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 200;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::escape_log;

    #[test]
    fn escapes_newlines() {
        let esc = escape_log("7+01\n+03\r\tEnd");
        assert_eq!(esc, "7+01\\n+03\\r\\tEnd");
    }

    #[test]
    fn truncates_long_payloads() {
        let long = "x".repeat(400);
        let esc = escape_log(&long);
        assert!(esc.ends_with('…'));
        assert!(esc.chars().count() <= 201);
    }
}
