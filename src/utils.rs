use crate::{RenderError, Result};
use std::time::Duration;
use url::Url;

/// Longest prefix of `input` holding at most `max_chars` characters.
pub fn truncate_chars(input: &str, max_chars: usize) -> &str {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => &input[..idx],
        None => input,
    }
}

/// Parse `url`, requiring it to be absolute.
pub fn validate_url(url: &str) -> Result<Url> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(RenderError::InvalidInput("URL is empty".to_string()));
    }
    Ok(Url::parse(trimmed)?)
}

/// Length of `content` in UTF-16 code units, the unit a browser's
/// `string.length` reports.
pub fn utf16_len(content: &str) -> usize {
    content.encode_utf16().count()
}

/// UTF-16 length of `content`, or `None` once it exceeds `limit`.
pub fn utf16_len_within(content: &str, limit: usize) -> Option<usize> {
    // UTF-8 never takes fewer bytes than UTF-16 takes code units.
    if content.len() <= limit {
        return Some(utf16_len(content));
    }
    let count = utf16_len(content);
    (count <= limit).then_some(count)
}

pub fn sanitize_filename(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '&' | '=' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// File name for a rendered URL, e.g. `example.com_path.png`.
pub fn output_filename(url: &str) -> String {
    let stripped = url
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    format!("{}.png", sanitize_filename(stripped))
}

/// Human-readable render time: `840ms`, `2.35s`, `1m 05s`.
pub fn format_duration(duration: Duration) -> String {
    match duration.as_millis() {
        ms if ms < 1_000 => format!("{ms}ms"),
        ms if ms < 60_000 => format!("{:.2}s", duration.as_secs_f64()),
        _ => {
            let secs = duration.as_secs();
            format!("{}m {:02}s", secs / 60, secs % 60)
        }
    }
}

/// Human-readable image size in binary units.
pub fn format_bytes(bytes: usize) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = KIB * KIB;

    let size = bytes as f64;
    if size < KIB {
        format!("{bytes} B")
    } else if size < MIB {
        format!("{:.1} KiB", size / KIB)
    } else {
        format!("{:.1} MiB", size / MIB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 5), "hello");
        assert_eq!(truncate_chars("hello", 2), "he");
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com").is_ok());
        assert!(validate_url("http://example.com/path?q=1").is_ok());
        assert!(validate_url("file:///tmp/page.html").is_ok());
        assert!(validate_url("invalid-url").is_err());
        assert!(validate_url("/relative/path").is_err());
        assert!(matches!(validate_url("  "), Err(RenderError::InvalidInput(_))));
    }

    #[test]
    fn test_utf16_len_within() {
        assert_eq!(utf16_len_within("abc", 3), Some(3));
        assert_eq!(utf16_len_within("abcd", 3), None);
        // Four bytes, two code units.
        assert_eq!(utf16_len_within("éé", 3), Some(2));
        // One character outside the BMP is a surrogate pair.
        assert_eq!(utf16_len("😀"), 2);
        assert_eq!(utf16_len_within("a😀", 2), None);
        assert_eq!(utf16_len_within("a😀", 3), Some(3));
    }

    #[test]
    fn test_output_filename() {
        assert_eq!(output_filename("https://example.com/a/b"), "example.com_a_b.png");
        assert_eq!(output_filename("http://example.com/?q=1&r=2"), "example.com__q_1_r_2.png");
    }

    #[test]
    fn test_format_render_durations() {
        assert_eq!(format_duration(Duration::ZERO), "0ms");
        assert_eq!(format_duration(Duration::from_millis(840)), "840ms");
        assert_eq!(format_duration(Duration::from_millis(2_350)), "2.35s");
        assert_eq!(format_duration(Duration::from_secs(30)), "30.00s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 05s");
    }

    #[test]
    fn test_format_image_sizes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(842), "842 B");
        assert_eq!(format_bytes(48_213), "47.1 KiB");
        assert_eq!(format_bytes(2_621_440), "2.5 MiB");
    }
}
