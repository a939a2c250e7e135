//! Query context composition.
//!
//! Merges the raw input sources of one question (positional text, stdin,
//! attachment contents, last captured terminal output) into a single query
//! string. The merge is not a concatenation: sources combine according to a
//! fixed precedence table, encoded as an ordered list of predicate/render
//! rules evaluated top to bottom, first match wins. The table is
//! order-sensitive, so changing rule order changes behavior.

use crate::error::ServiceError;
use std::path::Path;
use tracing::warn;

/// Maximum bytes accepted from any single input source. Larger sources are
/// truncated with a warning rather than rejected.
pub const MAX_SOURCE_SIZE: usize = 32_000;

/// Minimum length of a composed query, in characters. Guards against
/// accidental one-character submissions.
pub const MIN_QUERY_LEN: usize = 2;

/// Byte window scanned for null bytes when sniffing binary attachments.
const BINARY_SNIFF_WINDOW: usize = 8192;

/// Raw input sources for one question. Empty or whitespace-only strings are
/// treated as absent.
#[derive(Debug, Clone, Default)]
pub struct QuerySources {
    pub positional: Option<String>,
    pub stdin: Option<String>,
    /// Attachment contents, already loaded via [`load_attachment`].
    pub attachment: Option<String>,
    pub last_capture: Option<String>,
}

/// Presence flags for the four sources, in table order.
#[derive(Debug, Clone, Copy)]
struct Present {
    positional: bool,
    stdin: bool,
    attachment: bool,
    capture: bool,
}

struct Rule {
    matches: fn(Present) -> bool,
    render: fn(&QuerySources) -> String,
}

fn positional(s: &QuerySources) -> &str {
    s.positional.as_deref().unwrap_or_default()
}
fn stdin(s: &QuerySources) -> &str {
    s.stdin.as_deref().unwrap_or_default()
}
fn attachment(s: &QuerySources) -> &str {
    s.attachment.as_deref().unwrap_or_default()
}
fn capture(s: &QuerySources) -> &str {
    s.last_capture.as_deref().unwrap_or_default()
}

/// The precedence table. Most specific combinations first; when positional,
/// stdin and attachment are all present, stdin is discarded (the attachment
/// and the explicit question win over redirected input).
const RULES: &[Rule] = &[
    // positional + stdin + attachment + capture: stdin discarded
    Rule {
        matches: |p| p.positional && p.stdin && p.attachment && p.capture,
        render: |s| format!("{} {} {}", positional(s), attachment(s), capture(s)),
    },
    // positional + stdin + attachment: stdin discarded
    Rule {
        matches: |p| p.positional && p.stdin && p.attachment,
        render: |s| format!("{} {}", positional(s), attachment(s)),
    },
    // positional + attachment + capture
    Rule {
        matches: |p| p.positional && p.attachment && p.capture,
        render: |s| format!("{} {} {}", positional(s), attachment(s), capture(s)),
    },
    // positional + capture
    Rule {
        matches: |p| p.positional && p.capture && !p.stdin && !p.attachment,
        render: |s| format!("{} {}", positional(s), capture(s)),
    },
    // positional + attachment
    Rule {
        matches: |p| p.positional && p.attachment,
        render: |s| format!("{} {}", positional(s), attachment(s)),
    },
    // stdin + attachment
    Rule {
        matches: |p| p.stdin && p.attachment,
        render: |s| format!("{} {}", stdin(s), attachment(s)),
    },
    // positional + stdin
    Rule {
        matches: |p| p.positional && p.stdin,
        render: |s| format!("{} {}", positional(s), stdin(s)),
    },
    // single sources
    Rule {
        matches: |p| p.attachment,
        render: |s| attachment(s).to_string(),
    },
    Rule {
        matches: |p| p.stdin,
        render: |s| stdin(s).to_string(),
    },
    Rule {
        matches: |p| p.positional,
        render: |s| positional(s).to_string(),
    },
];

/// Compose the effective query text from the given sources.
pub fn compose(sources: &QuerySources) -> Result<String, ServiceError> {
    let sources = normalize(sources);

    let present = Present {
        positional: sources.positional.is_some(),
        stdin: sources.stdin.is_some(),
        attachment: sources.attachment.is_some(),
        capture: sources.last_capture.is_some(),
    };

    if present.positional && present.stdin && present.attachment {
        warn!("positional query and attachment are both present; ignoring stdin");
    }

    let rule = RULES
        .iter()
        .find(|rule| (rule.matches)(present))
        .ok_or(ServiceError::EmptyQuery)?;
    let text = (rule.render)(&sources);

    let len = text.chars().count();
    if len < MIN_QUERY_LEN {
        return Err(ServiceError::InvalidQuery {
            len,
            min: MIN_QUERY_LEN,
        });
    }

    Ok(text)
}

/// Trim each source, drop empty ones, and cap oversized ones. Captured
/// terminal output only ever augments a positional question; without one it
/// is ignored.
fn normalize(sources: &QuerySources) -> QuerySources {
    let clean = |name: &str, value: &Option<String>| -> Option<String> {
        let trimmed = value.as_deref()?.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(truncate_source(name, trimmed))
    };

    let positional = clean("question", &sources.positional);
    let last_capture = if positional.is_some() {
        clean("last_output", &sources.last_capture)
    } else {
        None
    };

    QuerySources {
        stdin: clean("stdin", &sources.stdin),
        attachment: clean("attachment", &sources.attachment),
        positional,
        last_capture,
    }
}

fn truncate_source(name: &str, value: &str) -> String {
    if value.len() <= MAX_SOURCE_SIZE {
        return value.to_string();
    }
    warn!(
        source = name,
        size = value.len(),
        limit = MAX_SOURCE_SIZE,
        "input source exceeds the size limit, truncating; some context may be lost"
    );
    let mut end = MAX_SOURCE_SIZE;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

/// Load an attachment's contents, refusing binary data.
pub fn load_attachment(path: &Path) -> Result<String, ServiceError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ServiceError::AttachmentNotFound(path.to_path_buf()));
        }
        Err(err) => {
            return Err(ServiceError::AttachmentUnreadable {
                path: path.to_path_buf(),
                source: err,
            });
        }
    };

    let window = &bytes[..bytes.len().min(BINARY_SNIFF_WINDOW)];
    if window.contains(&0) {
        return Err(ServiceError::BinaryAttachment(path.to_path_buf()));
    }

    match String::from_utf8(bytes) {
        Ok(text) => Ok(text.trim().to_string()),
        Err(_) => Err(ServiceError::BinaryAttachment(path.to_path_buf())),
    }
}

/// Read the last captured terminal output from the capture state file.
///
/// The file is plain text, divided into blocks by the configured prompt
/// separator; only the final block matters. A missing file is not an error,
/// just "no capture".
pub fn read_last_capture(path: &Path, prompt_separator: &str) -> Option<String> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "could not read capture file");
            }
            return None;
        }
    };

    let last = contents
        .rsplit(prompt_separator)
        .map(str::trim)
        .find(|block| !block.is_empty())?;
    Some(last.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sources(
        positional: Option<&str>,
        stdin: Option<&str>,
        attachment: Option<&str>,
        last_capture: Option<&str>,
    ) -> QuerySources {
        QuerySources {
            positional: positional.map(String::from),
            stdin: stdin.map(String::from),
            attachment: attachment.map(String::from),
            last_capture: last_capture.map(String::from),
        }
    }

    #[test]
    fn test_single_sources() {
        assert_eq!(compose(&sources(Some("Q1"), None, None, None)).unwrap(), "Q1");
        assert_eq!(compose(&sources(None, Some("S1"), None, None)).unwrap(), "S1");
        assert_eq!(compose(&sources(None, None, Some("A1"), None)).unwrap(), "A1");
    }

    #[test]
    fn test_pairwise_combinations() {
        // stdin + positional
        assert_eq!(
            compose(&sources(Some("Q"), Some("S"), None, None)).unwrap(),
            "Q S"
        );
        // stdin + attachment
        assert_eq!(
            compose(&sources(None, Some("S"), Some("A"), None)).unwrap(),
            "S A"
        );
        // positional + attachment
        assert_eq!(
            compose(&sources(Some("Q"), None, Some("A"), None)).unwrap(),
            "Q A"
        );
        // positional + capture
        assert_eq!(
            compose(&sources(Some("Q"), None, None, Some("L"))).unwrap(),
            "Q L"
        );
    }

    #[test]
    fn test_positional_attachment_capture() {
        assert_eq!(
            compose(&sources(Some("Q"), None, Some("A"), Some("L"))).unwrap(),
            "Q A L"
        );
    }

    #[test]
    fn test_stdin_discarded_when_positional_and_attachment_present() {
        assert_eq!(
            compose(&sources(Some("Q"), Some("S"), Some("A"), None)).unwrap(),
            "Q A"
        );
        // Capture still participates after stdin is dropped.
        assert_eq!(
            compose(&sources(Some("Q"), Some("S"), Some("A"), Some("L"))).unwrap(),
            "Q A L"
        );
    }

    #[test]
    fn test_capture_ignored_without_positional() {
        assert_eq!(
            compose(&sources(None, Some("S1"), None, Some("L"))).unwrap(),
            "S1"
        );
    }

    #[test]
    fn test_empty_query() {
        let err = compose(&sources(None, None, None, None)).unwrap_err();
        assert!(matches!(err, ServiceError::EmptyQuery));

        // Whitespace-only input counts as absent.
        let err = compose(&sources(Some("   "), None, None, None)).unwrap_err();
        assert!(matches!(err, ServiceError::EmptyQuery));
    }

    #[test]
    fn test_query_too_short() {
        let err = compose(&sources(Some("x"), None, None, None)).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidQuery { len: 1, .. }));
    }

    #[test]
    fn test_oversized_source_is_truncated() {
        let big = "a".repeat(MAX_SOURCE_SIZE + 100);
        let composed = compose(&sources(Some(&big), None, None, None)).unwrap();
        assert_eq!(composed.len(), MAX_SOURCE_SIZE);
    }

    #[test]
    fn test_load_attachment_missing() {
        let err = load_attachment(Path::new("/nonexistent/askd-attachment")).unwrap_err();
        assert!(matches!(err, ServiceError::AttachmentNotFound(_)));
    }

    #[test]
    fn test_load_attachment_binary() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\x7fELF\x00\x00\x01binary").unwrap();
        let err = load_attachment(file.path()).unwrap_err();
        assert!(matches!(err, ServiceError::BinaryAttachment(_)));
    }

    #[test]
    fn test_load_attachment_text() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"  some attached context\n").unwrap();
        assert_eq!(load_attachment(file.path()).unwrap(), "some attached context");
    }

    #[test]
    fn test_read_last_capture() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"$ ls\nfoo bar\n$ df -h\n/dev/sda1 20G\n")
            .unwrap();
        let capture = read_last_capture(file.path(), "$").unwrap();
        assert_eq!(capture, "df -h\n/dev/sda1 20G");
    }

    #[test]
    fn test_read_last_capture_missing_file_is_none() {
        assert!(read_last_capture(Path::new("/nonexistent/askd-capture"), "$").is_none());
    }
}
