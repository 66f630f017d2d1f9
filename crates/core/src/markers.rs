//! In-Band Stream Marker Codec
//!
//! Chat token streams carry occasional out-of-band values embedded directly in
//! the text: latency measurements and diagram references, each delimited as
//! `<TAG>payload</TAG>`. This module is the pure codec for that protocol. It
//! scans a piece of text, strips every fully formed tag out of it, and reports
//! the extracted markers alongside the cleaned text. Anything that merely
//! looks like a tag but isn't one passes through untouched — a streamed
//! response must never be corrupted or rejected because of a stray `<`.
//!
//! Scanning is streaming-safe: a tag may be split at any byte boundary across
//! chunks, so a suffix that could still grow into a recognized tag is returned
//! separately as `trailing_partial` instead of being classified either way.
//! Re-scanning an accumulated buffer yields the same markers and clean text as
//! scanning the fully assembled text once.

use serde::{Deserialize, Serialize};

/// An out-of-band value extracted from a chat token stream.
///
/// Markers are transient: they are parsed, acted upon (logged or forwarded to
/// the client as a structured event) and discarded. They never appear in the
/// user-visible text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StreamMarker {
    /// Speech-to-text latency in milliseconds (`<STTL>`).
    SttLatency(u64),
    /// Latency until the first LLM token in milliseconds (`<FTL>`).
    FirstTokenLatency(u64),
    /// Latency until the first complete sentence in milliseconds (`<FSL>`).
    FirstSentenceLatency(u64),
    /// A reference to a rendered diagram resource (`<DIAGRAM>`).
    Diagram(String),
    /// The structural JSON accompanying a diagram (`<STRUCTURE>`).
    Structure(String),
}

impl StreamMarker {
    /// Renders the marker back into its wire form.
    pub fn encode(&self) -> String {
        match self {
            StreamMarker::SttLatency(ms) => format!("<STTL>{ms}</STTL>"),
            StreamMarker::FirstTokenLatency(ms) => format!("<FTL>{ms}</FTL>"),
            StreamMarker::FirstSentenceLatency(ms) => format!("<FSL>{ms}</FSL>"),
            StreamMarker::Diagram(path) => format!("<DIAGRAM>{path}</DIAGRAM>"),
            StreamMarker::Structure(json) => format!("<STRUCTURE>{json}</STRUCTURE>"),
        }
    }
}

/// The result of scanning one piece of text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Display text with all fully formed tags removed.
    pub clean: String,
    /// Extracted markers, in the order they appeared.
    pub markers: Vec<StreamMarker>,
    /// A trailing suffix that could still become a recognized tag once more
    /// bytes arrive. Empty when the text ends unambiguously.
    pub trailing_partial: String,
}

#[derive(Clone, Copy)]
enum TagKind {
    SttLatency,
    FirstTokenLatency,
    FirstSentenceLatency,
    Diagram,
    Structure,
}

struct TagSpec {
    open: &'static str,
    close: &'static str,
    kind: TagKind,
}

const TAGS: [TagSpec; 5] = [
    TagSpec { open: "<STTL>", close: "</STTL>", kind: TagKind::SttLatency },
    TagSpec { open: "<FTL>", close: "</FTL>", kind: TagKind::FirstTokenLatency },
    TagSpec { open: "<FSL>", close: "</FSL>", kind: TagKind::FirstSentenceLatency },
    TagSpec { open: "<DIAGRAM>", close: "</DIAGRAM>", kind: TagKind::Diagram },
    TagSpec { open: "<STRUCTURE>", close: "</STRUCTURE>", kind: TagKind::Structure },
];

impl TagKind {
    /// Builds a marker from a raw payload. `None` means the payload is
    /// malformed and the whole tag should pass through as plain text.
    fn parse_payload(self, payload: &str) -> Option<StreamMarker> {
        match self {
            TagKind::SttLatency => parse_millis(payload).map(StreamMarker::SttLatency),
            TagKind::FirstTokenLatency => parse_millis(payload).map(StreamMarker::FirstTokenLatency),
            TagKind::FirstSentenceLatency => {
                parse_millis(payload).map(StreamMarker::FirstSentenceLatency)
            }
            TagKind::Diagram => Some(StreamMarker::Diagram(payload.to_string())),
            TagKind::Structure => Some(StreamMarker::Structure(payload.to_string())),
        }
    }
}

/// Strict non-negative integer parse: every byte must be an ASCII digit, so
/// values like `"+5"`, `" 5"` or `"abc"` are all rejected.
fn parse_millis(payload: &str) -> Option<u64> {
    if payload.is_empty() || !payload.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    payload.parse().ok()
}

enum TagMatch {
    /// A full, well-formed tag. `consumed` bytes belong to it.
    Complete { marker: StreamMarker, consumed: usize },
    /// A full tag shape with an unusable payload; the raw bytes pass through.
    Malformed { consumed: usize },
    /// The text could still grow into a recognized tag.
    Partial,
    /// Definitely not one of ours.
    None,
}

/// Classifies text starting at a `<`.
fn match_tag(s: &str) -> TagMatch {
    let mut partial = false;
    for tag in &TAGS {
        if let Some(rest) = s.strip_prefix(tag.open) {
            match rest.find(tag.close) {
                Some(idx) => {
                    let consumed = tag.open.len() + idx + tag.close.len();
                    return match tag.kind.parse_payload(&rest[..idx]) {
                        Some(marker) => TagMatch::Complete { marker, consumed },
                        None => TagMatch::Malformed { consumed },
                    };
                }
                // Opening tag seen, closing tag not yet: hold judgement.
                None => partial = true,
            }
        } else if tag.open.as_bytes().starts_with(s.as_bytes()) {
            // The text ends in the middle of this opening tag.
            partial = true;
        }
    }
    if partial { TagMatch::Partial } else { TagMatch::None }
}

/// Scans `text` for in-band markers.
///
/// Returns the cleaned display text, the extracted markers in left-to-right
/// order, and any trailing suffix that could still become a tag. Unknown
/// angle-bracket content and malformed payloads pass through verbatim.
pub fn scan(text: &str) -> ScanOutcome {
    let mut clean = String::with_capacity(text.len());
    let mut markers = Vec::new();
    let mut rest = text;

    while let Some(pos) = rest.find('<') {
        clean.push_str(&rest[..pos]);
        let candidate = &rest[pos..];
        match match_tag(candidate) {
            TagMatch::Complete { marker, consumed } => {
                markers.push(marker);
                rest = &candidate[consumed..];
            }
            TagMatch::Malformed { consumed } => {
                clean.push_str(&candidate[..consumed]);
                rest = &candidate[consumed..];
            }
            TagMatch::Partial => {
                return ScanOutcome {
                    clean,
                    markers,
                    trailing_partial: candidate.to_string(),
                };
            }
            TagMatch::None => {
                clean.push('<');
                rest = &candidate[1..];
            }
        }
    }
    clean.push_str(rest);
    ScanOutcome {
        clean,
        markers,
        trailing_partial: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        let outcome = scan("Hello, world.");
        assert_eq!(outcome.clean, "Hello, world.");
        assert!(outcome.markers.is_empty());
        assert!(outcome.trailing_partial.is_empty());
    }

    #[test]
    fn extracts_latency_marker() {
        let outcome = scan("before<FTL>123</FTL>after");
        assert_eq!(outcome.clean, "beforeafter");
        assert_eq!(outcome.markers, vec![StreamMarker::FirstTokenLatency(123)]);
    }

    #[test]
    fn extracts_diagram_marker() {
        let outcome = scan("Hello <DIAGRAM>img1</DIAGRAM> world");
        assert_eq!(outcome.clean, "Hello  world");
        assert_eq!(outcome.markers, vec![StreamMarker::Diagram("img1".into())]);
    }

    #[test]
    fn extracts_multiple_markers_in_order() {
        let outcome = scan("<STTL>10</STTL>a<FSL>20</FSL>b<STRUCTURE>{\"n\":1}</STRUCTURE>");
        assert_eq!(outcome.clean, "ab");
        assert_eq!(
            outcome.markers,
            vec![
                StreamMarker::SttLatency(10),
                StreamMarker::FirstSentenceLatency(20),
                StreamMarker::Structure("{\"n\":1}".into()),
            ]
        );
    }

    #[test]
    fn malformed_numeric_payload_passes_through_verbatim() {
        let outcome = scan("x<FTL>abc</FTL>y");
        assert_eq!(outcome.clean, "x<FTL>abc</FTL>y");
        assert!(outcome.markers.is_empty());
    }

    #[test]
    fn signed_and_padded_numbers_are_malformed() {
        for payload in ["+5", "-5", " 5", "5 ", ""] {
            let text = format!("<STTL>{payload}</STTL>");
            let outcome = scan(&text);
            assert_eq!(outcome.clean, text, "payload {payload:?}");
            assert!(outcome.markers.is_empty());
        }
    }

    #[test]
    fn unknown_angle_bracket_content_is_untouched() {
        let outcome = scan("a < b and <bold>text</bold>");
        assert_eq!(outcome.clean, "a < b and <bold>text</bold>");
        assert!(outcome.markers.is_empty());
        assert!(outcome.trailing_partial.is_empty());
    }

    #[test]
    fn split_opening_tag_is_withheld() {
        let outcome = scan("Hello <DIA");
        assert_eq!(outcome.clean, "Hello ");
        assert_eq!(outcome.trailing_partial, "<DIA");
    }

    #[test]
    fn unclosed_tag_is_withheld() {
        let outcome = scan("Hello <DIAGRAM>img1");
        assert_eq!(outcome.clean, "Hello ");
        assert_eq!(outcome.trailing_partial, "<DIAGRAM>img1");
    }

    #[test]
    fn lone_angle_bracket_at_end_is_withheld() {
        let outcome = scan("tail<");
        assert_eq!(outcome.clean, "tail");
        assert_eq!(outcome.trailing_partial, "<");
    }

    #[test]
    fn reassembled_buffer_matches_single_scan() {
        let full = "one <FTL>5</FTL>two <DIAGRAM>d.png</DIAGRAM> three";
        let single = scan(full);

        // Split at every byte boundary and scan the pieces as an accumulating
        // buffer, exactly the way a streaming caller would.
        for split in 0..full.len() {
            if !full.is_char_boundary(split) {
                continue;
            }
            let first = scan(&full[..split]);
            let resumed = format!("{}{}", first.trailing_partial, &full[split..]);
            let second = scan(&resumed);

            let clean = format!("{}{}", first.clean, second.clean);
            let mut markers = first.markers.clone();
            markers.extend(second.markers.clone());

            assert_eq!(clean, single.clean, "split at {split}");
            assert_eq!(markers, single.markers, "split at {split}");
            assert!(second.trailing_partial.is_empty(), "split at {split}");
        }
    }

    #[test]
    fn encode_round_trips() {
        let markers = [
            StreamMarker::SttLatency(42),
            StreamMarker::FirstTokenLatency(0),
            StreamMarker::Diagram("arch/net.png".into()),
        ];
        for marker in markers {
            let outcome = scan(&marker.encode());
            assert_eq!(outcome.clean, "");
            assert_eq!(outcome.markers, vec![marker]);
        }
    }
}
