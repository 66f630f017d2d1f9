//! Stream Reassembly Buffer
//!
//! A chat response arrives as a sequence of arbitrarily split text chunks, and
//! an in-band tag can straddle any chunk boundary. This buffer accumulates the
//! stream, extracts complete tags through the marker codec, and withholds a
//! suffix that might still turn into a tag. Concatenating everything `feed`
//! and `flush` return, over any chunking of a given text, reproduces that text
//! with all well-formed tags removed — and each tag's marker is surfaced
//! exactly once, in left-to-right order.

use crate::markers::{StreamMarker, scan};

/// Per-response buffer for one in-flight chat turn.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    /// Withheld suffix from the previous chunk that may still become a tag.
    pending: String,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorbs the next chunk and returns the text that is safe to display
    /// now. Every marker completed by this chunk is handed to `on_marker`
    /// before the call returns.
    pub fn feed(&mut self, chunk: &str, mut on_marker: impl FnMut(StreamMarker)) -> String {
        let mut buffer = std::mem::take(&mut self.pending);
        buffer.push_str(chunk);

        let outcome = scan(&buffer);
        self.pending = outcome.trailing_partial;
        for marker in outcome.markers {
            on_marker(marker);
        }
        outcome.clean
    }

    /// Ends the stream: whatever was withheld is plain content after all.
    /// A non-tag `<` is never held back past this point.
    pub fn flush(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }

    /// True when nothing is being withheld.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
