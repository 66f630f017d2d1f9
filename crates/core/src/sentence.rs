//! Sentence segmentation for the speak queue.
//!
//! Display text streams to the client token by token, but the synthesizer
//! speaks whole sentences. The splitter accumulates streamed text and emits a
//! completed sentence at each sentence-level punctuation mark or newline, so
//! the avatar can start speaking the first sentence while the rest of the
//! response is still being generated.

/// Punctuation that ends a speakable sentence, including CJK forms.
const SENTENCE_PUNCTUATION: [char; 10] = ['.', '?', '!', ':', ';', '。', '？', '！', '：', '；'];

#[derive(Debug, Default)]
pub struct SentenceSplitter {
    current: String,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorbs a piece of display text and returns any sentences it
    /// completed. Newlines end a sentence without being included; sentence
    /// punctuation ends a sentence and is included. Emitted sentences are
    /// trimmed and never empty.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        let mut complete = Vec::new();
        for ch in text.chars() {
            if ch == '\n' {
                self.take_current(&mut complete);
            } else {
                self.current.push(ch);
                if SENTENCE_PUNCTUATION.contains(&ch) {
                    self.take_current(&mut complete);
                }
            }
        }
        complete
    }

    /// Ends the stream, returning the unterminated remainder if any.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.current);
        let rest = rest.trim();
        if rest.is_empty() { None } else { Some(rest.to_string()) }
    }

    fn take_current(&mut self, complete: &mut Vec<String>) {
        let sentence = std::mem::take(&mut self.current);
        let sentence = sentence.trim();
        if !sentence.is_empty() {
            complete.push(sentence.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_terminal_punctuation() {
        let mut splitter = SentenceSplitter::new();
        let sentences = splitter.push("First. Second? Third");
        assert_eq!(sentences, vec!["First.", "Second?"]);
        assert_eq!(splitter.finish(), Some("Third".to_string()));
    }

    #[test]
    fn newline_is_a_boundary_but_not_included() {
        let mut splitter = SentenceSplitter::new();
        let sentences = splitter.push("a line\nanother\n");
        assert_eq!(sentences, vec!["a line", "another"]);
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn boundary_split_across_pushes() {
        let mut splitter = SentenceSplitter::new();
        assert!(splitter.push("Hello wor").is_empty());
        let sentences = splitter.push("ld. Next");
        assert_eq!(sentences, vec!["Hello world."]);
        assert_eq!(splitter.finish(), Some("Next".to_string()));
    }

    #[test]
    fn cjk_punctuation_ends_a_sentence() {
        let mut splitter = SentenceSplitter::new();
        let sentences = splitter.push("안녕하세요。다음");
        assert_eq!(sentences, vec!["안녕하세요。"]);
    }

    #[test]
    fn blank_segments_are_dropped() {
        let mut splitter = SentenceSplitter::new();
        assert!(splitter.push("\n\n  \n").is_empty());
        assert_eq!(splitter.finish(), None);
    }
}
