//! Sentence boundary detection for streaming LLM output
//!
//! Buffers LLM tokens and emits complete fragments for TTS so synthesis can
//! start before generation finishes. Fragments are emitted verbatim: the
//! concatenation of every flushed fragment equals the full response text,
//! and a fragment is never empty or whitespace-only.

use voicebridge_config::SentenceConfig;

/// Splits a token stream into TTS-sized fragments
#[derive(Debug)]
pub struct SentenceSplitter {
    terminators: Vec<char>,
    min_chars: usize,
    max_buffer_chars: usize,
    buffer: String,
}

impl SentenceSplitter {
    pub fn new(config: &SentenceConfig) -> Self {
        Self {
            terminators: config.terminators.chars().collect(),
            min_chars: config.min_chars,
            max_buffer_chars: config.max_buffer_chars,
            buffer: String::new(),
        }
    }

    /// Feed a token, returning any fragments that became complete
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);

        let mut fragments = Vec::new();
        while let Some(end) = self.boundary() {
            fragments.push(self.buffer.drain(..end).collect());
        }

        // Long sentence guard: break at the last word boundary once the
        // buffer outgrows the configured cap.
        if self.buffer.chars().count() >= self.max_buffer_chars {
            if let Some(pos) = self.buffer.rfind(char::is_whitespace) {
                if !self.buffer[..pos].trim().is_empty() {
                    fragments.push(self.buffer.drain(..pos).collect());
                }
            }
        }

        fragments
    }

    /// Flush whatever remains (end of generation)
    ///
    /// Returns `None` when the remainder is empty or whitespace-only.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            None
        } else {
            Some(rest)
        }
    }

    /// Drop buffered text (turn cancelled or generation restarted)
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Find the byte offset just past the next complete sentence, if any
    ///
    /// A terminator only counts when enough non-whitespace text precedes it
    /// and the following character is whitespace or end-of-buffer, which
    /// skips decimals and abbreviations mid-token. Trailing closers and the
    /// whitespace run after the terminator stay attached to the fragment so
    /// concatenation is preserved exactly.
    fn boundary(&self) -> Option<usize> {
        let mut nonspace = 0usize;

        for (idx, c) in self.buffer.char_indices() {
            if !c.is_whitespace() {
                nonspace += 1;
            }
            if !self.terminators.contains(&c) {
                continue;
            }
            if nonspace < self.min_chars {
                continue;
            }

            let mut end = idx + c.len_utf8();
            for rc in self.buffer[end..].chars() {
                if matches!(rc, '"' | '\'' | ')' | ']' | '\u{201d}' | '\u{2019}') {
                    end += rc.len_utf8();
                } else {
                    break;
                }
            }

            match self.buffer[end..].chars().next() {
                None => return Some(end),
                Some(next) if next.is_whitespace() => {
                    let ws: usize = self.buffer[end..]
                        .chars()
                        .take_while(|ch| ch.is_whitespace())
                        .map(|ch| ch.len_utf8())
                        .sum();
                    return Some(end + ws);
                }
                // mid-token terminator, e.g. "3.5"
                Some(_) => continue,
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn splitter(min_chars: usize, max_buffer_chars: usize) -> SentenceSplitter {
        SentenceSplitter::new(&SentenceConfig {
            terminators: ".!?".to_string(),
            min_chars,
            max_buffer_chars,
        })
    }

    fn push_all(s: &mut SentenceSplitter, chunks: &[&str]) -> Vec<String> {
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(s.push(chunk));
        }
        out.extend(s.flush());
        out
    }

    #[test]
    fn test_simple_split() {
        let mut s = splitter(1, 240);
        let fragments = push_all(&mut s, &["Hello world. How are you?"]);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0], "Hello world. ");
        assert_eq!(fragments[1], "How are you?");
    }

    #[test]
    fn test_streaming_chunks() {
        let mut s = splitter(1, 240);
        assert!(s.push("Hel").is_empty());
        assert!(s.push("lo wor").is_empty());
        let fragments = s.push("ld. And");
        assert_eq!(fragments, vec!["Hello world. ".to_string()]);
        assert_eq!(s.flush(), Some("And".to_string()));
    }

    #[test]
    fn test_min_length_defers_short_fragments() {
        let mut s = splitter(12, 240);
        // "Hi." alone is below the minimum; it rides along with the next
        // sentence instead of producing a tiny TTS call.
        let fragments = s.push("Hi. That works for me.");
        assert_eq!(fragments, vec!["Hi. That works for me.".to_string()]);
    }

    #[test]
    fn test_decimal_point_is_not_a_boundary() {
        let mut s = splitter(1, 240);
        let fragments = push_all(&mut s, &["Pi is roughly 3.14 in short form."]);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0], "Pi is roughly 3.14 in short form.");
    }

    #[test]
    fn test_max_buffer_forces_word_boundary_flush() {
        let mut s = splitter(1, 20);
        let fragments = s.push("one two three four five six seven");
        assert!(!fragments.is_empty());
        for fragment in &fragments {
            assert!(!fragment.trim().is_empty());
        }
    }

    #[test]
    fn test_no_empty_or_whitespace_fragments() {
        let mut s = splitter(1, 240);
        let mut fragments = Vec::new();
        for chunk in ["   ", ". ", "Well", ".", "  ", "Sure thing."] {
            fragments.extend(s.push(chunk));
        }
        fragments.extend(s.flush());
        for fragment in &fragments {
            assert!(!fragment.trim().is_empty(), "fragment {fragment:?}");
        }
    }

    #[test]
    fn test_concatenation_equals_input() {
        let chunks = [
            "The answer ",
            "is yes. Let me ",
            "explain why that holds. ",
            "First, streams interleave",
            " freely. Second, order is per-lane",
        ];
        let mut s = splitter(8, 64);
        let mut fragments = Vec::new();
        for chunk in chunks {
            fragments.extend(s.push(chunk));
        }
        fragments.extend(s.flush());

        let rebuilt: String = fragments.concat();
        assert_eq!(rebuilt, chunks.concat());
        assert!(fragments.len() > 1);
    }

    #[test]
    fn test_flush_discards_whitespace_remainder() {
        let mut s = splitter(1, 240);
        let fragments = s.push("Done here. ");
        assert_eq!(fragments, vec!["Done here. ".to_string()]);
        s.push("   ");
        assert_eq!(s.flush(), None);
    }

    #[test]
    fn test_reset() {
        let mut s = splitter(1, 240);
        s.push("half a sent");
        s.reset();
        assert!(s.is_empty());
        assert_eq!(s.flush(), None);
    }
}
