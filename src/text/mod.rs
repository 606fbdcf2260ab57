//! Streaming sentence segmentation for TTS hand-off.
//!
//! Tokens from the reply model accumulate until a sentence terminator is
//! seen; each maximal terminated prefix is emitted as one sentence. A
//! buffer that grows past the configured limit without a terminator is
//! broken at the rightmost comma-class character instead, so the TTS
//! worker never starves on a long clause.

/// Characters that always terminate a sentence.
const TERMINATORS: [char; 7] = ['。', '；', '？', '！', '…', '!', '?'];

/// Comma-class characters usable as long-buffer break points.
const SOFT_BREAKS: [char; 5] = ['，', '；', '、', ',', ';'];

/// Incremental sentence splitter.
///
/// Concatenating every emitted sentence plus [`finish`](Self::finish)
/// reproduces the input exactly; no character is dropped or reordered.
#[derive(Debug)]
pub struct SentenceSplitter {
    buffer: Vec<char>,
    /// Buffer length that forces a soft break.
    max_chars: usize,
    /// Minimum sentence length for a soft break.
    min_break_chars: usize,
}

impl SentenceSplitter {
    /// Create a splitter with the given soft-break limits.
    pub fn new(max_chars: usize, min_break_chars: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_chars: max_chars.max(1),
            min_break_chars,
        }
    }

    /// Feed a chunk of streamed text, returning every completed sentence.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.extend(chunk.chars());
        let mut sentences = Vec::new();
        loop {
            if let Some(end) = find_terminated_prefix(&self.buffer) {
                sentences.push(self.take(end));
                continue;
            }
            if self.buffer.len() > self.max_chars
                && let Some(end) = find_soft_break(&self.buffer, self.min_break_chars)
            {
                sentences.push(self.take(end));
                continue;
            }
            break;
        }
        sentences
    }

    /// Flush the remainder as a final sentence when the stream closes.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.take(self.buffer.len()))
    }

    /// Drop any buffered text (turn cancelled mid-stream).
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn take(&mut self, end: usize) -> String {
        self.buffer.drain(..end).collect()
    }
}

/// Exclusive end index of the first terminated sentence, if any.
///
/// An ASCII period is only a terminator when it is neither a decimal point
/// nor an intra-abbreviation dot; a trailing period is deferred until the
/// next chunk shows what follows it.
fn find_terminated_prefix(buf: &[char]) -> Option<usize> {
    let mut i = 0;
    while i < buf.len() {
        let ch = buf[i];
        if TERMINATORS.contains(&ch) {
            return Some(i + 1);
        }
        if ch == '.' {
            let dots = buf[i..].iter().take_while(|&&c| c == '.').count();
            if dots >= 3 {
                return Some(i + 3);
            }
            if i + dots == buf.len() {
                // The run touches the end of the buffer: it may still grow
                // into an ellipsis (or a decimal). Wait for more input.
                return None;
            }
            if dots == 2 {
                return Some(i + 2);
            }
            if is_decimal_point(buf, i) || is_abbreviation_dot(buf, i) {
                i += 1;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

fn is_decimal_point(buf: &[char], pos: usize) -> bool {
    pos > 0
        && pos + 1 < buf.len()
        && buf[pos - 1].is_ascii_digit()
        && buf[pos + 1].is_ascii_digit()
}

fn is_abbreviation_dot(buf: &[char], pos: usize) -> bool {
    pos > 0
        && pos + 1 < buf.len()
        && buf[pos - 1].is_alphabetic()
        && buf[pos + 1].is_alphabetic()
        && !buf[pos + 1].is_whitespace()
}

/// Exclusive end index at the rightmost comma-class character past the
/// minimum length, if any.
fn find_soft_break(buf: &[char], min_chars: usize) -> Option<usize> {
    buf.iter()
        .enumerate()
        .rev()
        .find(|(pos, ch)| SOFT_BREAKS.contains(ch) && *pos > min_chars)
        .map(|(pos, _)| pos + 1)
}
