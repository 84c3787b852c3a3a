//! Re-segments answer fragments into client-sized deltas.

/// A delta is flushed as soon as the buffer ends with one of these.
const FLUSH_MARKS: &[char] = &['。', '？', '！', '，', '；', '\n'];

#[derive(Debug)]
pub struct DeltaBuffer {
    buf: String,
    flush_chars: usize,
    emitted: bool,
}

impl DeltaBuffer {
    pub fn new(flush_chars: usize) -> Self {
        Self {
            buf: String::new(),
            flush_chars,
            emitted: false,
        }
    }

    /// Append a fragment. Returns the buffered text when it is long enough
    /// or ends on a sentence/clause boundary.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        if fragment.is_empty() {
            return None;
        }
        self.buf.push_str(fragment);

        let boundary = self.buf.ends_with(FLUSH_MARKS);
        if boundary || self.buf.chars().count() > self.flush_chars {
            self.take()
        } else {
            None
        }
    }

    /// Flush the remainder at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        self.take()
    }

    /// Whether any delta has been handed out.
    pub fn has_emitted(&self) -> bool {
        self.emitted
    }

    fn take(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        self.emitted = true;
        Some(std::mem::take(&mut self.buf))
    }
}
