//! Incremental extraction of fenced JSON blocks from assistant text.
//!
//! A block opens with `` ```json `` followed by optional whitespace that
//! contains a newline, and closes at the first `` ``` `` that starts its own
//! line (leading whitespace allowed). Text outside blocks is released as soon
//! as it can no longer be part of an opening fence.

pub const FENCE_OPEN: &str = "```json";
pub const FENCE_CLOSE: &str = "```";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Plain assistant text, safe to forward.
    Text(String),
    /// A complete block. `raw` is the exact fenced text, `inner` the trimmed
    /// body between the fences.
    Block { raw: String, inner: String },
}

/// Buffers only unresolved text: an open block or a trailing partial fence.
#[derive(Debug, Default)]
pub struct FenceScanner {
    pending: String,
}

enum Opening {
    /// Body starts at this byte offset.
    Body(usize),
    /// Whitespace after the tag runs to the end of the buffer.
    Incomplete,
    /// The tag is not followed by a newline; treat it as text.
    Invalid,
}

impl FenceScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    /// Feeds a content delta and returns the segments it completes, in order.
    pub fn push(&mut self, delta: &str) -> Vec<Segment> {
        self.pending.push_str(delta);
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut search_from = 0;

        loop {
            let Some(found) = self.pending[search_from..].find(FENCE_OPEN) else {
                let keep = partial_open_suffix(&self.pending[search_from..]);
                let release_to = self.pending.len() - keep;
                text.push_str(&self.pending[..release_to]);
                self.pending.drain(..release_to);
                break;
            };
            let open_at = search_from + found;
            let tag_end = open_at + FENCE_OPEN.len();

            let body_start = match opening_body(&self.pending, tag_end) {
                Opening::Body(start) => start,
                Opening::Incomplete => {
                    text.push_str(&self.pending[..open_at]);
                    self.pending.drain(..open_at);
                    break;
                }
                Opening::Invalid => {
                    search_from = tag_end;
                    continue;
                }
            };

            let Some(close_at) = closing_fence(&self.pending, body_start) else {
                text.push_str(&self.pending[..open_at]);
                self.pending.drain(..open_at);
                break;
            };

            text.push_str(&self.pending[..open_at]);
            if !text.is_empty() {
                segments.push(Segment::Text(std::mem::take(&mut text)));
            }
            let block_end = close_at + FENCE_CLOSE.len();
            segments.push(Segment::Block {
                raw: self.pending[open_at..block_end].to_string(),
                inner: self.pending[body_start..close_at].trim().to_string(),
            });
            self.pending.drain(..block_end);
            search_from = 0;
        }

        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }
        segments
    }

    /// Releases whatever is still buffered (an unclosed block or a partial
    /// fence) as plain text.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

fn opening_body(buffer: &str, tag_end: usize) -> Opening {
    let rest = &buffer[tag_end..];
    let run_len = rest
        .char_indices()
        .find(|(_, ch)| !ch.is_whitespace())
        .map(|(idx, _)| idx);
    match run_len {
        None => Opening::Incomplete,
        Some(len) if rest[..len].contains('\n') => Opening::Body(tag_end + len),
        Some(_) => Opening::Invalid,
    }
}

/// Finds the first closing fence at or after `body_start` that begins a line.
fn closing_fence(buffer: &str, body_start: usize) -> Option<usize> {
    let mut from = body_start;
    while let Some(found) = buffer[from..].find(FENCE_CLOSE) {
        let at = from + found;
        let line_start = buffer[..at].rfind('\n').map(|idx| idx + 1).unwrap_or(0);
        let on_own_line = at == body_start
            || (line_start > 0 && buffer[line_start..at].chars().all(char::is_whitespace));
        if on_own_line {
            return Some(at);
        }
        from = at + FENCE_CLOSE.len();
    }
    None
}

/// Length of the longest suffix of `text` that is a proper prefix of the
/// opening tag.
fn partial_open_suffix(text: &str) -> usize {
    (1..FENCE_OPEN.len())
        .rev()
        .find(|len| text.ends_with(&FENCE_OPEN[..*len]))
        .unwrap_or(0)
}
