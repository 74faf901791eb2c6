//! Accumulation buffer for streamed fragments.

/// Cumulative text of an assistant reply.
///
/// The store always receives the full text so far, never a single fragment;
/// this type owns that running total for one exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseBuffer {
    text: String,
    fragments: usize,
}

impl ResponseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fragment. Empty fragments are ignored and return false.
    pub fn push(&mut self, fragment: &str) -> bool {
        if fragment.is_empty() {
            return false;
        }
        self.text.push_str(fragment);
        self.fragments += 1;
        true
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Number of non-empty fragments appended so far.
    pub fn fragment_count(&self) -> usize {
        self.fragments
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn into_string(self) -> String {
        self.text
    }
}
