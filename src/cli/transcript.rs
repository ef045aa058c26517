//! Accumulated chat replies.

/// Collects the fragments of one reply and tidies them for display.
#[derive(Debug, Default)]
pub struct ResponseBuffer {
    text: String,
}

impl ResponseBuffer {
    pub fn push(&mut self, fragment: &str) {
        self.text.push_str(fragment);
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Trimmed text with blank lines and runs of spaces collapsed.
    pub fn tidy(&self) -> String {
        let text = self.text.trim().replace("\n\n", "\n");

        let mut out = String::with_capacity(text.len());
        let mut previous_space = false;
        for c in text.chars() {
            if c == ' ' {
                if previous_space {
                    continue;
                }
                previous_space = true;
            } else {
                previous_space = false;
            }
            out.push(c);
        }
        out
    }
}

/// One exchange of a chat session.
#[derive(Debug, Clone)]
pub struct Turn {
    pub prompt: String,
    pub reply: String,
}

impl Turn {
    /// `None` when the reply has no visible text.
    pub fn record(prompt: &str, reply: &ResponseBuffer) -> Option<Self> {
        if reply.is_empty() {
            return None;
        }
        Some(Self {
            prompt: prompt.to_string(),
            reply: reply.tidy(),
        })
    }
}
