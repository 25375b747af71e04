//! Structured payload suppression
//!
//! Model output often embeds a machine-readable block (the router's JSON
//! decision, a fenced code sample) that must not reach the client. The
//! filter walks fragments character by character and drops everything
//! between an opening and closing marker, markers included.
//!
//! Markers:
//! - a run of three backticks opens a fenced block (the language tag is
//!   part of the block); the next run of three closes it
//! - a `{` that is the first non-whitespace character of a line opens a
//!   brace block, closed when brace depth returns to zero; braces inside
//!   JSON strings do not count
//!
//! A trailing partial fence is held back until the next fragment decides
//! whether it is a marker. An unterminated block stays suppressed.

const FENCE_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Text,
    Fenced,
    Braced {
        depth: usize,
        in_string: bool,
        escaped: bool,
    },
}

/// Per-run suppression state
#[derive(Debug, Clone)]
pub struct PayloadFilter {
    mode: Mode,
    /// Consecutive backticks seen. In text mode these are held back.
    ticks: usize,
    at_line_start: bool,
}

impl Default for PayloadFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadFilter {
    pub fn new() -> Self {
        Self {
            mode: Mode::Text,
            ticks: 0,
            at_line_start: true,
        }
    }

    /// Whether the filter is inside a payload block
    pub fn is_suppressing(&self) -> bool {
        self.mode != Mode::Text
    }

    /// Feed one fragment; returns the visible part, if any.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        let mut visible = String::new();
        for c in fragment.chars() {
            match self.mode {
                Mode::Text => self.text_char(c, &mut visible),
                Mode::Fenced => self.fenced_char(c),
                Mode::Braced { .. } => self.braced_char(c),
            }
        }
        non_empty(visible)
    }

    /// Release backticks held back as a possible fence.
    ///
    /// Called at node boundaries so a lone trailing backtick is not delayed
    /// past the lifecycle message that follows it. Suppression is unchanged.
    pub fn flush_pending(&mut self) -> Option<String> {
        if self.mode != Mode::Text || self.ticks == 0 {
            return None;
        }
        let held = "`".repeat(self.ticks);
        self.ticks = 0;
        self.at_line_start = false;
        Some(held)
    }

    /// End of stream
    pub fn finish(&mut self) -> Option<String> {
        self.flush_pending()
    }

    fn text_char(&mut self, c: char, visible: &mut String) {
        if c == '`' {
            self.ticks += 1;
            if self.ticks == FENCE_LEN {
                self.ticks = 0;
                self.mode = Mode::Fenced;
                self.at_line_start = false;
            }
            return;
        }

        if self.ticks > 0 {
            visible.push_str(&"`".repeat(self.ticks));
            self.ticks = 0;
            self.at_line_start = false;
        }

        if c == '{' && self.at_line_start {
            self.mode = Mode::Braced {
                depth: 1,
                in_string: false,
                escaped: false,
            };
            self.at_line_start = false;
            return;
        }

        visible.push(c);
        self.at_line_start = c == '\n' || (self.at_line_start && (c == ' ' || c == '\t'));
    }

    fn fenced_char(&mut self, c: char) {
        if c != '`' {
            self.ticks = 0;
            return;
        }
        self.ticks += 1;
        if self.ticks == FENCE_LEN {
            self.ticks = 0;
            self.mode = Mode::Text;
        }
    }

    fn braced_char(&mut self, c: char) {
        let Mode::Braced {
            mut depth,
            mut in_string,
            mut escaped,
        } = self.mode
        else {
            return;
        };

        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else {
            match c {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {}
            }
        }

        self.mode = if depth == 0 {
            Mode::Text
        } else {
            Mode::Braced {
                depth,
                in_string,
                escaped,
            }
        };
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
