use std::sync::LazyLock;

use regex::{CaptureMatches, Regex};

static FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```([\w-]*)\s*([\s\S]*?)```").expect("fence regex must compile")
});

/// A piece of message content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    Code { language: &'a str, code: &'a str },
}

impl Segment<'_> {
    /// Whether a renderer may show this code block as a live preview.
    pub fn is_previewable(&self) -> bool {
        match self {
            Segment::Code { language, .. } => is_previewable(language),
            Segment::Text(_) => false,
        }
    }
}

/// Split `text` into plain text and fenced code blocks, in order.
/// An unterminated fence stays part of the surrounding text.
pub fn segments(text: &str) -> Segments<'_> {
    Segments {
        text,
        pos: 0,
        fences: FENCE.captures_iter(text),
        pending: None,
    }
}

pub fn is_previewable(language: &str) -> bool {
    ["html", "svg", "xml"]
        .iter()
        .any(|l| language.eq_ignore_ascii_case(l))
}

pub struct Segments<'a> {
    text: &'a str,
    pos: usize,
    fences: CaptureMatches<'static, 'a>,
    pending: Option<Segment<'a>>,
}

impl<'a> Iterator for Segments<'a> {
    type Item = Segment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(code) = self.pending.take() {
            return Some(code);
        }

        for caps in self.fences.by_ref() {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let code = Segment::Code {
                language: caps.get(1).map_or("", |m| m.as_str()).trim(),
                code: caps.get(2).map_or("", |m| m.as_str()).trim(),
            };
            let before = &self.text[self.pos..whole.start()];
            self.pos = whole.end();

            if before.is_empty() {
                return Some(code);
            }
            self.pending = Some(code);
            return Some(Segment::Text(before));
        }

        if self.pos < self.text.len() {
            let rest = &self.text[self.pos..];
            self.pos = self.text.len();
            return Some(Segment::Text(rest));
        }
        None
    }
}
