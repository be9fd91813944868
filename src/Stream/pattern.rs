//! Numbered output file names such as `event_{:08d}.dat`

use std::path::PathBuf;

/// Widest accepted field; wider placeholders are left as literal text.
pub const MAX_FIELD_WIDTH: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Text(String),
    Number { width: usize, zero_pad: bool },
}

/// A path pattern with `{}`, `{:Nd}` or `{:0Nd}` placeholders for the event number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPattern {
    raw: String,
    pieces: Vec<Piece>,
}

impl OutputPattern {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let pieces = parse(&raw);
        Self { raw, pieces }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when at least one placeholder is present; without one every
    /// event overwrites the same file.
    pub fn has_placeholder(&self) -> bool {
        self.pieces.iter().any(|p| matches!(p, Piece::Number { .. }))
    }

    pub fn render(&self, event_num: u64) -> String {
        let mut out = String::with_capacity(self.raw.len() + 8);
        for piece in &self.pieces {
            match piece {
                Piece::Text(text) => out.push_str(text),
                Piece::Number {
                    width,
                    zero_pad: true,
                } => out.push_str(&format!("{event_num:0width$}")),
                Piece::Number {
                    width,
                    zero_pad: false,
                } => out.push_str(&format!("{event_num:width$}")),
            }
        }
        out
    }

    pub fn path_for(&self, event_num: u64) -> PathBuf {
        PathBuf::from(self.render(event_num))
    }
}

fn parse(raw: &str) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut text = String::new();
    let mut rest = raw;

    while let Some(open) = rest.find('{') {
        text.push_str(&rest[..open]);
        let after = &rest[open..];
        match after.find('}').and_then(|close| {
            placeholder(&after[1..close]).map(|piece| (piece, close))
        }) {
            Some((piece, close)) => {
                if !text.is_empty() {
                    pieces.push(Piece::Text(std::mem::take(&mut text)));
                }
                pieces.push(piece);
                rest = &after[close + 1..];
            }
            None => {
                // not a placeholder; keep the brace and move on
                text.push('{');
                rest = &after[1..];
            }
        }
    }
    text.push_str(rest);
    if !text.is_empty() {
        pieces.push(Piece::Text(text));
    }
    pieces
}

/// Body between the braces: empty, `:d`, `:Nd` or `:0Nd`.
fn placeholder(body: &str) -> Option<Piece> {
    if body.is_empty() {
        return Some(Piece::Number {
            width: 0,
            zero_pad: false,
        });
    }
    let fmt = body.strip_prefix(':')?.strip_suffix('d')?;
    let zero_pad = fmt.starts_with('0');
    let width = if fmt.is_empty() {
        0
    } else {
        if !fmt.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        fmt.parse().ok().filter(|w| *w <= MAX_FIELD_WIDTH)?
    };
    Some(Piece::Number { width, zero_pad })
}

impl Default for OutputPattern {
    fn default() -> Self {
        Self::new("event_{:08d}.dat")
    }
}
