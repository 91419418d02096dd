//! Pure rendering of captured output.
//!
//! `Plain` and `Markdown` strip every escape sequence; `Html` keeps SGR
//! styling by translating it to inline-styled `<span>`s. Only SGR (`CSI …
//! m`) is interpreted — all other CSI/OSC sequences are dropped in every
//! format.

use mirror_core::{ChunkKind, OutputChunk};

/// Marker line substituted for evicted output.
pub const TRUNCATION_NOTICE: &str = "[output truncated]";

/// Output format for [`render_chunks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderFormat {
    Plain,
    Markdown,
    Html,
}

/// Render buffered chunks (arrival order) to renderable text.
pub fn render_chunks(chunks: &[OutputChunk], format: RenderFormat) -> String {
    let mut raw = String::new();
    for chunk in chunks {
        match chunk.kind {
            ChunkKind::Data => raw.push_str(&String::from_utf8_lossy(&chunk.bytes)),
            ChunkKind::Truncated => {
                if !raw.is_empty() && !raw.ends_with('\n') {
                    raw.push('\n');
                }
                raw.push_str(TRUNCATION_NOTICE);
                raw.push('\n');
            }
        }
    }

    match format {
        RenderFormat::Plain => strip_ansi(&raw),
        RenderFormat::Markdown => {
            let mut stripped = strip_ansi(&raw);
            if !stripped.is_empty() && !stripped.ends_with('\n') {
                stripped.push('\n');
            }
            format!("```text\n{stripped}```\n")
        }
        RenderFormat::Html => format!("<pre>{}</pre>", sgr_to_html(&raw)),
    }
}

// ---------------------------------------------------------------------------
// ANSI stripping
// ---------------------------------------------------------------------------

/// Remove every ANSI escape sequence (CSI, OSC, and single-char escapes).
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                // CSI: parameter/intermediate bytes, then one final byte.
                for c in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&c) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                // OSC: terminated by BEL or ST (ESC \).
                while let Some(c) = chars.next() {
                    if c == '\u{07}' {
                        break;
                    }
                    if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }
    out
}

// ---------------------------------------------------------------------------
// SGR → HTML
// ---------------------------------------------------------------------------

const FG_COLORS: [&str; 8] = [
    "#000000", "#cd3131", "#0dbc79", "#e5e510", "#2472c8", "#bc3fbc", "#11a8cd", "#e5e5e5",
];
const FG_BRIGHT: [&str; 8] = [
    "#666666", "#f14c4c", "#23d18b", "#f5f543", "#3b8eea", "#d670d6", "#29b8db", "#ffffff",
];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct SgrState {
    bold: bool,
    italic: bool,
    underline: bool,
    fg: Option<&'static str>,
    bg: Option<&'static str>,
}

impl SgrState {
    fn is_plain(&self) -> bool {
        *self == Self::default()
    }

    fn style(&self) -> String {
        let mut parts = Vec::new();
        if self.bold {
            parts.push("font-weight:bold".to_string());
        }
        if self.italic {
            parts.push("font-style:italic".to_string());
        }
        if self.underline {
            parts.push("text-decoration:underline".to_string());
        }
        if let Some(fg) = self.fg {
            parts.push(format!("color:{fg}"));
        }
        if let Some(bg) = self.bg {
            parts.push(format!("background-color:{bg}"));
        }
        parts.join(";")
    }

    fn apply(&mut self, code: u32) {
        match code {
            0 => *self = Self::default(),
            1 => self.bold = true,
            3 => self.italic = true,
            4 => self.underline = true,
            22 => self.bold = false,
            23 => self.italic = false,
            24 => self.underline = false,
            30..=37 => self.fg = Some(FG_COLORS[(code - 30) as usize]),
            39 => self.fg = None,
            40..=47 => self.bg = Some(FG_COLORS[(code - 40) as usize]),
            49 => self.bg = None,
            90..=97 => self.fg = Some(FG_BRIGHT[(code - 90) as usize]),
            100..=107 => self.bg = Some(FG_BRIGHT[(code - 100) as usize]),
            _ => {}
        }
    }
}

/// Translate SGR sequences to inline-styled spans, escaping HTML on the way.
/// Non-SGR escapes are dropped.
pub fn sgr_to_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut state = SgrState::default();
    let mut span_open = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                _ => out.push(c),
            }
            continue;
        }

        match chars.peek() {
            Some('[') => {
                chars.next();
                let mut params = String::new();
                let mut final_byte = None;
                for c in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&c) {
                        final_byte = Some(c);
                        break;
                    }
                    params.push(c);
                }
                if final_byte != Some('m') {
                    continue;
                }
                if span_open {
                    out.push_str("</span>");
                    span_open = false;
                }
                if params.is_empty() {
                    state = SgrState::default();
                } else {
                    for code in params.split(';') {
                        if let Ok(code) = code.parse::<u32>() {
                            state.apply(code);
                        }
                    }
                }
                if !state.is_plain() {
                    out.push_str(&format!("<span style=\"{}\">", state.style()));
                    span_open = true;
                }
            }
            Some(']') => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\u{07}' {
                        break;
                    }
                    if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }

    if span_open {
        out.push_str("</span>");
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
