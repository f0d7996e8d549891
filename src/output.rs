//! The polymorphic value that flows between processes (SPEC_FULL.md §4.4).
//!
//! Every stream in the pipeline carries `Output`, never raw bytes. This is
//! what lets `head`/`tail`/`grep` operate on structured items instead of
//! splitting on newlines by hand.

use serde_json::Value as JsonValue;

/// Hint for how an `Array` should lay its items out when rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// One item per line (the default).
    Lines,
    /// Short items packed into columns, the way `ls -C` does.
    Multicolumn,
}

/// A value flowing between processes.
#[derive(Debug, Clone)]
pub enum Output {
    /// Pre-escaped markup; passed straight through on render (e.g. an
    /// already-styled prompt or error-sink payload).
    Raw(String),
    /// Plain text; escaped on render to neutralize control characters that
    /// would corrupt the TTY (stray `\r`, bare `ESC`, ...).
    Text(String),
    /// An ordered sequence of sub-outputs, with a layout hint.
    Array(Vec<Output>, Layout),
    /// An opaque structured record (e.g. a `ps` row); rendered via its
    /// string form.
    Object(JsonValue),
}

impl Output {
    pub fn text(s: impl Into<String>) -> Self {
        Output::Text(s.into())
    }

    pub fn raw(s: impl Into<String>) -> Self {
        Output::Raw(s.into())
    }

    pub fn array(items: Vec<Output>) -> Self {
        Output::Array(items, Layout::Lines)
    }

    pub fn multicolumn(items: Vec<Output>) -> Self {
        Output::Array(items, Layout::Multicolumn)
    }

    /// Flat string form, used by filters (`grep`'s pattern match target,
    /// history persistence, `str()` in SPEC_FULL.md).
    pub fn str(&self) -> String {
        match self {
            Output::Raw(s) | Output::Text(s) => s.clone(),
            Output::Array(items, _) => items
                .iter()
                .map(Output::str)
                .collect::<Vec<_>>()
                .join("\n"),
            Output::Object(v) => match v {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            },
        }
    }

    /// Rendering suitable for a real TTY host. `Text` is escaped; `Raw`
    /// passes through untouched; `Array` renders members in layout order.
    pub fn render(&self) -> String {
        match self {
            Output::Raw(s) => s.clone(),
            Output::Text(s) => escape_for_tty(s),
            Output::Array(items, Layout::Lines) => items
                .iter()
                .map(Output::render)
                .collect::<Vec<_>>()
                .join("\n"),
            Output::Array(items, Layout::Multicolumn) => render_multicolumn(items),
            Output::Object(v) => escape_for_tty(&v.to_string()),
        }
    }

    /// Decomposition into sub-outputs. `Text`/`Raw` split on line breaks;
    /// `Array` yields its members; `Object` yields itself (it has no finer
    /// structure in this model).
    pub fn items(&self) -> Vec<Output> {
        match self {
            Output::Text(s) => s.lines().map(|l| Output::Text(l.to_string())).collect(),
            Output::Raw(s) => s.lines().map(|l| Output::Raw(l.to_string())).collect(),
            Output::Array(items, _) => items.clone(),
            Output::Object(_) => vec![self.clone()],
        }
    }
}

fn escape_for_tty(s: &str) -> String {
    s.chars()
        .filter(|c| *c != '\r' && (*c == '\n' || *c == '\t' || !c.is_control()))
        .collect()
}

fn render_multicolumn(items: &[Output]) -> String {
    if items.is_empty() {
        return String::new();
    }
    let rendered: Vec<String> = items.iter().map(Output::render).collect();
    let width = rendered.iter().map(|s| s.len()).max().unwrap_or(0) + 2;
    let cols = std::cmp::max(1, 80 / width.max(1));
    rendered
        .chunks(cols)
        .map(|row| {
            row.iter()
                .map(|s| format!("{s:<width$}"))
                .collect::<String>()
                .trim_end()
                .to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}
