use std::sync::LazyLock;

use regex::Regex;

pub const PAGE_OPEN: &str = "<page>";
pub const PAGE_CLOSE: &str = "</page>";

/// Characters each source adds around its text when several are combined.
pub const PAGE_OVERHEAD: usize = PAGE_OPEN.len() + PAGE_CLOSE.len();

static PAGE_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)</?page>").unwrap());

/// Remove page delimiters from raw source text. Repeats until stable so
/// nested fragments like `<pa<page>ge>` cannot reassemble a tag.
pub fn strip_page_tags(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let next = PAGE_TAG.replace_all(&current, "").into_owned();
        if next == current {
            return current;
        }
        current = next;
    }
}

pub fn wrap_page(text: &str) -> String {
    format!("{PAGE_OPEN}{}{PAGE_CLOSE}", strip_page_tags(text))
}

/// Split text produced by combining several wrapped pages.
pub fn split_pages(combined: &str) -> Vec<String> {
    combined
        .split(PAGE_CLOSE)
        .filter_map(|chunk| chunk.strip_prefix(PAGE_OPEN))
        .map(str::to_string)
        .collect()
}

/// Percentage of a source of `len` characters that fits in `budget` after
/// `consumed` characters went to earlier sources.
pub fn used_percentage(budget: usize, consumed: usize, len: usize) -> u8 {
    if consumed + len <= budget {
        100
    } else if consumed >= budget {
        0
    } else {
        let pct = ((budget - consumed) as f64 / len as f64 * 100.0).round();
        pct.clamp(0.0, 100.0) as u8
    }
}
