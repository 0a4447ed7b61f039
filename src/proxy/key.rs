//! Property-key classification and the slice mini-language
//!
//! A key is split on `,`; every trimmed part must be an integer, a
//! `start:stop:step` range (each field optional, possibly negative) or `...`.
//! A key with several parts, or a single range or ellipsis, is a subscript.
//! A single integer stays an index so sequences can treat it specially.

use super::RESERVED;

/// One component of a subscript key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceItem {
    Index(i64),
    Range {
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    },
    Ellipsis,
}

/// How a property key is interpreted
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Key<'a> {
    /// `toString`, `valueOf`, `proxiedObject` or `iterator`
    Reserved(&'a str),
    /// Integer-shaped key
    Index(i64),
    /// Subscript built from the slice mini-language
    Subscript(Vec<SliceItem>),
    /// Anything else: attribute or mapping key
    Name(&'a str),
}

pub(crate) fn classify(key: &str) -> Key<'_> {
    if RESERVED.contains(&key) {
        return Key::Reserved(key);
    }
    match parse_subscript(key) {
        Some(items) => match items.as_slice() {
            [SliceItem::Index(i)] => Key::Index(*i),
            _ => Key::Subscript(items),
        },
        None => Key::Name(key),
    }
}

/// Parse a key in the slice mini-language; `None` if any part is malformed
pub fn parse_subscript(key: &str) -> Option<Vec<SliceItem>> {
    key.split(',').map(parse_part).collect()
}

/// Whether a key denotes a subscript (as opposed to a plain index or name)
pub fn is_subscript(key: &str) -> bool {
    matches!(classify(key), Key::Subscript(_))
}

fn parse_part(part: &str) -> Option<SliceItem> {
    let part = part.trim();
    if part == "..." {
        return Some(SliceItem::Ellipsis);
    }
    if !part.contains(':') {
        return parse_int(part).map(SliceItem::Index);
    }

    let fields: Vec<&str> = part.split(':').collect();
    if fields.len() > 3 {
        return None;
    }

    let mut bounds = [None; 3];
    for (slot, field) in bounds.iter_mut().zip(&fields) {
        let field = field.trim();
        if !field.is_empty() {
            *slot = Some(parse_int(field)?);
        }
    }

    Some(SliceItem::Range {
        start: bounds[0],
        stop: bounds[1],
        step: bounds[2],
    })
}

fn parse_int(text: &str) -> Option<i64> {
    let digits = text.strip_prefix('-').unwrap_or(text);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}
