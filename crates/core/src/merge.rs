//! Quantity and tag merge policy.
//!
//! Pure functions over the free-form strings users type into quantity and tag
//! fields. Nothing here fails: unparseable input passes through unchanged.

use serde::{Deserialize, Serialize};

/// Most tags a recipe may carry.
pub const MAX_TAGS_PER_RECIPE: usize = 10;

/// Longest accepted tag, in characters.
pub const MAX_TAG_LEN: usize = 24;

/// Tags offered before a household has any of its own.
pub const DEFAULT_TAGS: [&str; 10] = [
    "vegan",
    "vegetarian",
    "gluten-free",
    "dairy-free",
    "quick",
    "dessert",
    "breakfast",
    "dinner",
    "spicy",
    "kid-friendly",
];

/// Decimal separator used when formatting amounts. Parsing accepts both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecimalStyle {
    #[default]
    Comma,
    Dot,
}

/// A quantity split into its leading number and free-text unit tail.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedQuantity {
    pub amount: f64,
    pub tail: String,
}

/// Parse `"200 g"`, `"0.5kg"`, `"3,5 l"` into amount and tail.
///
/// The number is an optional sign, digits, and an optional `.`/`,` fraction.
/// Returns `None` when the input does not start with a number.
pub fn parse_quantity(input: &str) -> Option<ParsedQuantity> {
    let s = input.trim();
    let bytes = s.as_bytes();
    let mut end = 0;

    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end += 1;
    }
    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == int_start {
        return None;
    }
    if end + 1 < bytes.len()
        && matches!(bytes[end], b'.' | b',')
        && bytes[end + 1].is_ascii_digit()
    {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }

    let amount: f64 = s[..end].replace(',', ".").parse().ok()?;
    if !amount.is_finite() {
        return None;
    }
    Some(ParsedQuantity {
        amount,
        tail: s[end..].trim().to_string(),
    })
}

/// Round to two decimals, drop trailing zeros, and apply the decimal style.
pub fn format_amount(amount: f64, style: DecimalStyle) -> String {
    if !amount.is_finite() {
        return String::new();
    }
    let rounded = (amount * 100.0).round() / 100.0;
    let text = if (rounded - rounded.round()).abs() < 1e-9 {
        (rounded.round() as i64).to_string()
    } else {
        rounded.to_string()
    };
    match style {
        DecimalStyle::Comma => text.replace('.', ","),
        DecimalStyle::Dot => text,
    }
}

fn join_amount(amount: &str, tail: &str) -> String {
    if tail.is_empty() {
        amount.to_string()
    } else {
        format!("{amount} {tail}")
    }
}

/// Multiply the numeric part of a quantity by `factor`.
///
/// Free-text quantities ("a pinch") and non-finite results come back unchanged.
pub fn scale_quantity(qty: &str, factor: f64, style: DecimalStyle) -> String {
    let trimmed = qty.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let Some(parsed) = parse_quantity(trimmed) else {
        return trimmed.to_string();
    };
    let scaled = parsed.amount * factor;
    if !scaled.is_finite() {
        return trimmed.to_string();
    }
    join_amount(&format_amount(scaled, style), &parsed.tail)
}

/// Unit-aware sum of two `+`-separated quantities.
///
/// Parts whose unit tail matches exactly are summed; everything else is kept
/// as free text. Numeric fragments come first in first-seen tail order, then
/// free text in original order. Zero sums are dropped.
pub fn merge_quantities(a: &str, b: &str, style: DecimalStyle) -> String {
    let a = a.trim();
    let b = b.trim();
    if a.is_empty() {
        return b.to_string();
    }
    if b.is_empty() {
        return a.to_string();
    }

    let mut sums: Vec<(String, f64)> = Vec::new();
    let mut extras: Vec<String> = Vec::new();

    let parts = a
        .split('+')
        .chain(b.split('+'))
        .map(str::trim)
        .filter(|p| !p.is_empty());
    for part in parts {
        match parse_quantity(part) {
            Some(parsed) => match sums.iter_mut().find(|(tail, _)| *tail == parsed.tail) {
                Some((_, sum)) => *sum += parsed.amount,
                None => sums.push((parsed.tail, parsed.amount)),
            },
            None => extras.push(part.to_string()),
        }
    }

    let mut out: Vec<String> = sums
        .into_iter()
        .filter(|(_, sum)| *sum != 0.0 && !sum.is_nan())
        .map(|(tail, sum)| join_amount(&format_amount(sum, style), &tail))
        .collect();
    out.extend(extras);
    out.join(" + ")
}

/// How [`merge_tag_sets`] treated the candidate tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOutcome {
    Added,
    Duplicate,
    AtCapacity,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagMerge {
    pub tags: Vec<String>,
    pub outcome: TagOutcome,
}

/// Add `new_tag` to a tag set, case-insensitively deduplicated and capped at `max`.
///
/// A full set is left alone; callers surface [`TagOutcome::AtCapacity`] as a
/// UI rejection. The result never holds more than `max` tags.
pub fn merge_tag_sets(existing: &[String], new_tag: &str, max: usize) -> TagMerge {
    let mut tags: Vec<String> = Vec::with_capacity(existing.len().min(max) + 1);
    for tag in existing {
        let tag = tag.trim();
        if tag.is_empty() || contains_tag(&tags, tag) {
            continue;
        }
        if tags.len() == max {
            break;
        }
        tags.push(tag.to_string());
    }

    let candidate = new_tag.trim();
    let outcome = if candidate.is_empty() {
        TagOutcome::Invalid
    } else if contains_tag(&tags, candidate) {
        TagOutcome::Duplicate
    } else if tags.len() >= max {
        TagOutcome::AtCapacity
    } else {
        tags.push(candidate.to_string());
        TagOutcome::Added
    };
    TagMerge { tags, outcome }
}

fn contains_tag(tags: &[String], tag: &str) -> bool {
    let lowered = tag.to_lowercase();
    tags.iter().any(|t| t.to_lowercase() == lowered)
}

/// Tags are 1–24 characters of ASCII letters, digits, spaces, `-` and `&`.
pub fn is_valid_tag(tag: &str) -> bool {
    let len = tag.chars().count();
    (1..=MAX_TAG_LEN).contains(&len)
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '&'))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    const COMMA: DecimalStyle = DecimalStyle::Comma;

    fn fragments(s: &str) -> BTreeSet<String> {
        s.split(" + ").map(str::to_string).collect()
    }

    #[test]
    fn parses_number_and_tail() {
        assert_eq!(
            parse_quantity("200 g"),
            Some(ParsedQuantity { amount: 200.0, tail: "g".into() })
        );
        assert_eq!(
            parse_quantity("0.5kg"),
            Some(ParsedQuantity { amount: 0.5, tail: "kg".into() })
        );
        assert_eq!(
            parse_quantity("3,5 l"),
            Some(ParsedQuantity { amount: 3.5, tail: "l".into() })
        );
        assert_eq!(parse_quantity("-2"), Some(ParsedQuantity { amount: -2.0, tail: String::new() }));
        assert_eq!(parse_quantity("a pinch"), None);
        assert_eq!(parse_quantity(""), None);
        // A separator without digits after it belongs to the tail.
        assert_eq!(parse_quantity("2. Stück").unwrap().tail, ". Stück");
    }

    #[test]
    fn format_trims_and_uses_style() {
        assert_eq!(format_amount(2.0, COMMA), "2");
        assert_eq!(format_amount(1.5, COMMA), "1,5");
        assert_eq!(format_amount(1.5, DecimalStyle::Dot), "1.5");
        assert_eq!(format_amount(1.0 / 3.0, COMMA), "0,33");
        assert_eq!(format_amount(0.1 + 0.2, COMMA), "0,3");
        assert_eq!(format_amount(f64::INFINITY, COMMA), "");
    }

    #[test]
    fn scale_outputs_comma_decimals() {
        assert_eq!(scale_quantity("200 g", 1.5, COMMA), "300 g");
        assert_eq!(scale_quantity("0.5kg", 3.0, COMMA), "1,5 kg");
        assert_eq!(scale_quantity("3,5 l", 0.5, COMMA), "1,75 l");
        assert_eq!(scale_quantity("1", 0.25, COMMA), "0,25");
    }

    #[test]
    fn scale_passes_free_text_through() {
        assert_eq!(scale_quantity("a pinch", 4.0, COMMA), "a pinch");
        assert_eq!(scale_quantity("  ", 4.0, COMMA), "");
        assert_eq!(scale_quantity("2 eggs", f64::INFINITY, COMMA), "2 eggs");
    }

    #[test]
    fn scale_round_trip_recovers_amount() {
        let cases = [("200 g", 2.0), ("3,5 l", 0.5), ("0.75 kg", 4.0), ("12", 1.5), ("1,25", 3.0)];
        for (qty, factor) in cases {
            let there = scale_quantity(qty, factor, COMMA);
            let back = scale_quantity(&there, 1.0 / factor, COMMA);
            let original = parse_quantity(qty).unwrap();
            let recovered = parse_quantity(&back).unwrap();
            assert!(
                (original.amount - recovered.amount).abs() <= 0.01,
                "{qty} x {factor}: got back {back}"
            );
            assert_eq!(original.tail, recovered.tail);
        }
    }

    #[test]
    fn merge_sums_matching_tails() {
        assert_eq!(merge_quantities("200 g", "300 g", COMMA), "500 g");
        assert_eq!(merge_quantities("1", "2", COMMA), "3");
        assert_eq!(merge_quantities("0,5 l", "0.25 l", COMMA), "0,75 l");
    }

    #[test]
    fn merge_keeps_mismatched_and_free_text() {
        assert_eq!(
            merge_quantities("200 g + a pinch", "1 kg + 100 g", COMMA),
            "300 g + 1 kg + a pinch"
        );
        assert_eq!(merge_quantities("some", "more", COMMA), "some + more");
    }

    #[test]
    fn merge_drops_zero_sums_and_handles_empty_sides() {
        assert_eq!(merge_quantities("2 g", "-2 g", COMMA), "");
        assert_eq!(merge_quantities("2 g + 1", "-2 g", COMMA), "1");
        assert_eq!(merge_quantities("", " 3 l ", COMMA), "3 l");
        assert_eq!(merge_quantities("3 l", "", COMMA), "3 l");
        assert_eq!(merge_quantities("0", "0", COMMA), "");
    }

    #[test]
    fn merge_commutes_for_disjoint_units() {
        let pairs = [
            ("200 g", "1 l"),
            ("2 + a pinch", "3 kg"),
            ("1,5 kg + salt", "2 Stück + pepper"),
        ];
        for (a, b) in pairs {
            assert_eq!(
                fragments(&merge_quantities(a, b, COMMA)),
                fragments(&merge_quantities(b, a, COMMA)),
                "{a} / {b}"
            );
        }
    }

    #[test]
    fn tag_merge_dedups_case_insensitively() {
        let existing = vec!["Vegan".to_string(), "quick".to_string()];
        let merged = merge_tag_sets(&existing, "vegan", 10);
        assert_eq!(merged.outcome, TagOutcome::Duplicate);
        assert_eq!(merged.tags, existing);

        let merged = merge_tag_sets(&existing, " Spicy ", 10);
        assert_eq!(merged.outcome, TagOutcome::Added);
        assert_eq!(merged.tags, vec!["Vegan", "quick", "Spicy"]);
    }

    #[test]
    fn tag_merge_respects_cap() {
        let existing: Vec<String> = DEFAULT_TAGS.iter().map(|t| t.to_string()).collect();
        let merged = merge_tag_sets(&existing, "new", MAX_TAGS_PER_RECIPE);
        assert_eq!(merged.outcome, TagOutcome::AtCapacity);
        assert_eq!(merged.tags.len(), MAX_TAGS_PER_RECIPE);
    }

    #[test]
    fn tag_merge_never_exceeds_cap() {
        let existing: Vec<String> = (0..15).map(|i| format!("t{i}")).collect();
        for max in 0..12 {
            for candidate in ["", "t1", "fresh", "T14"] {
                let merged = merge_tag_sets(&existing, candidate, max);
                assert!(merged.tags.len() <= max, "max {max} candidate {candidate:?}");
            }
        }
        assert_eq!(merge_tag_sets(&[], "x", 0).outcome, TagOutcome::AtCapacity);
        assert_eq!(merge_tag_sets(&[], "  ", 3).outcome, TagOutcome::Invalid);
    }

    #[test]
    fn tag_validation() {
        assert!(is_valid_tag("gluten-free"));
        assert!(is_valid_tag("Mac & Cheese"));
        assert!(!is_valid_tag(""));
        assert!(!is_valid_tag("way-too-long-for-a-tag-chip"));
        assert!(!is_valid_tag("emoji🍕"));
    }
}
