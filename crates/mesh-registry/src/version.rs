//! Semantic version ordering
//!
//! Versions are compared by alternating runs of digits and non-digits.
//! Digit runs compare numerically so `1.10` sorts above `1.2`, non-digit
//! runs compare lexically. A version containing `SNAPSHOT` sorts below the
//! same version without it.

use std::cmp::Ordering;

/// Compare two version strings, `SNAPSHOT` aware
pub fn version_cmp(a: &str, b: &str) -> Ordering {
    let (a_base, a_snapshot) = strip_snapshot(a);
    let (b_base, b_snapshot) = strip_snapshot(b);
    semantic_cmp(&a_base, &b_base).then(match (a_snapshot, b_snapshot) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => Ordering::Equal,
    })
}

/// Compare two strings by digit and non-digit runs
pub fn semantic_cmp(a: &str, b: &str) -> Ordering {
    let a_runs = split_runs(a);
    let b_runs = split_runs(b);
    for (ra, rb) in a_runs.iter().zip(b_runs.iter()) {
        let ordering = compare_runs(ra, rb);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a_runs.len().cmp(&b_runs.len())
}

fn compare_runs(a: &str, b: &str) -> Ordering {
    let a_numeric = a.chars().all(|c| c.is_ascii_digit());
    let b_numeric = b.chars().all(|c| c.is_ascii_digit());
    if a_numeric && b_numeric {
        let a_digits = a.trim_start_matches('0');
        let b_digits = b.trim_start_matches('0');
        a_digits
            .len()
            .cmp(&b_digits.len())
            .then_with(|| a_digits.cmp(b_digits))
    } else {
        a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase())
    }
}

fn split_runs(text: &str) -> Vec<&str> {
    let mut runs = Vec::new();
    let mut start = 0;
    let mut last_numeric = None;
    for (i, c) in text.char_indices() {
        let numeric = c.is_ascii_digit();
        if let Some(last) = last_numeric {
            if last != numeric {
                runs.push(&text[start..i]);
                start = i;
            }
        }
        last_numeric = Some(numeric);
    }
    if start < text.len() {
        runs.push(&text[start..]);
    }
    runs
}

fn strip_snapshot(version: &str) -> (String, bool) {
    let lower = version.to_ascii_lowercase();
    match lower.find("snapshot") {
        Some(pos) => {
            let mut base = String::new();
            let before = &version[..pos];
            base.push_str(before.strip_suffix('-').unwrap_or(before));
            base.push_str(&version[pos + "snapshot".len()..]);
            (base, true)
        }
        None => (version.to_string(), false),
    }
}
