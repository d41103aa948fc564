mod plurals;

pub use plurals::pluralize;

/// `1234567` -> `1,234,567`.
pub fn format_count(value: usize) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().rev().enumerate() {
        if idx > 0 && idx % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out.chars().rev().collect()
}

/// `3 rows`, `1 row`.
pub fn counted(count: usize, singular: &str) -> String {
    format!("{} {}", format_count(count), pluralize(&count, singular, None))
}
