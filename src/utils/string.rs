//! UTF-8 safe string helpers used when writing message content and phone
//! numbers into logs.

/// Return a preview of `s` up to `n` characters. If `s` is longer than `n`
/// characters, the returned string will include a trailing ellipsis `...`.
pub fn preview(s: &str, n: usize) -> String {
    let mut prefix: String = s.chars().take(n).collect();
    if s.chars().count() > n {
        prefix.push_str("...");
    }
    prefix
}

/// Mask all but the last four characters of a phone number or identifier.
///
/// `"393806510543"` becomes `"********0543"`. Inputs of four characters or
/// fewer are returned unchanged.
pub fn mask_phone(phone: &str) -> String {
    let count = phone.chars().count();
    if count <= 4 {
        return phone.to_string();
    }
    phone
        .chars()
        .enumerate()
        .map(|(i, c)| if i < count - 4 { '*' } else { c })
        .collect()
}
