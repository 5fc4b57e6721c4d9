/// Normalize raw OCR output: drop whitespace and punctuation, uppercase.
///
/// Idempotent: cleaning an already clean string returns it unchanged.
pub fn clean_plate_text(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Whether a cleaned string has a plausible plate length
pub fn is_valid_length(text: &str, min_len: usize, max_len: usize) -> bool {
    let len = text.chars().count();
    len >= min_len && len <= max_len
}

/// Letters and digits mixed, which nearly every plate format requires
pub fn has_letter_digit_mix(text: &str) -> bool {
    text.chars().any(|c| c.is_ascii_alphabetic()) && text.chars().any(|c| c.is_ascii_digit())
}
