/// Turn a raw classifier label into a nutrition search term.
///
/// Keeps the text before the first comma ("burrito, wrap" -> "burrito"),
/// drops every digit, then trims. Idempotent.
pub fn normalize(raw_label: &str) -> String {
    let head = raw_label.split(',').next().unwrap_or_default();
    let without_digits: String = head.chars().filter(|c| !c.is_numeric()).collect();
    without_digits.trim().to_string()
}
