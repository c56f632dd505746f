/// Strip everything but letters and digits from an identifier or phone number.
pub fn normalize_id(raw: &str) -> String {
    raw.chars().filter(|c| c.is_alphanumeric()).collect()
}

/// Session key for an SMS thread. `None` when nothing identifying remains.
pub fn session_key(phone_number: &str) -> Option<String> {
    let key = normalize_id(phone_number);
    if key.is_empty() { None } else { Some(key) }
}

/// An 11-digit mobile number starting with `1`.
pub fn is_mobile_number(value: &str) -> bool {
    value.len() == 11 && value.starts_with('1') && value.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_id_strips_separators() {
        assert_eq!(normalize_id(" 138-0013 8000 "), "13800138000");
        assert_eq!(normalize_id("+86 (138)"), "86138");
    }

    #[test]
    fn session_key_rejects_empty() {
        assert_eq!(session_key("  - "), None);
        assert_eq!(session_key("138 0013 8000").as_deref(), Some("13800138000"));
    }

    #[test]
    fn mobile_number_shape() {
        assert!(is_mobile_number("13800138000"));
        assert!(!is_mobile_number("23800138000"));
        assert!(!is_mobile_number("1380013800"));
        assert!(!is_mobile_number("1380013800a"));
    }
}
