use std::sync::OnceLock;

use regex::Regex;
use uuid::Uuid;

use crate::error::AppError;

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("static regex"))
}

fn username_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]{3,30}$").expect("static regex"))
}

/// Trimmed length check, counted in characters.
pub fn require_len(field: &str, value: &str, min: usize, max: usize) -> Result<(), AppError> {
    let len = value.trim().chars().count();
    if len < min {
        if min == 1 {
            return Err(AppError::validation(format!("{} is required", field)));
        }
        return Err(AppError::validation(format!(
            "{} must be at least {} characters",
            field, min
        )));
    }
    if len > max {
        return Err(AppError::validation(format!(
            "{} must be at most {} characters",
            field, max
        )));
    }
    Ok(())
}

pub fn validate_email(email: &str) -> Result<(), AppError> {
    if email_re().is_match(email.trim()) {
        Ok(())
    } else {
        Err(AppError::validation("Please provide a valid email"))
    }
}

pub fn validate_username(username: &str) -> Result<(), AppError> {
    if username_re().is_match(username) {
        Ok(())
    } else {
        Err(AppError::validation(
            "Username must be 3-30 characters of letters, digits or underscores",
        ))
    }
}

pub fn validate_password(password: &str) -> Result<(), AppError> {
    if password.chars().count() < 8 {
        return Err(AppError::validation("Password must be at least 8 characters"));
    }
    let has_letter = password.chars().any(|c| c.is_alphabetic());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !has_letter || !has_digit {
        return Err(AppError::validation(
            "Password must contain at least one letter and one number",
        ));
    }
    Ok(())
}

/// Ids are UUID strings; anything else is rejected before it reaches a query.
pub fn parse_id(raw: &str) -> Result<String, AppError> {
    Uuid::parse_str(raw)
        .map(|id| id.to_string())
        .map_err(|_| AppError::InvalidId(raw.to_string()))
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_validation() {
        assert!(validate_email("dev@example.com").is_ok());
        assert!(validate_email("  dev@example.com ").is_ok());
        assert!(validate_email("dev@example").is_err());
        assert!(validate_email("no at sign.com").is_err());
    }

    #[test]
    fn username_validation() {
        assert!(validate_username("jane_doe42").is_ok());
        assert!(validate_username("jd").is_err());
        assert!(validate_username("has space").is_err());
    }

    #[test]
    fn password_needs_letters_and_digits() {
        assert!(validate_password("abcdefg1").is_ok());
        assert!(validate_password("abcdefgh").is_err());
        assert!(validate_password("12345678").is_err());
        assert!(validate_password("a1").is_err());
    }

    #[test]
    fn require_len_messages() {
        let err = require_len("Title", "   ", 1, 10).unwrap_err();
        assert_eq!(err.to_string(), "Title is required");
        let err = require_len("Title", "abcdefghijk", 1, 10).unwrap_err();
        assert_eq!(err.to_string(), "Title must be at most 10 characters");
    }

    #[test]
    fn parse_id_normalizes_case() {
        let id = parse_id("9F1C2A6E-3B7D-4C1A-9E2B-1234567890AB").unwrap();
        assert_eq!(id, "9f1c2a6e-3b7d-4c1a-9e2b-1234567890ab");
        assert!(matches!(parse_id("not-an-id"), Err(AppError::InvalidId(_))));
    }
}
