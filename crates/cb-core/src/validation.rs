//! # Input validation
//!
//! Everything here runs before any remote call; a failure blocks the action
//! with a viewer-facing message and never reaches the gateway.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{AppError, Result};

pub const TITLE_MAX_CHARS: usize = 50;
pub const BODY_MAX_CHARS: usize = 2000;
pub const COMMENT_MAX_CHARS: usize = 500;
pub const PRICE_MAX: f64 = 1_000_000.0;

/// Words that block a post or comment outright, in both languages the
/// forum is written in.
pub const SENSITIVE_WORDS: [&str; 10] = [
    "pornography",
    "violence",
    "gambling",
    "fraud",
    "illegal",
    "色情",
    "暴力",
    "赌博",
    "诈骗",
    "违法",
];

static USERNAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_]+$").expect("static regex"));
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("static regex"));

fn reject(message: impl Into<String>) -> AppError {
    AppError::ValidationFailed(message.into())
}

pub fn validate_username(username: &str) -> Result<()> {
    if username.trim().is_empty() {
        return Err(reject("username cannot be empty"));
    }
    let len = username.chars().count();
    if !(2..=20).contains(&len) {
        return Err(reject("username must be between 2 and 20 characters"));
    }
    if !USERNAME_RE.is_match(username) {
        return Err(reject("username may only contain letters, digits and underscores"));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<()> {
    if password.is_empty() {
        return Err(reject("password cannot be empty"));
    }
    if password.chars().count() < 6 {
        return Err(reject("password must be at least 6 characters"));
    }
    let has_letter = password.chars().any(|c| c.is_ascii_alphabetic());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !has_letter || !has_digit {
        return Err(reject("password must contain both letters and digits"));
    }
    Ok(())
}

pub fn validate_email(email: &str) -> Result<()> {
    if email.trim().is_empty() {
        return Err(reject("email cannot be empty"));
    }
    if !EMAIL_RE.is_match(email) {
        return Err(reject("please enter a valid email address"));
    }
    Ok(())
}

pub fn validate_title(title: &str) -> Result<()> {
    if title.trim().is_empty() {
        return Err(reject("title cannot be empty"));
    }
    if title.chars().count() > TITLE_MAX_CHARS {
        return Err(reject(format!("title cannot exceed {TITLE_MAX_CHARS} characters")));
    }
    Ok(())
}

pub fn validate_body(body: &str) -> Result<()> {
    if body.trim().is_empty() {
        return Err(reject("content cannot be empty"));
    }
    if body.chars().count() > BODY_MAX_CHARS {
        return Err(reject(format!("content cannot exceed {BODY_MAX_CHARS} characters")));
    }
    check_sensitive(body)
}

pub fn validate_comment(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(reject("comment cannot be empty"));
    }
    if content.chars().count() > COMMENT_MAX_CHARS {
        return Err(reject(format!("comment cannot exceed {COMMENT_MAX_CHARS} characters")));
    }
    check_sensitive(content)
}

fn check_sensitive(text: &str) -> Result<()> {
    let lowered = text.to_lowercase();
    if SENSITIVE_WORDS.iter().any(|w| lowered.contains(w)) {
        return Err(reject("content contains a blocked word, please revise it"));
    }
    Ok(())
}

/// Parses and range-checks a marketplace price.
pub fn validate_price(raw: &str) -> Result<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(reject("price cannot be empty"));
    }
    let price: f64 = raw.parse().map_err(|_| reject("please enter a valid price"))?;
    if !price.is_finite() {
        return Err(reject("please enter a valid price"));
    }
    if price < 0.0 {
        return Err(reject("price cannot be negative"));
    }
    if price > PRICE_MAX {
        return Err(reject("price cannot exceed 1000000"));
    }
    Ok(price)
}

/// Escapes HTML and turns newlines into `<br>` for display.
pub fn sanitize_input(raw: &str) -> String {
    html_escape::encode_quoted_attribute(raw).replace('\n', "<br>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_length_boundary() {
        assert!(validate_title(&"a".repeat(50)).is_ok());
        let err = validate_title(&"a".repeat(51)).unwrap_err();
        assert!(matches!(err, AppError::ValidationFailed(_)));
        assert!(validate_title("   ").is_err());
    }

    #[test]
    fn test_title_counts_characters_not_bytes() {
        assert!(validate_title(&"é".repeat(50)).is_ok());
    }

    #[test]
    fn test_body_rules() {
        assert!(validate_body("Lost my umbrella near the library").is_ok());
        assert!(validate_body(&"x".repeat(2001)).is_err());
        assert!(validate_body("Join our Gambling night").is_err());
    }

    #[test]
    fn test_chinese_blocked_words() {
        assert!(validate_body("周末一起去图书馆自习").is_ok());
        assert!(validate_body("宿舍楼下有人组织赌博活动").is_err());
        assert!(validate_comment("这是诈骗链接").is_err());
    }

    #[test]
    fn test_username_rules() {
        assert!(validate_username("li_wei_01").is_ok());
        assert!(validate_username("a").is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username(&"a".repeat(21)).is_err());
    }

    #[test]
    fn test_password_needs_letter_and_digit() {
        assert!(validate_password("abc123").is_ok());
        assert!(validate_password("abcdef").is_err());
        assert!(validate_password("12345").is_err());
    }

    #[test]
    fn test_email_shape() {
        assert!(validate_email("someone@campus.edu").is_ok());
        assert!(validate_email("someone@campus").is_err());
    }

    #[test]
    fn test_price_parsing() {
        assert_eq!(validate_price(" 12.5 ").unwrap(), 12.5);
        assert!(validate_price("").is_err());
        assert!(validate_price("abc").is_err());
        assert!(validate_price("-1").is_err());
        assert!(validate_price("1000000.01").is_err());
        assert!(validate_price("NaN").is_err());
    }

    #[test]
    fn test_sanitize_escapes_and_breaks_lines() {
        let out = sanitize_input("<b>hi</b>\n\"x\"");
        assert!(out.starts_with("&lt;b&gt;hi&lt;/b&gt;<br>"));
        assert!(!out.contains('"'));
    }
}
