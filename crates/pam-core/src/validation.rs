//! Input validators shared by handlers. Each returns `PamError::Validation` naming the field.

use std::str::FromStr;
use uuid::Uuid;

use crate::error::{PamError, PamResult};

const MAX_TEXT_LEN: usize = 500;

pub fn validate_uuid(field: &str, value: &str) -> PamResult<Uuid> {
    Uuid::parse_str(value.trim())
        .map_err(|_| PamError::validation(format!("{} must be a valid UUID", field)))
}

pub fn validate_positive_number(field: &str, value: f64) -> PamResult<f64> {
    if !value.is_finite() || value <= 0.0 {
        return Err(PamError::validation(format!("{} must be a positive number", field)));
    }
    Ok(value)
}

/// Trimmed, non-empty, bounded text.
pub fn validate_non_empty<'a>(field: &str, value: &'a str) -> PamResult<&'a str> {
    let t = value.trim();
    if t.is_empty() {
        return Err(PamError::validation(format!("{} is required", field)));
    }
    if t.chars().count() > MAX_TEXT_LEN {
        return Err(PamError::validation(format!(
            "{} must be at most {} characters",
            field, MAX_TEXT_LEN
        )));
    }
    Ok(t)
}

pub fn validate_email(field: &str, value: &str) -> PamResult<String> {
    let t = value.trim();
    let invalid = || PamError::validation(format!("{} must be a valid email address", field));
    let (local, domain) = t.split_once('@').ok_or_else(invalid)?;
    if local.is_empty()
        || domain.contains('@')
        || !domain.contains('.')
        || domain.starts_with('.')
        || domain.ends_with('.')
        || t.contains(char::is_whitespace)
    {
        return Err(invalid());
    }
    Ok(t.to_lowercase())
}

/// Parses an enum value case-insensitively; the error lists `allowed`.
pub fn validate_enum<T: FromStr>(field: &str, value: &str, allowed: &[&str]) -> PamResult<T> {
    value.trim().to_lowercase().parse::<T>().map_err(|_| {
        PamError::validation(format!(
            "{} must be one of: {}",
            field,
            allowed.join(", ")
        ))
    })
}

pub fn validate_webhook_url(value: &str) -> PamResult<String> {
    let url = reqwest::Url::parse(value.trim())
        .map_err(|_| PamError::validation("webhook_url must be a valid URL"))?;
    match url.scheme() {
        "http" | "https" => {}
        _ => return Err(PamError::validation("webhook_url must use http or https")),
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(PamError::validation("webhook_url must include a host"));
    }
    Ok(url.to_string())
}

/// Range check for 0.0–1.0 settings (confidence, stability).
pub fn validate_unit_interval(field: &str, value: f32) -> PamResult<f32> {
    if !(0.0..=1.0).contains(&value) {
        return Err(PamError::validation(format!("{} must be between 0.0 and 1.0", field)));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::developer::RateLimitTier;

    #[test]
    fn uuid_accepts_v4_and_rejects_garbage() {
        let id = Uuid::new_v4().to_string();
        assert!(validate_uuid("user_id", &id).is_ok());
        let err = validate_uuid("user_id", "not-a-uuid").unwrap_err();
        assert_eq!(err.to_string(), "user_id must be a valid UUID");
    }

    #[test]
    fn positive_number_rejects_zero_negative_nan() {
        assert_eq!(validate_positive_number("amount", 12.5).unwrap(), 12.5);
        assert!(validate_positive_number("amount", 0.0).is_err());
        assert!(validate_positive_number("amount", -3.0).is_err());
        assert!(validate_positive_number("amount", f64::NAN).is_err());
        assert!(validate_positive_number("amount", f64::INFINITY).is_err());
    }

    #[test]
    fn non_empty_trims() {
        assert_eq!(validate_non_empty("name", "  Trip Bot ").unwrap(), "Trip Bot");
        assert!(validate_non_empty("name", "   ").is_err());
        assert!(validate_non_empty("name", &"x".repeat(501)).is_err());
    }

    #[test]
    fn email_shape() {
        assert_eq!(validate_email("email", " Dev@Example.com ").unwrap(), "dev@example.com");
        assert!(validate_email("email", "dev.example.com").is_err());
        assert!(validate_email("email", "@example.com").is_err());
        assert!(validate_email("email", "dev@localhost").is_err());
        assert!(validate_email("email", "a@b@c.com").is_err());
    }

    #[test]
    fn enum_is_case_insensitive() {
        let tier: RateLimitTier = validate_enum("tier", "PRO", RateLimitTier::NAMES).unwrap();
        assert_eq!(tier, RateLimitTier::Pro);
        let err = validate_enum::<RateLimitTier>("tier", "platinum", RateLimitTier::NAMES).unwrap_err();
        assert!(err.to_string().contains("free, basic, pro, enterprise"));
    }

    #[test]
    fn webhook_url_scheme() {
        assert!(validate_webhook_url("https://hooks.example.com/pam").is_ok());
        assert!(validate_webhook_url("ftp://hooks.example.com").is_err());
        assert!(validate_webhook_url("nonsense").is_err());
    }

    #[test]
    fn unit_interval() {
        assert!(validate_unit_interval("stability", 0.0).is_ok());
        assert!(validate_unit_interval("stability", 1.0).is_ok());
        assert!(validate_unit_interval("stability", 1.01).is_err());
        assert!(validate_unit_interval("stability", -0.1).is_err());
    }
}
