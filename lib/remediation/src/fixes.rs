//! Payload fixes for `fix_and_retry` and `reduce_and_retry`.
//!
//! Each fix is a pure function over the JSON payload. A fix either changes
//! the payload (`Ok(Some(description))`), finds nothing to change
//! (`Ok(None)`), or reports that the payload cannot be repaired.

use crate::classifier::Fix;
use crate::error::FixError;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Twilio SMS body limit in characters.
pub const TWILIO_BODY_LIMIT: usize = 1600;
/// SES subject limit in characters.
pub const SES_SUBJECT_LIMIT: usize = 200;
/// Body limit for every other provider.
pub const DEFAULT_BODY_LIMIT: usize = 50_000;
/// Largest batch kept by `reduce_batch`.
pub const MAX_BATCH_SIZE: usize = 10;

const TRUNCATION_SUFFIX: &str = "...";
const DEFAULT_COUNTRY_CODE: &str = "1";

const PHONE_FIELDS: &[&str] = &["phone", "to", "phone_number", "recipient", "to_number"];
const EMAIL_FIELDS: &[&str] = &["email", "to", "to_email", "from", "reply_to"];
const BODY_FIELDS: &[&str] = &["body", "message", "content", "text", "message_body"];
const HTML_FIELDS: &[&str] = &["html", "body_html", "html_body", "body", "content"];
const ATTACHMENT_FIELDS: &[&str] = &["attachments", "files", "media_url", "media_urls"];
const BATCH_FIELDS: &[&str] = &["recipients", "to", "contacts", "items"];

static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$")
        .expect("email pattern is a valid regular expression")
});

static DANGEROUS_ELEMENTS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    ["script", "style", "iframe", "object", "embed"]
        .iter()
        .flat_map(|tag| {
            [
                format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>"),
                format!(r"(?i)<{tag}\b[^>]*/?>"),
            ]
        })
        .map(|pattern| Regex::new(&pattern).expect("element pattern is a valid regular expression"))
        .collect()
});

static EVENT_HANDLERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\s+on[a-z]+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#)
        .expect("handler pattern is a valid regular expression")
});

/// Outcome of applying a list of fixes.
#[derive(Debug, Clone, PartialEq)]
pub struct RemediationResult {
    /// No fix failed.
    pub success: bool,
    /// The payload after every successful fix.
    pub payload: Map<String, Value>,
    /// Fixes that changed the payload.
    pub fixes_applied: Vec<Fix>,
    /// Fixes that could not be applied.
    pub fixes_failed: Vec<(Fix, FixError)>,
    /// Human-readable change descriptions.
    pub changes: Vec<String>,
}

impl RemediationResult {
    /// Returns true if the payload is worth re-injecting.
    #[must_use]
    pub fn is_actionable(&self) -> bool {
        self.success && !self.fixes_applied.is_empty()
    }
}

/// Applies `fixes` in order to a copy of `payload`.
///
/// A failed fix leaves the payload as it was before that fix and does not
/// stop the remaining fixes.
#[must_use]
pub fn apply_fixes(
    payload: &Map<String, Value>,
    fixes: &[Fix],
    provider: Option<&str>,
) -> RemediationResult {
    let mut current = payload.clone();
    let mut fixes_applied = Vec::new();
    let mut fixes_failed = Vec::new();
    let mut changes = Vec::new();

    for &fix in fixes {
        let mut candidate = current.clone();
        match apply_fix(fix, &mut candidate, provider) {
            Ok(Some(change)) => {
                debug!(%fix, %change, "fix applied");
                current = candidate;
                fixes_applied.push(fix);
                changes.push(change);
            }
            Ok(None) => debug!(%fix, "fix made no changes"),
            Err(err) => {
                warn!(%fix, error = %err, "fix failed");
                fixes_failed.push((fix, err));
            }
        }
    }

    RemediationResult {
        success: fixes_failed.is_empty(),
        payload: current,
        fixes_applied,
        fixes_failed,
        changes,
    }
}

/// Applies a single fix in place.
///
/// # Errors
///
/// Returns an error if the payload cannot be repaired by this fix.
pub fn apply_fix(
    fix: Fix,
    payload: &mut Map<String, Value>,
    provider: Option<&str>,
) -> Result<Option<String>, FixError> {
    match fix {
        Fix::PhoneE164 => fix_phone_e164(payload),
        Fix::EmailNormalize => fix_email_normalize(payload),
        Fix::TruncateBody => Ok(fix_truncate_body(payload, provider)),
        Fix::SanitizeHtml => Ok(fix_sanitize_html(payload)),
        Fix::StripAttachments => Ok(fix_strip_attachments(payload)),
        Fix::RefreshToken => Ok(fix_refresh_token(payload)),
        Fix::ReduceBatch => Ok(fix_reduce_batch(payload, MAX_BATCH_SIZE)),
    }
}

/// Formats a phone number as E.164, assuming North America for bare
/// ten-digit numbers.
#[must_use]
pub fn format_e164(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let has_plus = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();

    if digits.is_empty() || digits.starts_with('0') {
        return None;
    }
    if has_plus {
        return (8..=15).contains(&digits.len()).then(|| format!("+{digits}"));
    }
    match digits.len() {
        10 => Some(format!("+{DEFAULT_COUNTRY_CODE}{digits}")),
        11..=15 => Some(format!("+{digits}")),
        _ => None,
    }
}

/// Normalizes an email address, or returns `None` if it is not one.
#[must_use]
pub fn normalize_email(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase();
    let email = lowered.strip_prefix("mailto:").unwrap_or(&lowered).trim();
    EMAIL_PATTERN.is_match(email).then(|| email.to_string())
}

/// Truncates to `limit` characters including the `...` suffix.
///
/// Returns `None` when the content already fits.
#[must_use]
pub fn truncate(content: &str, limit: usize) -> Option<String> {
    if content.chars().count() <= limit {
        return None;
    }
    let keep = limit.saturating_sub(TRUNCATION_SUFFIX.len());
    let mut truncated: String = content.chars().take(keep).collect();
    truncated.push_str(TRUNCATION_SUFFIX);
    Some(truncated)
}

/// Removes active content from HTML.
#[must_use]
pub fn sanitize_html(content: &str) -> String {
    let mut cleaned = content.to_string();
    for pattern in DANGEROUS_ELEMENTS.iter() {
        cleaned = pattern.replace_all(&cleaned, "").into_owned();
    }
    EVENT_HANDLERS.replace_all(&cleaned, "").into_owned()
}

fn string_fields<'a>(
    payload: &'a Map<String, Value>,
    fields: &'a [&'a str],
) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
    fields
        .iter()
        .filter_map(move |f| payload.get(*f).and_then(Value::as_str).map(|v| (*f, v)))
}

fn fix_phone_e164(payload: &mut Map<String, Value>) -> Result<Option<String>, FixError> {
    let mut updates = Vec::new();
    let mut invalid = None;
    let mut seen = false;

    for (field, value) in string_fields(payload, PHONE_FIELDS) {
        if value.contains('@') {
            continue;
        }
        seen = true;
        match format_e164(value) {
            Some(formatted) if formatted != value => updates.push((field.to_string(), value.to_string(), formatted)),
            Some(_) => {}
            None => {
                invalid.get_or_insert_with(|| (field.to_string(), value.to_string()));
            }
        }
    }

    if updates.is_empty() {
        if let Some((field, value)) = invalid {
            return Err(FixError::InvalidValue {
                fix: Fix::PhoneE164,
                field,
                value,
            });
        }
        if !seen {
            return Err(FixError::NoMatchingField { fix: Fix::PhoneE164 });
        }
        return Ok(None);
    }

    let changes: Vec<String> = updates
        .into_iter()
        .map(|(field, old, new)| {
            let change = format!("Formatted {field}: {old} -> {new}");
            payload.insert(field, Value::String(new));
            change
        })
        .collect();
    Ok(Some(changes.join("; ")))
}

fn fix_email_normalize(payload: &mut Map<String, Value>) -> Result<Option<String>, FixError> {
    let mut updates = Vec::new();
    let mut seen = false;

    for (field, value) in string_fields(payload, EMAIL_FIELDS) {
        if !value.contains('@') {
            continue;
        }
        seen = true;
        match normalize_email(value) {
            Some(normalized) if normalized != value => {
                updates.push((field.to_string(), value.to_string(), normalized));
            }
            Some(_) => {}
            None => {
                return Err(FixError::InvalidValue {
                    fix: Fix::EmailNormalize,
                    field: field.to_string(),
                    value: value.to_string(),
                });
            }
        }
    }

    if !seen {
        return Err(FixError::NoMatchingField {
            fix: Fix::EmailNormalize,
        });
    }
    if updates.is_empty() {
        return Ok(None);
    }

    let changes: Vec<String> = updates
        .into_iter()
        .map(|(field, old, new)| {
            let change = format!("Normalized {field}: {old} -> {new}");
            payload.insert(field, Value::String(new));
            change
        })
        .collect();
    Ok(Some(changes.join("; ")))
}

fn fix_truncate_body(payload: &mut Map<String, Value>, provider: Option<&str>) -> Option<String> {
    let provider = provider.map(str::to_ascii_lowercase);
    let body_limit = match provider.as_deref() {
        Some("twilio") => TWILIO_BODY_LIMIT,
        _ => DEFAULT_BODY_LIMIT,
    };

    let mut targets: Vec<(&str, usize)> = BODY_FIELDS.iter().map(|f| (*f, body_limit)).collect();
    if provider.as_deref() == Some("ses") {
        targets.push(("subject", SES_SUBJECT_LIMIT));
    }

    let mut changes = Vec::new();
    for (field, limit) in targets {
        let Some(original) = payload.get(field).and_then(Value::as_str) else {
            continue;
        };
        let original_len = original.chars().count();
        if let Some(truncated) = truncate(original, limit) {
            payload.insert(field.to_string(), Value::String(truncated));
            changes.push(format!("Trimmed {field} from {original_len} to {limit} chars"));
        }
    }

    (!changes.is_empty()).then(|| changes.join("; "))
}

fn fix_sanitize_html(payload: &mut Map<String, Value>) -> Option<String> {
    let mut changes = Vec::new();
    for field in HTML_FIELDS {
        let Some(original) = payload.get(*field).and_then(Value::as_str) else {
            continue;
        };
        let cleaned = sanitize_html(original);
        if cleaned != original {
            payload.insert((*field).to_string(), Value::String(cleaned));
            changes.push(format!("Sanitized HTML in {field}"));
        }
    }
    (!changes.is_empty()).then(|| changes.join("; "))
}

fn fix_strip_attachments(payload: &mut Map<String, Value>) -> Option<String> {
    let removed: Vec<&str> = ATTACHMENT_FIELDS
        .iter()
        .copied()
        .filter(|f| payload.remove(*f).is_some())
        .collect();
    (!removed.is_empty()).then(|| format!("Removed {}", removed.join(", ")))
}

fn fix_refresh_token(payload: &mut Map<String, Value>) -> Option<String> {
    payload.insert("_refresh_token".to_string(), Value::Bool(true));
    Some("Marked credentials for refresh".to_string())
}

fn fix_reduce_batch(payload: &mut Map<String, Value>, max_size: usize) -> Option<String> {
    for field in BATCH_FIELDS {
        let Some(Value::Array(items)) = payload.get_mut(*field) else {
            continue;
        };
        if items.len() <= max_size {
            continue;
        }
        let original_len = items.len();
        let remainder = items.split_off(max_size);
        payload.insert("_remaining_batch".to_string(), Value::Array(remainder));
        return Some(format!("Reduced {field} from {original_len} to {max_size}"));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn e164_formatting() {
        assert_eq!(format_e164("(555) 123-4567").as_deref(), Some("+15551234567"));
        assert_eq!(format_e164("1-555-123-4567").as_deref(), Some("+15551234567"));
        assert_eq!(format_e164("+44 20 7946 0958").as_deref(), Some("+442079460958"));
        assert_eq!(format_e164("12345"), None);
        assert_eq!(format_e164("+0123456789"), None);
        assert_eq!(format_e164(""), None);
    }

    #[test]
    fn phone_fix_rewrites_and_skips_email_recipients() {
        let p = payload(json!({"to": "555.123.4567", "recipient": "a@b.com"}));
        let result = apply_fixes(&p, &[Fix::PhoneE164], Some("twilio"));

        assert!(result.is_actionable());
        assert_eq!(result.payload["to"], "+15551234567");
        assert_eq!(result.payload["recipient"], "a@b.com");
        assert_eq!(result.fixes_applied, vec![Fix::PhoneE164]);
    }

    #[test]
    fn phone_fix_fails_without_a_repairable_number() {
        let result = apply_fixes(&payload(json!({"to": "12"})), &[Fix::PhoneE164], None);
        assert!(!result.success);
        assert!(matches!(
            result.fixes_failed.as_slice(),
            [(Fix::PhoneE164, FixError::InvalidValue { .. })]
        ));

        let result = apply_fixes(&payload(json!({"body": "hi"})), &[Fix::PhoneE164], None);
        assert!(matches!(
            result.fixes_failed.as_slice(),
            [(Fix::PhoneE164, FixError::NoMatchingField { .. })]
        ));
    }

    #[test]
    fn email_normalization() {
        assert_eq!(
            normalize_email("  mailto:Jane.Doe@Example.COM ").as_deref(),
            Some("jane.doe@example.com")
        );
        assert_eq!(normalize_email("not-an-email@"), None);

        let p = payload(json!({"to": "Jane@Example.com", "from": "ops@example.com"}));
        let result = apply_fixes(&p, &[Fix::EmailNormalize], Some("ses"));
        assert!(result.is_actionable());
        assert_eq!(result.payload["to"], "jane@example.com");
        assert_eq!(result.changes.len(), 1);
    }

    #[test]
    fn truncation_respects_provider_limits_and_char_boundaries() {
        let body = "é".repeat(2000);
        let p = payload(json!({"body": body, "subject": "s".repeat(300)}));

        let twilio = apply_fixes(&p, &[Fix::TruncateBody], Some("twilio"));
        let trimmed = twilio.payload["body"].as_str().expect("body");
        assert_eq!(trimmed.chars().count(), TWILIO_BODY_LIMIT);
        assert!(trimmed.ends_with("..."));
        assert_eq!(twilio.payload["subject"].as_str().map(str::len), Some(300));

        let ses = apply_fixes(&p, &[Fix::TruncateBody], Some("ses"));
        assert_eq!(
            ses.payload["subject"].as_str().map(|s| s.chars().count()),
            Some(SES_SUBJECT_LIMIT)
        );
        assert_eq!(ses.payload["body"].as_str().map(|s| s.chars().count()), Some(2000));
    }

    #[test]
    fn short_body_is_not_a_change() {
        let result = apply_fixes(&payload(json!({"body": "hello"})), &[Fix::TruncateBody], Some("twilio"));
        assert!(result.success);
        assert!(!result.is_actionable());
    }

    #[test]
    fn html_sanitizer_removes_active_content() {
        let html = r#"<p onclick="steal()">Hi</p><script type="text/javascript">alert(1)</script><iframe src="x"></iframe><embed src="y">"#;
        assert_eq!(sanitize_html(html), "<p>Hi</p>");

        let result = apply_fixes(&payload(json!({"html": html})), &[Fix::SanitizeHtml], None);
        assert_eq!(result.changes, vec!["Sanitized HTML in html".to_string()]);
    }

    #[test]
    fn batch_reduction_keeps_remainder() {
        let items: Vec<u32> = (0..15).collect();
        let result = apply_fixes(&payload(json!({"recipients": items})), &[Fix::ReduceBatch], None);

        assert_eq!(result.payload["recipients"].as_array().map(Vec::len), Some(10));
        assert_eq!(result.payload["_remaining_batch"], json!([10, 11, 12, 13, 14]));
    }

    #[test]
    fn attachments_and_token_refresh() {
        let p = payload(json!({"attachments": [1], "media_url": "https://x"}));
        let result = apply_fixes(&p, &[Fix::StripAttachments, Fix::RefreshToken], None);

        assert!(result.is_actionable());
        assert!(!result.payload.contains_key("attachments"));
        assert!(!result.payload.contains_key("media_url"));
        assert_eq!(result.payload["_refresh_token"], true);
        assert_eq!(result.fixes_applied, vec![Fix::StripAttachments, Fix::RefreshToken]);
    }

    #[test]
    fn failed_fix_does_not_block_later_fixes() {
        let p = payload(json!({"to": "12", "body": "x".repeat(60_000)}));
        let result = apply_fixes(&p, &[Fix::PhoneE164, Fix::TruncateBody], None);

        assert!(!result.success);
        assert!(!result.is_actionable());
        assert_eq!(result.fixes_applied, vec![Fix::TruncateBody]);
        assert_eq!(result.payload["to"], "12");
    }
}
