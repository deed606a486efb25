//! Error classification for dead-lettered executions.
//!
//! Classification is a pure function of the error text, an optional error
//! code and an optional provider name:
//!
//! 1. Provider code tables (twilio, ses, bedrock) win when both the provider
//!    and the code are known.
//! 2. Otherwise the first matching message pattern decides.
//! 3. Anything else is `unknown` and goes to a human.

use amber_relay_core::ErrorSurface;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Broad error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network blips, throttling. Always retryable.
    Transient,
    /// The provider rejected the request; the payload may be fixable.
    ProviderError,
    /// Invalid recipient or unsupported operation. Never retryable.
    Permanent,
    /// Missing or expired credentials, unverified senders.
    Configuration,
    /// No rule matched.
    Unknown,
}

impl ErrorCategory {
    /// Snake-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::ProviderError => "provider_error",
            Self::Permanent => "permanent",
            Self::Configuration => "configuration",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the pipeline should do with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    RetryWithBackoff,
    FixAndRetry,
    ReduceAndRetry,
    RefreshAndRetry,
    Discard,
    Alert,
}

impl RecoveryAction {
    /// Snake-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::RetryWithBackoff => "retry_with_backoff",
            Self::FixAndRetry => "fix_and_retry",
            Self::ReduceAndRetry => "reduce_and_retry",
            Self::RefreshAndRetry => "refresh_and_retry",
            Self::Discard => "discard",
            Self::Alert => "alert",
        }
    }

    /// Returns true if the action re-injects the payload.
    #[must_use]
    pub const fn is_retry(&self) -> bool {
        !matches!(self, Self::Discard | Self::Alert)
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payload repair, applied by [`crate::fixes::apply_fixes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fix {
    PhoneE164,
    EmailNormalize,
    #[serde(alias = "trim_payload")]
    TruncateBody,
    SanitizeHtml,
    StripAttachments,
    RefreshToken,
    ReduceBatch,
}

impl Fix {
    /// Snake-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PhoneE164 => "phone_e164",
            Self::EmailNormalize => "email_normalize",
            Self::TruncateBody => "truncate_body",
            Self::SanitizeHtml => "sanitize_html",
            Self::StripAttachments => "strip_attachments",
            Self::RefreshToken => "refresh_token",
            Self::ReduceBatch => "reduce_batch",
        }
    }
}

impl fmt::Display for Fix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Confidence assigned to provider code matches.
pub const CODE_CONFIDENCE: f64 = 0.95;
/// Confidence assigned to message pattern matches.
pub const PATTERN_CONFIDENCE: f64 = 0.8;
/// Confidence assigned to unclassified errors.
pub const UNKNOWN_CONFIDENCE: f64 = 0.3;

/// The classifier's verdict for one error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub action: RecoveryAction,
    /// 0.0 to 1.0.
    pub confidence: f64,
    pub reason: String,
    /// Fixes to apply, in order.
    pub fixes: Vec<Fix>,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub provider: Option<String>,
    pub error_code: Option<String>,
}

impl ErrorClassification {
    fn from_rule(
        category: ErrorCategory,
        action: RecoveryAction,
        reason: &str,
        fixes: &[Fix],
        confidence: f64,
    ) -> Self {
        Self {
            category,
            action,
            confidence,
            reason: reason.to_string(),
            fixes: fixes.to_vec(),
            max_retries: max_retries_for(category),
            retry_delay_seconds: retry_delay_for(category, action),
            provider: None,
            error_code: None,
        }
    }

    /// Returns true if the recommended action re-injects the payload.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.action.is_retry()
    }

    /// How this failure looks to a user-facing caller.
    #[must_use]
    pub fn surface(&self) -> ErrorSurface {
        match (self.category, self.action) {
            (ErrorCategory::Transient, RecoveryAction::RetryWithBackoff) => ErrorSurface::RateLimited,
            (ErrorCategory::Configuration, _) => ErrorSurface::CapabilityUnavailable,
            (ErrorCategory::ProviderError, _) => ErrorSurface::ContentRejected,
            _ => ErrorSurface::Internal,
        }
    }

    /// HTTP status equivalent of [`Self::surface`].
    #[must_use]
    pub fn http_status(&self) -> u16 {
        self.surface().status_code()
    }
}

/// Retry budget by category.
#[must_use]
pub const fn max_retries_for(category: ErrorCategory) -> u32 {
    match category {
        ErrorCategory::Transient => 5,
        ErrorCategory::ProviderError => 3,
        _ => 1,
    }
}

/// Base re-injection delay by category and action.
#[must_use]
pub const fn retry_delay_for(category: ErrorCategory, action: RecoveryAction) -> u64 {
    match (category, action) {
        (ErrorCategory::Transient, RecoveryAction::RetryWithBackoff) => 60,
        (ErrorCategory::Transient, _) => 30,
        (ErrorCategory::ProviderError, _) => 10,
        _ => 300,
    }
}

struct CodeRule {
    provider: &'static str,
    code: &'static str,
    category: ErrorCategory,
    action: RecoveryAction,
    reason: &'static str,
    fixes: &'static [Fix],
}

const fn code(
    provider: &'static str,
    code: &'static str,
    category: ErrorCategory,
    action: RecoveryAction,
    reason: &'static str,
    fixes: &'static [Fix],
) -> CodeRule {
    CodeRule {
        provider,
        code,
        category,
        action,
        reason,
        fixes,
    }
}

use ErrorCategory::{Configuration, Permanent, ProviderError, Transient};
use RecoveryAction::{
    Alert, Discard, FixAndRetry, ReduceAndRetry, RefreshAndRetry, Retry, RetryWithBackoff,
};

const CODE_RULES: &[CodeRule] = &[
    code("twilio", "21211", Permanent, Discard, "Invalid phone number", &[]),
    code("twilio", "21614", Permanent, Discard, "Number is not a mobile number", &[]),
    code("twilio", "30003", Transient, RetryWithBackoff, "Unreachable destination", &[]),
    code("twilio", "30004", Permanent, Discard, "Message blocked", &[]),
    code("twilio", "30005", Permanent, Discard, "Unknown destination", &[]),
    code("twilio", "30006", Permanent, Discard, "Landline not supported", &[]),
    code("twilio", "30007", ProviderError, Alert, "Carrier filtered message", &[]),
    code("twilio", "20003", Configuration, RefreshAndRetry, "Authentication failed", &[]),
    code("twilio", "20008", Transient, RetryWithBackoff, "Rate limit exceeded", &[]),
    code("twilio", "21617", ProviderError, FixAndRetry, "Message body too long", &[Fix::TruncateBody]),
    code("ses", "MessageRejected", ProviderError, FixAndRetry, "Email rejected by SES", &[Fix::SanitizeHtml]),
    code("ses", "MailFromDomainNotVerified", Configuration, Alert, "Sending domain not verified", &[]),
    code("ses", "ConfigurationSetDoesNotExist", Configuration, Alert, "Configuration set missing", &[]),
    code("ses", "AccountSendingPaused", Configuration, Alert, "SES sending paused", &[]),
    code("ses", "Throttling", Transient, RetryWithBackoff, "SES throttling", &[]),
    code("ses", "InvalidParameterValue", ProviderError, FixAndRetry, "Invalid email parameter", &[Fix::EmailNormalize]),
    code("bedrock", "ThrottlingException", Transient, RetryWithBackoff, "Bedrock throttling", &[]),
    code("bedrock", "ServiceQuotaExceededException", Transient, RetryWithBackoff, "Bedrock quota exceeded", &[]),
    code("bedrock", "ModelTimeoutException", Transient, RetryWithBackoff, "Model timeout", &[]),
    code("bedrock", "ValidationException", ProviderError, ReduceAndRetry, "Bedrock rejected the prompt", &[Fix::TruncateBody]),
    code("bedrock", "AccessDeniedException", Configuration, RefreshAndRetry, "Bedrock access denied", &[Fix::RefreshToken]),
];

struct PatternRule {
    pattern: &'static str,
    category: ErrorCategory,
    action: RecoveryAction,
    reason: &'static str,
    fixes: &'static [Fix],
}

// Order matters: the first match wins.
const PATTERN_RULES: &[PatternRule] = &[
    PatternRule {
        pattern: r"timeout|timed out|deadline exceeded|connection (refused|reset|closed)|temporarily unavailable|service unavailable|internal server error|bad gateway|\b50[0234]\b",
        category: Transient,
        action: Retry,
        reason: "Transient network or server error",
        fixes: &[],
    },
    PatternRule {
        pattern: r"throttl|rate limit|rate exceeded|too many requests|\b429\b|quota exceeded",
        category: Transient,
        action: RetryWithBackoff,
        reason: "Rate limited",
        fixes: &[],
    },
    PatternRule {
        pattern: r"invalid phone|phone.*invalid|not a valid phone|e\.?164",
        category: ProviderError,
        action: FixAndRetry,
        reason: "Invalid phone format",
        fixes: &[Fix::PhoneE164],
    },
    PatternRule {
        pattern: r"invalid email|email.*invalid|malformed.*email|illegal address",
        category: ProviderError,
        action: FixAndRetry,
        reason: "Invalid email format",
        fixes: &[Fix::EmailNormalize],
    },
    PatternRule {
        pattern: r"too long|payload too large|body size|character limit|max(imum)?.*length",
        category: ProviderError,
        action: FixAndRetry,
        reason: "Content too long",
        fixes: &[Fix::TruncateBody],
    },
    PatternRule {
        pattern: r"invalid html|malformed html|markup",
        category: ProviderError,
        action: FixAndRetry,
        reason: "Rejected markup",
        fixes: &[Fix::SanitizeHtml],
    },
    PatternRule {
        pattern: r"batch (is )?too large|too many recipients|batch size",
        category: ProviderError,
        action: ReduceAndRetry,
        reason: "Batch too large",
        fixes: &[Fix::ReduceBatch],
    },
    PatternRule {
        pattern: r"token expired|expired.*token|credentials? (have |has )?expired|\b401\b",
        category: Configuration,
        action: RefreshAndRetry,
        reason: "Expired credentials",
        fixes: &[Fix::RefreshToken],
    },
    PatternRule {
        pattern: r"unauthorized|forbidden|access denied|\b403\b|not verified",
        category: Configuration,
        action: Alert,
        reason: "Authorization or verification failure",
        fixes: &[],
    },
    PatternRule {
        pattern: r"unsubscribed|opted out|blacklist|does not exist|invalid recipient",
        category: Permanent,
        action: Discard,
        reason: "Recipient cannot receive messages",
        fixes: &[],
    },
];

static COMPILED_PATTERNS: LazyLock<Vec<(Regex, &'static PatternRule)>> = LazyLock::new(|| {
    PATTERN_RULES
        .iter()
        .map(|rule| {
            let regex = Regex::new(&format!("(?i){}", rule.pattern))
                .expect("classifier patterns are valid regular expressions");
            (regex, rule)
        })
        .collect()
});

/// Classifies one error.
///
/// `provider` is compared case-insensitively. Calling this twice with the
/// same inputs yields the same classification.
#[must_use]
pub fn classify(
    error_message: &str,
    error_code: Option<&str>,
    provider: Option<&str>,
) -> ErrorClassification {
    let provider = provider
        .map(|p| p.trim().to_ascii_lowercase())
        .filter(|p| !p.is_empty());
    let error_code = error_code.map(str::trim).filter(|c| !c.is_empty());

    debug!(
        provider = provider.as_deref().unwrap_or(""),
        error_code = error_code.unwrap_or(""),
        "classifying error"
    );

    if let (Some(p), Some(c)) = (provider.as_deref(), error_code) {
        if let Some(rule) = CODE_RULES.iter().find(|r| r.provider == p && r.code == c) {
            let mut classification = ErrorClassification::from_rule(
                rule.category,
                rule.action,
                rule.reason,
                rule.fixes,
                CODE_CONFIDENCE,
            );
            classification.provider = provider;
            classification.error_code = Some(c.to_string());
            return classification;
        }
    }

    let matched = COMPILED_PATTERNS
        .iter()
        .find(|(regex, _)| regex.is_match(error_message));

    let mut classification = match matched {
        Some((_, rule)) => ErrorClassification::from_rule(
            rule.category,
            rule.action,
            rule.reason,
            rule.fixes,
            PATTERN_CONFIDENCE,
        ),
        None => {
            warn!(
                error_message = truncate_for_log(error_message),
                provider = provider.as_deref().unwrap_or(""),
                "unknown error type"
            );
            ErrorClassification {
                category: ErrorCategory::Unknown,
                action: RecoveryAction::Alert,
                confidence: UNKNOWN_CONFIDENCE,
                reason: "Unknown error type - manual review required".to_string(),
                fixes: Vec::new(),
                max_retries: 1,
                retry_delay_seconds: 300,
                provider: None,
                error_code: None,
            }
        }
    };
    classification.provider = provider;
    classification.error_code = error_code.map(str::to_string);
    classification
}

fn truncate_for_log(message: &str) -> &str {
    match message.char_indices().nth(200) {
        Some((idx, _)) => &message[..idx],
        None => message,
    }
}
