//! Failure classification: given a raw error message, pattern-match it
//! into a category and default severity. Classification never fails --
//! anything unrecognized falls through to `Unknown`.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Network,
    Authentication,
    RateLimit,
    Parsing,
    Validation,
    Timeout,
    Resource,
    Platform,
    System,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn default_for(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::Network => Self::Medium,
            ErrorCategory::RateLimit => Self::Low,
            ErrorCategory::Timeout => Self::Medium,
            ErrorCategory::Platform => Self::Medium,
            ErrorCategory::Parsing => Self::Medium,
            ErrorCategory::Resource => Self::High,
            ErrorCategory::Authentication => Self::High,
            ErrorCategory::Validation => Self::Low,
            ErrorCategory::System => Self::Critical,
            ErrorCategory::Unknown => Self::Medium,
        }
    }

    pub fn promote(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

/// Classify a raw error by message token matching. Order matters: more
/// specific tokens are checked before generic ones.
pub fn classify(message: &str) -> ErrorCategory {
    let m = message.to_lowercase();

    if m.contains("401") || m.contains("unauthorized") || m.contains("forbidden") || m.contains("403") {
        ErrorCategory::Authentication
    } else if m.contains("429") || m.contains("rate limit") || m.contains("too many requests") {
        ErrorCategory::RateLimit
    } else if m.contains("timed out") || m.contains("timeout") || m.contains("deadline exceeded") {
        ErrorCategory::Timeout
    } else if m.contains("connection") || m.contains("dns") || m.contains("network") || m.contains("refused") {
        ErrorCategory::Network
    } else if m.contains("parse") || m.contains("malformed") || m.contains("unexpected token") {
        ErrorCategory::Parsing
    } else if m.contains("invalid") || m.contains("validation") || m.contains("missing required field") {
        ErrorCategory::Validation
    } else if m.contains("out of memory") || m.contains("disk full") || m.contains("quota exceeded") {
        ErrorCategory::Resource
    } else if m.contains("5") && (m.contains("500") || m.contains("502") || m.contains("503")) {
        ErrorCategory::Platform
    } else if m.contains("panic") || m.contains("fatal") || m.contains("corrupt") {
        ErrorCategory::System
    } else {
        ErrorCategory::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_tokens() {
        assert_eq!(classify("401 Unauthorized"), ErrorCategory::Authentication);
        assert_eq!(classify("429 Too Many Requests"), ErrorCategory::RateLimit);
        assert_eq!(classify("request timed out"), ErrorCategory::Timeout);
        assert_eq!(classify("connection refused"), ErrorCategory::Network);
        assert_eq!(classify("failed to parse response body"), ErrorCategory::Parsing);
        assert_eq!(classify("missing required field: title"), ErrorCategory::Validation);
        assert_eq!(classify("disk full"), ErrorCategory::Resource);
        assert_eq!(classify("upstream 502 bad gateway"), ErrorCategory::Platform);
        assert_eq!(classify("panic in worker"), ErrorCategory::System);
    }

    #[test]
    fn unrecognized_falls_through_to_unknown() {
        assert_eq!(classify("something weird happened"), ErrorCategory::Unknown);
    }

    #[test]
    fn severity_promotes_monotonically() {
        assert!(ErrorSeverity::Low < ErrorSeverity::Medium);
        assert!(ErrorSeverity::Low.promote() == ErrorSeverity::Medium);
        assert!(ErrorSeverity::Critical.promote() == ErrorSeverity::Critical);
    }
}
