use crate::error::QuotaViolation;

pub const DEFAULT_MAX_CHARS: usize = 7;
pub const DEFAULT_MESSAGE_LIMIT: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaRules {
    pub max_chars: usize,
    pub message_limit: i64,
}

impl Default for QuotaRules {
    fn default() -> Self {
        Self {
            max_chars: DEFAULT_MAX_CHARS,
            message_limit: DEFAULT_MESSAGE_LIMIT,
        }
    }
}

impl QuotaRules {
    /// Session-only rules. Checked in order: remaining budget, length, whitespace.
    pub fn validate(&self, content: &str, remaining: i64) -> Result<(), QuotaViolation> {
        if remaining <= 0 {
            return Err(QuotaViolation::Exhausted);
        }
        let len = content.chars().count();
        if len > self.max_chars {
            return Err(QuotaViolation::TooLong {
                len,
                max: self.max_chars,
            });
        }
        if content.chars().any(char::is_whitespace) {
            return Err(QuotaViolation::ContainsWhitespace);
        }
        Ok(())
    }

    /// Gate for every send. `session_remaining` is `Some` only while a session is
    /// active or expiring.
    pub fn check_send(
        &self,
        content: &str,
        session_remaining: Option<i64>,
    ) -> Result<(), QuotaViolation> {
        if content.is_empty() {
            return Err(QuotaViolation::Empty);
        }
        match session_remaining {
            Some(remaining) => self.validate(content, remaining),
            None => Ok(()),
        }
    }

    /// Merges a server-reported remainder with what the local log proves was sent.
    pub fn reconcile_remaining(&self, confirmed_sent: usize, server_remaining: i64) -> i64 {
        let sent = i64::try_from(confirmed_sent).unwrap_or(i64::MAX);
        let local = self.message_limit.saturating_sub(sent);
        local.max(server_remaining.max(0))
    }
}

#[cfg(test)]
#[path = "tests/quota_tests.rs"]
mod tests;
