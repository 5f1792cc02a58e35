use crate::envelope::ResponseEnvelope;

/// Business/transport codes that carry auth meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthCodes {
    /// Access credential expired; a silent refresh may recover.
    pub soft: i64,
    /// Refresh credential expired; the user has to sign in again.
    pub hard: i64,
    pub success: i64,
}

impl Default for AuthCodes {
    fn default() -> Self {
        Self {
            soft: 401,
            hard: 402,
            success: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    SoftAuthFailure,
    HardAuthFailure,
    ApplicationError,
}

impl Outcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::SoftAuthFailure => "soft_auth_failure",
            Self::HardAuthFailure => "hard_auth_failure",
            Self::ApplicationError => "application_error",
        }
    }

    #[must_use]
    pub fn is_auth_failure(self) -> bool {
        matches!(self, Self::SoftAuthFailure | Self::HardAuthFailure)
    }
}

/// Classify a decoded response.
///
/// A business code, when present, is authoritative for the auth slots: a
/// transport 200 carrying code 402 is a hard failure, and a transport 401
/// carrying some other business code is not treated as an auth signal.
#[must_use]
pub fn classify(envelope: &ResponseEnvelope, codes: &AuthCodes) -> Outcome {
    let auth_signal = envelope
        .code
        .or_else(|| envelope.status.map(i64::from));

    if auth_signal == Some(codes.hard) {
        return Outcome::HardAuthFailure;
    }
    if auth_signal == Some(codes.soft) {
        return Outcome::SoftAuthFailure;
    }
    if envelope
        .status
        .is_some_and(|status| !(200..=299).contains(&status))
    {
        return Outcome::ApplicationError;
    }
    if envelope.code.is_some_and(|code| code != codes.success) {
        return Outcome::ApplicationError;
    }
    Outcome::Success
}
