use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ballot::VoteId;

/// Lifetime of a verification token when the authority does not say otherwise.
pub const VERIFICATION_TOKEN_TTL_SECS: i64 = 120;

/// Permanent confirmation that a vote was recorded.
///
/// Looked up by vote id alone and never carries the candidate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    #[serde(rename = "voteID")]
    pub vote_id: VoteId,
    #[serde(rename = "electionId")]
    pub election_id: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Single-use token that reveals the recorded candidate exactly once.
#[derive(Clone, PartialEq, Eq)]
pub struct VerificationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl VerificationToken {
    pub fn new(token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        VerificationToken {
            token: token.into(),
            expires_at: expires_at
                .unwrap_or_else(|| Utc::now() + Duration::seconds(VERIFICATION_TOKEN_TTL_SECS)),
        }
    }

    /// Advisory only: the authority decides whether a token is still good.
    pub fn looks_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl std::fmt::Debug for VerificationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
