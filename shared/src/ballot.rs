use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{error::Error, StringConversion};

const VOTE_ID_PREFIX: &str = "vote_";
const VOTE_ID_BYTES: usize = 16;

/// Fresh random vote identifier, unlinkable to the voter.
///
/// Always `vote_` followed by 32 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VoteId(pub [u8; VOTE_ID_BYTES]);

impl VoteId {
    pub fn random() -> Self {
        let mut bytes = [0u8; VOTE_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        VoteId(bytes)
    }
}

impl StringConversion for VoteId {
    fn as_string(&self) -> String {
        format!("{}{}", VOTE_ID_PREFIX, hex::encode(self.0))
    }

    fn from_string(s: String) -> Option<Self> {
        let raw = s.strip_prefix(VOTE_ID_PREFIX)?;
        let bytes = hex::decode(raw).ok()?;
        if bytes.len() != VOTE_ID_BYTES {
            return None;
        }
        let mut arr = [0u8; VOTE_ID_BYTES];
        arr.copy_from_slice(&bytes);
        Some(VoteId(arr))
    }
}

impl TryFrom<String> for VoteId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        VoteId::from_string(s).ok_or(Error::Serialization)
    }
}

impl From<VoteId> for String {
    fn from(id: VoteId) -> Self {
        id.as_string()
    }
}

impl Display for VoteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

/// Replay protection for a single blind-signature request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Nonce(pub [u8; 32]);

impl Nonce {
    pub fn random() -> Self {
        Nonce(rand::random())
    }
}

impl StringConversion for Nonce {
    fn as_string(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    fn from_string(s: String) -> Option<Self> {
        let bytes = bs58::decode(&s).into_vec().ok()?;
        Some(Nonce(bytes.try_into().ok()?))
    }
}

impl Display for Nonce {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

/// The ballot before blinding. Never sent to the authority as-is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlindBallot {
    pub election_id: String,
    pub candidate_id: String,
    pub blinding_timestamp: DateTime<Utc>,
}

impl BlindBallot {
    pub fn new(election_id: impl Into<String>, candidate_id: impl Into<String>) -> Self {
        BlindBallot {
            election_id: election_id.into(),
            candidate_id: candidate_id.into(),
            blinding_timestamp: Utc::now(),
        }
    }

    /// Unambiguous byte encoding: each field is length-prefixed so that no two
    /// distinct ballots share an encoding.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            16 + self.election_id.len() + self.candidate_id.len() + 8,
        );
        for field in [self.election_id.as_bytes(), self.candidate_id.as_bytes()] {
            out.extend_from_slice(&(field.len() as u64).to_be_bytes());
            out.extend_from_slice(field);
        }
        out.extend_from_slice(&self.blinding_timestamp.timestamp_millis().to_be_bytes());
        out
    }
}

/// What the authority hands back for a blinded envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedBallot {
    pub blind_signature: String,
    pub audit_id: Option<String>,
}

/// The only payload ever submitted to cast-vote.
///
/// Deliberately has no room for any identity-derived field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    #[serde(rename = "voteID")]
    pub vote_id: VoteId,
    #[serde(rename = "electionId")]
    pub election_id: String,
    #[serde(rename = "candidateId")]
    pub candidate_id: String,
    #[serde(rename = "blindSignature")]
    pub blind_signature: String,
    #[serde(rename = "batchID")]
    pub batch_id: String,
}

impl Vote {
    /// Election and candidate come from the ballot that was blinded, so the
    /// signature and the submitted choice cannot drift apart.
    pub fn assemble(
        vote_id: VoteId,
        ballot: &BlindBallot,
        blind_signature: String,
        batch_id: String,
    ) -> Self {
        Vote {
            vote_id,
            election_id: ballot.election_id.clone(),
            candidate_id: ballot.candidate_id.clone(),
            blind_signature,
            batch_id,
        }
    }
}
