use ballotbox_shared::Error;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

const AADHAAR_DIGITS: usize = 12;

/// Raw voter identity. Lives in memory only, and is wiped when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credential {
    aadhaar: String,
    voter_id: String,
    legal_name: String,
}

impl Credential {
    /// Normalizes and validates the three identity fields.
    ///
    /// Whitespace around each field is dropped, as are spaces inside the
    /// Aadhaar number (it is commonly written in groups of four).
    pub fn new(
        aadhaar: impl AsRef<str>,
        voter_id: impl AsRef<str>,
        legal_name: impl AsRef<str>,
    ) -> Result<Self, Error> {
        let aadhaar: String = aadhaar
            .as_ref()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if aadhaar.len() != AADHAAR_DIGITS || !aadhaar.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Validation(format!(
                "Aadhaar number must be exactly {} digits",
                AADHAAR_DIGITS
            )));
        }
        let voter_id = voter_id.as_ref().trim().to_string();
        if voter_id.is_empty() || !voter_id.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(Error::Validation(
                "Voter ID must be a non-empty alphanumeric value".into(),
            ));
        }
        let legal_name = legal_name.as_ref().trim().to_string();
        if legal_name.is_empty() {
            return Err(Error::Validation("name must not be empty".into()));
        }
        Ok(Credential {
            aadhaar,
            voter_id,
            legal_name,
        })
    }

    pub fn aadhaar(&self) -> &str {
        &self.aadhaar
    }

    pub fn voter_id(&self) -> &str {
        &self.voter_id
    }

    pub fn legal_name(&self) -> &str {
        &self.legal_name
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential").finish_non_exhaustive()
    }
}

/// One-way digests of a credential. All values are lowercase hex SHA-256.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ProofSet {
    pub hashed_aadhaar: String,
    pub hashed_voter_id: String,
    pub hashed_name: String,
    pub voter_proof: VoterProof,
}

/// `sha256(hex(sha256(aadhaar)) ++ hex(sha256(voter_id)))`, hex encoded.
///
/// The authority recomputes this from its own records, so the inner digests
/// are concatenated as hex text and not as raw bytes.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct VoterProof(String);

impl VoterProof {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn digest_hex(input: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(input.as_ref()))
}

pub fn derive_proofs(credential: &Credential) -> ProofSet {
    let hashed_aadhaar = digest_hex(&credential.aadhaar);
    let hashed_voter_id = digest_hex(&credential.voter_id);
    let hashed_name = digest_hex(&credential.legal_name);
    let voter_proof = VoterProof(digest_hex(
        [hashed_aadhaar.as_bytes(), hashed_voter_id.as_bytes()].concat(),
    ));
    ProofSet {
        hashed_aadhaar,
        hashed_voter_id,
        hashed_name,
        voter_proof,
    }
}
