use ballotbox_shared::{BlindBallot, Error, SignedBallot};
use blind_rsa_signatures::{
    reexports::rsa::{self, pkcs8::DecodePublicKey},
    BlindSignature, BlindingResult, Options, PublicKey as RsaPublicKey,
};
use rand::RngCore;
use tracing::trace;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// An envelope that hides the candidate from the signer, plus whatever the
/// blinder needs to turn the authority's answer into a submittable signature.
pub struct Blinded<S> {
    pub envelope: String,
    pub secret: S,
}

/// How a ballot is hidden from the authority while it is being signed.
pub trait Blinder: Send + Sync {
    type Secret: Send;

    fn blind(&self, ballot: &BlindBallot) -> Result<Blinded<Self::Secret>, Error>;

    /// Checks that the signature belongs to `ballot` and returns the value to
    /// put in the vote.
    fn finalize(
        &self,
        ballot: &BlindBallot,
        secret: &Self::Secret,
        signed: &SignedBallot,
    ) -> Result<String, Error>;
}

/// Hiding commitment: a BLAKE3 keyed hash of the ballot under a fresh random
/// blinding factor. The authority signs the commitment opaquely.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommitmentBlinder;

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CommitmentSecret {
    factor: [u8; 32],
    commitment: [u8; 32],
}

impl Blinder for CommitmentBlinder {
    type Secret = CommitmentSecret;

    fn blind(&self, ballot: &BlindBallot) -> Result<Blinded<CommitmentSecret>, Error> {
        let mut factor = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut factor);
        let commitment = *blake3::keyed_hash(&factor, &ballot.canonical_bytes()).as_bytes();
        trace!("ballot committed");
        Ok(Blinded {
            envelope: bs58::encode(commitment).into_string(),
            secret: CommitmentSecret { factor, commitment },
        })
    }

    fn finalize(
        &self,
        ballot: &BlindBallot,
        secret: &CommitmentSecret,
        signed: &SignedBallot,
    ) -> Result<String, Error> {
        let reopened = blake3::keyed_hash(&secret.factor, &ballot.canonical_bytes());
        if reopened != blake3::Hash::from(secret.commitment) {
            return Err(Error::Validation(
                "signature was issued for a different ballot".into(),
            ));
        }
        Ok(signed.blind_signature.clone())
    }
}

/// RSA blind signatures against the authority's published key. The
/// signature is unblinded and verified locally before it goes into a vote.
pub struct RsaBlinder {
    pk: RsaPublicKey,
    options: Options,
}

impl RsaBlinder {
    pub fn new(pk: RsaPublicKey) -> Self {
        Self {
            pk,
            options: Options::default(),
        }
    }

    /// Reads a base58-encoded SPKI DER public key.
    pub fn from_base58(key: &str) -> Result<Self, Error> {
        let der = bs58::decode(key.trim())
            .into_vec()
            .map_err(|_| Error::Config("authority key is not valid base58".into()))?;
        let pk = rsa::RsaPublicKey::from_public_key_der(&der)
            .map_err(|e| Error::Config(format!("authority key is not an RSA key: {}", e)))?;
        Ok(Self::new(RsaPublicKey::from(pk)))
    }
}

impl Blinder for RsaBlinder {
    type Secret = BlindingResult;

    fn blind(&self, ballot: &BlindBallot) -> Result<Blinded<BlindingResult>, Error> {
        let result = self.pk.blind(
            &mut rand::thread_rng(),
            ballot.canonical_bytes(),
            false,
            &self.options,
        )?;
        Ok(Blinded {
            envelope: bs58::encode(&result.blind_msg.0).into_string(),
            secret: result,
        })
    }

    fn finalize(
        &self,
        ballot: &BlindBallot,
        secret: &BlindingResult,
        signed: &SignedBallot,
    ) -> Result<String, Error> {
        let blind_sig = bs58::decode(&signed.blind_signature)
            .into_vec()
            .map_err(|_| Error::shape("request-blind-signature", "signature is not base58"))?;
        let msg = ballot.canonical_bytes();
        let sig = self.pk.finalize(
            &BlindSignature(blind_sig),
            &secret.secret,
            secret.msg_randomizer,
            &msg,
            &self.options,
        )?;
        sig.verify(&self.pk, secret.msg_randomizer, &msg, &self.options)?;
        let sig: Vec<u8> = sig.into();
        Ok(bs58::encode(sig).into_string())
    }
}
