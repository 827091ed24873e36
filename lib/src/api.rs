//! Calls against the election authority and one adapter per response type.
//!
//! The authority has shipped several response layouts over time: payloads
//! at the top level or wrapped in `data`/`result`, and a few renamed fields.
//! Each adapter accepts the known variants but logs every deviation under
//! the `ballotbox::contract` target, so contract drift shows up in logs.

use std::sync::Arc;

use ballotbox_shared::{
    Election, Error, Nonce, Receipt, SignedBallot, StringConversion, VerificationToken, Vote,
    VoteId,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use tracing::{error, trace, warn};

use crate::{
    otp::OtpCode,
    proof::{Credential, VoterProof},
    session::{Liveness, Session},
    transport::{ApiRequest, ApiResponse, Transport},
};

pub mod paths {
    pub const ACTIVE_ELECTIONS: &str = "/api/elections/active";
    pub const IDENTITY_VERIFY: &str = "/api/identity/verify";
    pub const HAS_VOTED: &str = "/api/voters/has-voted";
    pub const SEND_OTP: &str = "/api/otp/send";
    pub const VERIFY_OTP: &str = "/api/otp/verify";
    pub const CREATE_SESSION: &str = "/api/session/create";
    pub const BLIND_SIGNATURE: &str = "/api/votes/blind-signature";
    pub const CAST_VOTE: &str = "/api/votes/cast";
    pub const RECEIPT: &str = "/api/receipts";
    pub const VERIFY_CHOICE: &str = "/api/votes/verify-choice";
}

/// OTP lifetime when the authority does not send one.
pub const DEFAULT_OTP_MINUTES: i64 = 10;

const ENVELOPES: [&str; 2] = ["data", "result"];

/// Details the authority shares after a successful identity check.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdentityDetails {
    pub name: Option<String>,
    pub state: Option<String>,
    pub masked_email: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OtpDispatch {
    pub masked_email: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct CastAck {
    pub vote_id: VoteId,
    pub verification: Option<VerificationToken>,
}

// ---- response shape helpers ----

fn has_any(value: &Value, keys: &[&str]) -> bool {
    keys.iter().any(|k| value.get(k).is_some())
}

/// Where the payload lives: the body itself, or one envelope down.
fn locate<'a>(endpoint: &'static str, body: &'a Value, probe: &[&str]) -> &'a Value {
    if has_any(body, probe) {
        return body;
    }
    for envelope in ENVELOPES {
        if let Some(inner) = body.get(envelope) {
            if has_any(inner, probe) {
                warn!(
                    target: "ballotbox::contract",
                    "{}: payload found under `{}` envelope", endpoint, envelope
                );
                return inner;
            }
        }
    }
    body
}

fn field<'a>(
    endpoint: &'static str,
    payload: &'a Value,
    name: &str,
    aliases: &[&str],
) -> Option<&'a Value> {
    if let Some(v) = payload.get(name).filter(|v| !v.is_null()) {
        return Some(v);
    }
    for alias in aliases {
        if let Some(v) = payload.get(alias).filter(|v| !v.is_null()) {
            warn!(
                target: "ballotbox::contract",
                "{}: field `{}` arrived as `{}`", endpoint, name, alias
            );
            return Some(v);
        }
    }
    None
}

fn optional_str(
    endpoint: &'static str,
    payload: &Value,
    name: &str,
    aliases: &[&str],
) -> Option<String> {
    field(endpoint, payload, name, aliases)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// A field a success response cannot be trusted without.
fn required_str(
    endpoint: &'static str,
    payload: &Value,
    name: &str,
    aliases: &[&str],
) -> Result<String, Error> {
    optional_str(endpoint, payload, name, aliases).ok_or_else(|| {
        error!(
            target: "ballotbox::contract",
            "{}: success response is missing `{}`", endpoint, name
        );
        Error::shape(endpoint, format!("missing `{}`", name))
    })
}

/// RFC 3339 text, or unix time in seconds or milliseconds.
pub(crate) fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc))
            .or_else(|| s.parse::<i64>().ok().and_then(from_unix)),
        Value::Number(n) => n.as_i64().and_then(from_unix),
        _ => None,
    }
}

fn from_unix(n: i64) -> Option<DateTime<Utc>> {
    // Anything past ~5138 AD in seconds is really milliseconds.
    if n.abs() >= 100_000_000_000 {
        Utc.timestamp_millis_opt(n).single()
    } else {
        Utc.timestamp_opt(n, 0).single()
    }
}

fn message(body: &Value) -> Option<String> {
    if let Value::String(s) = body {
        return Some(s.clone()).filter(|s| !s.is_empty());
    }
    let direct = ["message", "error", "detail"]
        .iter()
        .find_map(|k| body.get(k).and_then(Value::as_str));
    direct
        .or_else(|| {
            ENVELOPES.iter().find_map(|e| {
                body.get(e)
                    .and_then(|inner| inner.get("message"))
                    .and_then(Value::as_str)
            })
        })
        .map(str::to_string)
}

fn reported_failure(body: &Value) -> bool {
    body.get("success").and_then(Value::as_bool) == Some(false)
}

/// Turns any non-success into the matching error. Server messages are kept verbatim.
fn accept(endpoint: &'static str, res: ApiResponse) -> Result<Value, Error> {
    if res.is_success() && !reported_failure(&res.body) {
        return Ok(res.body);
    }
    let text = message(&res.body)
        .unwrap_or_else(|| format!("{} was rejected (HTTP {})", endpoint, res.status));
    match res.status {
        408 | 429 | 500..=599 => Err(Error::Network(text)),
        _ => Err(Error::Auth(text)),
    }
}

// ---- one adapter per response type ----

pub(crate) fn parse_elections(body: &Value) -> Result<Vec<Election>, Error> {
    const EP: &str = "active-elections";
    let list = if body.is_array() {
        body
    } else {
        let found = ["elections"]
            .iter()
            .chain(ENVELOPES.iter())
            .find_map(|k| body.get(k).filter(|v| v.is_array()).map(|v| (*k, v)));
        match found {
            Some((key, list)) => {
                warn!(target: "ballotbox::contract", "{}: list found under `{}`", EP, key);
                list
            }
            None => return Err(Error::shape(EP, "no election list in response")),
        }
    };
    serde_json::from_value(list.clone()).map_err(|e| Error::shape(EP, e.to_string()))
}

pub(crate) fn parse_identity(body: &Value) -> IdentityDetails {
    const EP: &str = "identity-verify";
    let p = locate(EP, body, &["name", "maskedEmail", "state"]);
    IdentityDetails {
        name: optional_str(EP, p, "name", &[]),
        state: optional_str(EP, p, "state", &[]),
        masked_email: optional_str(EP, p, "maskedEmail", &["email"]),
    }
}

pub(crate) fn parse_has_voted(body: &Value) -> Result<bool, Error> {
    const EP: &str = "has-voted";
    let p = locate(EP, body, &["hasVoted"]);
    field(EP, p, "hasVoted", &["voted"])
        .and_then(Value::as_bool)
        .ok_or_else(|| {
            error!(target: "ballotbox::contract", "{}: success response is missing `hasVoted`", EP);
            Error::shape(EP, "missing `hasVoted`")
        })
}

pub(crate) fn parse_otp_dispatch(body: &Value, now: DateTime<Utc>) -> OtpDispatch {
    const EP: &str = "send-otp";
    let p = locate(EP, body, &["maskedEmail", "expiryMinutes", "expiresAt"]);
    let absolute = field(EP, p, "expiresAt", &[]).and_then(timestamp);
    let expires_at = absolute.unwrap_or_else(|| {
        let minutes = field(EP, p, "expiryMinutes", &[])
            .and_then(Value::as_i64)
            .filter(|m| *m > 0)
            .unwrap_or(DEFAULT_OTP_MINUTES);
        now + Duration::minutes(minutes)
    });
    OtpDispatch {
        masked_email: optional_str(EP, p, "maskedEmail", &["email"]),
        expires_at,
    }
}

pub(crate) fn parse_session(body: &Value, election_id: &str) -> Result<Session, Error> {
    const EP: &str = "create-session";
    let p = locate(EP, body, &["sessionID", "sessionId", "authToken"]);
    let session_id = required_str(EP, p, "sessionID", &["sessionId"])?;
    let bearer_token = required_str(EP, p, "authToken", &["token", "bearerToken"])?;
    let expires_at = field(EP, p, "expiresAt", &[])
        .and_then(timestamp)
        .ok_or_else(|| {
            error!(target: "ballotbox::contract", "{}: missing or unreadable `expiresAt`", EP);
            Error::shape(EP, "missing `expiresAt`")
        })?;
    Ok(Session {
        session_id,
        bearer_token,
        expires_at,
        election_id: election_id.to_string(),
    })
}

pub(crate) fn parse_signature(body: &Value) -> Result<SignedBallot, Error> {
    const EP: &str = "request-blind-signature";
    let p = locate(EP, body, &["blindSignature", "signature"]);
    Ok(SignedBallot {
        blind_signature: required_str(EP, p, "blindSignature", &["signature"])?,
        audit_id: optional_str(EP, p, "auditID", &["auditId"]),
    })
}

pub(crate) fn parse_cast(body: &Value, submitted: VoteId) -> CastAck {
    const EP: &str = "cast-vote";
    let p = locate(EP, body, &["voteID", "verificationToken"]);
    let vote_id = optional_str(EP, p, "voteID", &["voteId"])
        .and_then(VoteId::from_string)
        .unwrap_or(submitted);
    if vote_id != submitted {
        warn!(target: "ballotbox::contract", "{}: acknowledged a different vote id", EP);
    }
    let verification = optional_str(EP, p, "verificationToken", &[]).map(|token| {
        let expiry = field(EP, p, "verificationExpiry", &["expiresAt"]).and_then(timestamp);
        VerificationToken::new(token, expiry)
    });
    CastAck {
        vote_id,
        verification,
    }
}

pub(crate) fn parse_receipt(body: &Value) -> Result<Receipt, Error> {
    const EP: &str = "receipt";
    let p = locate(EP, body, &["voteID", "voteId", "status"]);
    let vote_id = required_str(EP, p, "voteID", &["voteId"])?;
    let vote_id = VoteId::from_string(vote_id)
        .ok_or_else(|| Error::shape(EP, "`voteID` is not a vote id"))?;
    Ok(Receipt {
        vote_id,
        election_id: required_str(EP, p, "electionId", &["electionID"])?,
        status: optional_str(EP, p, "status", &[]).unwrap_or_else(|| "recorded".into()),
        timestamp: field(EP, p, "timestamp", &["createdAt"])
            .and_then(timestamp)
            .ok_or_else(|| Error::shape(EP, "missing `timestamp`"))?,
    })
}

pub(crate) fn parse_choice(body: &Value) -> Result<String, Error> {
    const EP: &str = "verify-choice";
    let p = locate(EP, body, &["candidateId"]);
    required_str(EP, p, "candidateId", &["candidateID", "candidate"])
}

/// Error code some deployments put next to the message.
fn code(body: &Value) -> Option<String> {
    let direct = ["code", "status", "error"]
        .iter()
        .find_map(|k| body.get(k).and_then(Value::as_str));
    direct
        .or_else(|| {
            ENVELOPES
                .iter()
                .find_map(|e| body.get(e).and_then(|i| i.get("code")).and_then(Value::as_str))
        })
        .map(|c| c.to_ascii_uppercase().replace([' ', '-'], "_"))
}

fn token_rejection(res: &ApiResponse) -> Option<Error> {
    let code = code(&res.body).unwrap_or_default();
    if res.status == 409 || code.contains("ALREADY_USED") {
        return Some(Error::TokenReuse);
    }
    if matches!(res.status, 404 | 410)
        || code.contains("EXPIRED")
        || code.contains("NOT_FOUND")
    {
        return Some(Error::TokenExpiredOrNotFound);
    }
    None
}

// ---- clients ----

/// Unauthenticated voter-role calls.
pub struct VoterApi<T: Transport> {
    transport: Arc<T>,
}

impl<T: Transport> Clone for VoterApi<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
        }
    }
}

impl<T: Transport> VoterApi<T> {
    pub fn new(transport: T) -> Self {
        Self::from_shared(Arc::new(transport))
    }

    pub fn from_shared(transport: Arc<T>) -> Self {
        Self { transport }
    }

    pub(crate) fn transport(&self) -> Arc<T> {
        self.transport.clone()
    }

    pub async fn active_elections(&self) -> Result<Vec<Election>, Error> {
        let res = self
            .transport
            .send(ApiRequest::get(paths::ACTIVE_ELECTIONS))
            .await?;
        parse_elections(&accept("active-elections", res)?)
    }

    pub async fn verify_identity(&self, credential: &Credential) -> Result<IdentityDetails, Error> {
        let body = json!({
            "aadhaar": credential.aadhaar(),
            "voterId": credential.voter_id(),
        });
        let res = self
            .transport
            .send(ApiRequest::post(paths::IDENTITY_VERIFY, body))
            .await?;
        Ok(parse_identity(&accept("identity-verify", res)?))
    }

    pub async fn has_voted(&self, election_id: &str, proof: &VoterProof) -> Result<bool, Error> {
        let req = ApiRequest::get(paths::HAS_VOTED)
            .query("electionId", election_id)
            .query("voterProof", proof.as_str());
        let res = self.transport.send(req).await?;
        if res.status == 409 {
            return Ok(true);
        }
        parse_has_voted(&accept("has-voted", res)?)
    }

    pub async fn send_otp(&self, credential: &Credential) -> Result<OtpDispatch, Error> {
        let body = json!({
            "aadhaar": credential.aadhaar(),
            "voterId": credential.voter_id(),
        });
        let res = self
            .transport
            .send(ApiRequest::post(paths::SEND_OTP, body))
            .await?;
        Ok(parse_otp_dispatch(&accept("send-otp", res)?, Utc::now()))
    }

    pub async fn verify_otp(&self, credential: &Credential, code: &OtpCode) -> Result<(), Error> {
        let body = json!({
            "aadhaar": credential.aadhaar(),
            "voterId": credential.voter_id(),
            "otp": code.to_string(),
        });
        let res = self
            .transport
            .send(ApiRequest::post(paths::VERIFY_OTP, body))
            .await?;
        accept("verify-otp", res).map(|_| ())
    }

    pub async fn create_session(
        &self,
        credential: &Credential,
        election_id: &str,
        fingerprint_verified: bool,
    ) -> Result<Session, Error> {
        let body = json!({
            "aadhaar": credential.aadhaar(),
            "voterId": credential.voter_id(),
            "fingerprintVerified": fingerprint_verified,
            "otpVerified": true,
            "electionId": election_id,
        });
        let res = self
            .transport
            .send(ApiRequest::post(paths::CREATE_SESSION, body))
            .await?;
        parse_session(&accept("create-session", res)?, election_id)
    }

    /// Keyed by vote id alone.
    pub async fn receipt(&self, election_id: &str, vote_id: &VoteId) -> Result<Receipt, Error> {
        let req = ApiRequest::get(paths::RECEIPT)
            .query("electionId", election_id)
            .query("voteID", vote_id.as_string());
        let res = self.transport.send(req).await?;
        if res.status == 404 {
            return Err(Error::NotFound);
        }
        parse_receipt(&accept("receipt", res)?)
    }

    pub async fn verify_choice(&self, token: &str) -> Result<String, Error> {
        let req = ApiRequest::get(paths::VERIFY_CHOICE).query("verificationToken", token);
        let res = self.transport.send(req).await?;
        if let Some(rejection) = token_rejection(&res) {
            return Err(rejection);
        }
        match accept("verify-choice", res) {
            Ok(body) => parse_choice(&body),
            Err(Error::Auth(msg)) => Err(Error::Other(msg)),
            Err(e) => Err(e),
        }
    }
}

/// Calls that need a live session. Only an active identity session can hand
/// one out, so protected endpoints cannot be reached without a bearer token.
pub struct AuthenticatedClient<T: Transport> {
    transport: Arc<T>,
    session_id: String,
    bearer: String,
    liveness: Liveness,
}

impl<T: Transport> AuthenticatedClient<T> {
    pub(crate) fn new(transport: Arc<T>, session: &Session, liveness: Liveness) -> Self {
        Self {
            transport,
            session_id: session.session_id.clone(),
            bearer: session.bearer_token.clone(),
            liveness,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.liveness.generation()
    }

    /// Whether the session that issued this client is still the live one.
    pub fn is_live(&self) -> bool {
        self.liveness.check().is_ok()
    }

    async fn send(&self, endpoint: &'static str, req: ApiRequest) -> Result<Value, Error> {
        self.liveness.check()?;
        trace!("authenticated call to {}", endpoint);
        let res = self.transport.send(req.bearer(&self.bearer)).await?;
        if res.status == 401 {
            warn!("{}: bearer token rejected, dropping session", endpoint);
            self.liveness.revoke();
            return Err(Error::Unauthenticated);
        }
        if res.status == 409 {
            return Err(Error::AlreadyVoted);
        }
        accept(endpoint, res)
    }

    /// The nonce ties the request to this session without identifying the voter.
    pub async fn request_blind_signature(
        &self,
        envelope: &str,
        nonce: &Nonce,
    ) -> Result<SignedBallot, Error> {
        let body = json!({
            "sessionID": self.session_id,
            "blindedVote": envelope,
            "nonce": nonce.as_string(),
        });
        let body = self
            .send(
                "request-blind-signature",
                ApiRequest::post(paths::BLIND_SIGNATURE, body),
            )
            .await?;
        parse_signature(&body)
    }

    pub async fn cast_vote(&self, vote: &Vote) -> Result<CastAck, Error> {
        let body = serde_json::to_value(vote)?;
        let body = self
            .send("cast-vote", ApiRequest::post(paths::CAST_VOTE, body))
            .await?;
        Ok(parse_cast(&body, vote.vote_id))
    }
}
