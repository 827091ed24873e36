#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use ballotbox::{
    api::paths,
    transport::{ApiRequest, ApiResponse},
    Credential, Error, IdentitySession, MemoryStore, SessionStore, Transport, VoterApi,
};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tokio::sync::Notify;

pub const ELECTION: &str = "e-2024-ls";

/// An in-process election authority with scripted answers.
///
/// Each path has a queue of responses; the last one repeats forever.
pub struct MockAuthority {
    routes: Mutex<HashMap<&'static str, VecDeque<ApiResponse>>>,
    calls: Mutex<Vec<ApiRequest>>,
    holds: Mutex<HashMap<&'static str, Arc<Notify>>>,
}

impl MockAuthority {
    /// Answers every call the way a healthy authority would.
    pub fn new() -> Arc<Self> {
        init_tracing();
        let mock = MockAuthority {
            routes: Mutex::new(HashMap::new()),
            calls: Mutex::new(vec![]),
            holds: Mutex::new(HashMap::new()),
        };
        mock.reply(
            paths::ACTIVE_ELECTIONS,
            200,
            json!([{
                "id": ELECTION,
                "title": "General Election",
                "candidates": ["c1", {"id": "candidate-7", "name": "R. Iyer", "party": "IND"}]
            }]),
        );
        mock.reply(
            paths::IDENTITY_VERIFY,
            200,
            json!({"success": true, "data": {"name": "Asha Rao", "state": "KA", "maskedEmail": "a***@mail.in"}}),
        );
        mock.reply(paths::HAS_VOTED, 200, json!({"hasVoted": false}));
        mock.reply(
            paths::SEND_OTP,
            200,
            json!({"maskedEmail": "a***@mail.in", "expiryMinutes": 10}),
        );
        mock.reply(paths::VERIFY_OTP, 200, json!({"success": true}));
        mock.reply(paths::CREATE_SESSION, 200, session_body(15 * 60));
        mock.reply(
            paths::BLIND_SIGNATURE,
            200,
            json!({"blindSignature": "sig-abc", "auditID": "audit-1"}),
        );
        mock.reply(
            paths::CAST_VOTE,
            200,
            json!({
                "success": true,
                "verificationToken": "tok-1",
                "verificationExpiry": (Utc::now() + Duration::minutes(2)).to_rfc3339()
            }),
        );
        mock.reply(paths::RECEIPT, 404, json!({"message": "pending"}));
        mock.reply(paths::VERIFY_CHOICE, 200, json!({"candidateId": "candidate-7"}));
        Arc::new(mock)
    }

    /// Replaces whatever was scripted for `path`.
    pub fn reply(&self, path: &'static str, status: u16, body: Value) {
        let mut routes = self.routes.lock().unwrap();
        routes.insert(path, VecDeque::from([ApiResponse { status, body }]));
    }

    /// Queues another answer after the ones already scripted.
    pub fn then(&self, path: &'static str, status: u16, body: Value) {
        let mut routes = self.routes.lock().unwrap();
        routes
            .entry(path)
            .or_default()
            .push_back(ApiResponse { status, body });
    }

    /// Calls to `path` wait until the returned gate is notified.
    pub fn hold(&self, path: &'static str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.holds.lock().unwrap().insert(path, gate.clone());
        gate
    }

    pub fn calls(&self, path: &str) -> Vec<ApiRequest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.path == path)
            .cloned()
            .collect()
    }

    pub fn count(&self, path: &str) -> usize {
        self.calls(path).len()
    }

    fn next(&self, path: &'static str) -> ApiResponse {
        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(path) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap(),
            None => ApiResponse {
                status: 404,
                body: json!({"message": "no such route"}),
            },
        }
    }
}

#[async_trait]
impl Transport for MockAuthority {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, Error> {
        let path = request.path;
        self.calls.lock().unwrap().push(request);
        let gate = self.holds.lock().unwrap().get(path).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self.next(path))
    }
}

/// A create-session answer expiring `secs` from now.
pub fn session_body(secs: i64) -> Value {
    json!({
        "sessionID": "sess-1",
        "authToken": "bearer-1",
        "expiresAt": (Utc::now() + Duration::seconds(secs)).to_rfc3339()
    })
}

pub fn credential() -> Credential {
    Credential::new("1234 5678 9012", "ABC1234567", "Asha Rao").unwrap()
}

pub fn api(mock: &Arc<MockAuthority>) -> VoterApi<MockAuthority> {
    VoterApi::from_shared(mock.clone())
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn session(mock: &Arc<MockAuthority>) -> (IdentitySession<MockAuthority>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let session = IdentitySession::new(api(mock), store.clone() as Arc<dyn SessionStore>);
    (session, store)
}

/// Runs the identity flow up to an active voting session.
pub async fn active_session(
    mock: &Arc<MockAuthority>,
) -> (IdentitySession<MockAuthority>, Arc<MemoryStore>) {
    let (mut session, store) = session(mock);
    session.verify_identity(credential(), ELECTION).await.unwrap();
    session.send_otp().await.unwrap();
    session.verify_otp("482913").await.unwrap();
    session.create_session(true).await.unwrap();
    (session, store)
}
