mod common;

use std::{collections::BTreeSet, time::Duration};

use ballotbox::{
    api::paths, derive_proofs, BlindVoteBuilder, CommitmentBlinder, Error, Phase, SessionStore,
    Terminal,
};
use common::{active_session, credential, session_body, MockAuthority, ELECTION};
use serde_json::json;
use tokio::time;

#[tokio::test]
async fn vote_is_blinded_signed_and_cast() {
    let mock = MockAuthority::new();
    let (mut session, store) = active_session(&mock).await;
    let builder = BlindVoteBuilder::new(CommitmentBlinder);

    let outcome = builder
        .build_and_submit(&mut session, ELECTION, "candidate-7")
        .await
        .unwrap();

    assert_eq!(session.phase(), Phase::VoteCast);
    assert!(store.get().unwrap().is_none());
    assert_eq!(outcome.audit_id.as_deref(), Some("audit-1"));
    assert_eq!(outcome.verification.as_ref().unwrap().token, "tok-1");
    assert_eq!(outcome.vote.blind_signature, "sig-abc");
    assert!(outcome.vote_id().to_string().starts_with("vote_"));

    // pre-OTP and pre-signature
    assert_eq!(mock.count(paths::HAS_VOTED), 2);

    let sign = &mock.calls(paths::BLIND_SIGNATURE)[0];
    assert_eq!(sign.bearer.as_deref(), Some("bearer-1"));
    let body = sign.body.as_ref().unwrap();
    assert_eq!(body["sessionID"], json!("sess-1"));
    assert!(body["nonce"].as_str().unwrap().len() >= 40);
    let envelope = body["blindedVote"].as_str().unwrap();
    assert!(!envelope.contains("candidate-7"));

    let cast = &mock.calls(paths::CAST_VOTE)[0];
    assert_eq!(cast.bearer.as_deref(), Some("bearer-1"));
    let body = cast.body.as_ref().unwrap();
    assert_eq!(body["candidateId"], json!("candidate-7"));
    assert_eq!(body["electionId"], json!(ELECTION));
    assert_eq!(body["voteID"], json!(outcome.vote_id().to_string()));
    assert!(body["batchID"].as_str().unwrap().starts_with("batch_"));
}

#[tokio::test]
async fn cast_payload_carries_no_identity() {
    let mock = MockAuthority::new();
    let (mut session, _) = active_session(&mock).await;
    BlindVoteBuilder::new(CommitmentBlinder)
        .build_and_submit(&mut session, ELECTION, "c1")
        .await
        .unwrap();

    let body = mock.calls(paths::CAST_VOTE)[0].body.clone().unwrap();
    let keys: BTreeSet<&str> = body.as_object().unwrap().keys().map(String::as_str).collect();
    assert_eq!(
        keys,
        BTreeSet::from(["voteID", "electionId", "candidateId", "blindSignature", "batchID"])
    );

    let text = body.to_string();
    let proofs = derive_proofs(&credential());
    for secret in [
        "123456789012",
        "ABC1234567",
        "Asha Rao",
        proofs.hashed_aadhaar.as_str(),
        proofs.hashed_voter_id.as_str(),
        proofs.hashed_name.as_str(),
        proofs.voter_proof.as_str(),
        "sess-1",
        "bearer-1",
    ] {
        assert!(!text.contains(secret), "cast payload leaks {}", secret);
    }
}

#[tokio::test]
async fn rejected_signature_request_casts_nothing() {
    let mock = MockAuthority::new();
    mock.reply(
        paths::BLIND_SIGNATURE,
        403,
        json!({"message": "Signing window closed"}),
    );
    let (mut session, _) = active_session(&mock).await;
    let builder = BlindVoteBuilder::new(CommitmentBlinder);

    let err = builder
        .build_and_submit(&mut session, ELECTION, "c1")
        .await
        .unwrap_err();
    assert!(matches!(&err, Error::Auth(m) if m == "Signing window closed"));
    assert!(err.is_retryable());
    assert_eq!(mock.count(paths::CAST_VOTE), 0);
    assert_eq!(session.phase(), Phase::SessionActive);
    assert!(!builder.is_busy());

    mock.reply(paths::BLIND_SIGNATURE, 200, json!({"blindSignature": "sig-2"}));
    let outcome = builder
        .build_and_submit(&mut session, ELECTION, "c1")
        .await
        .unwrap();
    assert_eq!(outcome.vote.blind_signature, "sig-2");
    assert_eq!(outcome.audit_id, None);
    assert_eq!(mock.count(paths::CAST_VOTE), 1);
}

#[tokio::test]
async fn signature_without_a_signature_is_a_shape_error() {
    let mock = MockAuthority::new();
    mock.reply(
        paths::BLIND_SIGNATURE,
        200,
        json!({"success": true, "data": {"auditID": "audit-9"}}),
    );
    let (mut session, _) = active_session(&mock).await;

    let err = BlindVoteBuilder::new(CommitmentBlinder)
        .build_and_submit(&mut session, ELECTION, "c1")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::ResponseShape {
            endpoint: "request-blind-signature",
            ..
        }
    ));
    assert_eq!(mock.count(paths::CAST_VOTE), 0);
}

#[tokio::test]
async fn second_has_voted_check_stops_signing() {
    let mock = MockAuthority::new();
    let (mut session, store) = active_session(&mock).await;
    mock.reply(paths::HAS_VOTED, 200, json!({"hasVoted": true}));

    let err = BlindVoteBuilder::new(CommitmentBlinder)
        .build_and_submit(&mut session, ELECTION, "c1")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyVoted));
    assert_eq!(mock.count(paths::BLIND_SIGNATURE), 0);
    assert_eq!(session.phase(), Phase::TerminalFailed(Terminal::AlreadyVoted));
    assert!(store.get().unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn session_expiry_forces_the_voter_out() {
    let mock = MockAuthority::new();
    mock.reply(paths::CREATE_SESSION, 200, session_body(5));
    let (mut session, store) = active_session(&mock).await;
    assert!(store.get().unwrap().is_some());

    // The voter is still picking a candidate when time runs out.
    time::sleep(Duration::from_secs(6)).await;

    assert_eq!(
        session.phase(),
        Phase::TerminalFailed(Terminal::SessionExpired)
    );
    assert!(store.get().unwrap().is_none());
    assert!(session.session().is_none());
    let err = BlindVoteBuilder::new(CommitmentBlinder)
        .build_and_submit(&mut session, ELECTION, "c1")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthenticated));
    assert_eq!(mock.count(paths::BLIND_SIGNATURE), 0);
    assert_eq!(mock.count(paths::CAST_VOTE), 0);
}

#[tokio::test(start_paused = true)]
async fn expiry_while_signing_discards_the_signature() {
    let mock = MockAuthority::new();
    mock.reply(paths::CREATE_SESSION, 200, session_body(5));
    let gate = mock.hold(paths::BLIND_SIGNATURE);
    let (mut session, _) = active_session(&mock).await;
    let builder = BlindVoteBuilder::new(CommitmentBlinder);

    let (result, _) = tokio::join!(
        builder.build_and_submit(&mut session, ELECTION, "c1"),
        async {
            time::sleep(Duration::from_secs(10)).await;
            gate.notify_one();
        }
    );

    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(mock.count(paths::CAST_VOTE), 0);
    assert_eq!(
        session.phase(),
        Phase::TerminalFailed(Terminal::SessionExpired)
    );
}

#[tokio::test]
async fn unauthorized_response_drops_the_session() {
    let mock = MockAuthority::new();
    mock.reply(paths::BLIND_SIGNATURE, 401, json!({"message": "token revoked"}));
    let (mut session, store) = active_session(&mock).await;

    let err = BlindVoteBuilder::new(CommitmentBlinder)
        .build_and_submit(&mut session, ELECTION, "c1")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthenticated));
    assert_eq!(session.phase(), Phase::Unauthenticated);
    assert!(store.get().unwrap().is_none());
    assert!(session.session().is_none());
}

#[tokio::test]
async fn concurrent_submission_is_refused_locally() {
    let mock = MockAuthority::new();
    let (mut first, _) = active_session(&mock).await;
    let (mut second, _) = active_session(&mock).await;
    let gate = mock.hold(paths::BLIND_SIGNATURE);
    let builder = BlindVoteBuilder::new(CommitmentBlinder);

    let (a, b) = tokio::join!(
        builder.build_and_submit(&mut first, ELECTION, "c1"),
        async {
            tokio::task::yield_now().await;
            let result = builder.build_and_submit(&mut second, ELECTION, "c1").await;
            gate.notify_one();
            result
        }
    );

    assert!(a.is_ok());
    assert!(matches!(b, Err(Error::Busy)));
    assert_eq!(mock.count(paths::BLIND_SIGNATURE), 1);
    assert_eq!(second.phase(), Phase::SessionActive);
}

#[tokio::test]
async fn one_vote_per_session() {
    let mock = MockAuthority::new();
    let (mut session, _) = active_session(&mock).await;
    let builder = BlindVoteBuilder::new(CommitmentBlinder);
    builder
        .build_and_submit(&mut session, ELECTION, "c1")
        .await
        .unwrap();

    assert!(matches!(
        builder.build_and_submit(&mut session, ELECTION, "c1").await,
        Err(Error::InvalidState { .. })
    ));
    assert_eq!(mock.count(paths::CAST_VOTE), 1);
}

#[tokio::test]
async fn wrong_election_or_empty_choice_is_rejected_before_the_network() {
    let mock = MockAuthority::new();
    let (mut session, _) = active_session(&mock).await;
    let builder = BlindVoteBuilder::new(CommitmentBlinder);
    let before = mock.count(paths::HAS_VOTED);

    assert!(matches!(
        builder.build_and_submit(&mut session, "other", "c1").await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        builder.build_and_submit(&mut session, ELECTION, "  ").await,
        Err(Error::Validation(_))
    ));
    assert_eq!(mock.count(paths::HAS_VOTED), before);
    assert_eq!(session.phase(), Phase::SessionActive);
}

#[tokio::test]
async fn cast_conflict_means_already_voted() {
    let mock = MockAuthority::new();
    mock.reply(paths::CAST_VOTE, 409, json!({"message": "duplicate vote"}));
    let (mut session, store) = active_session(&mock).await;
    let builder = BlindVoteBuilder::new(CommitmentBlinder);

    let err = builder
        .build_and_submit(&mut session, ELECTION, "c1")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyVoted));
    assert!(!err.is_retryable());
    assert_eq!(session.phase(), Phase::TerminalFailed(Terminal::AlreadyVoted));
    assert!(store.get().unwrap().is_none());
    assert!(session.session().is_none());

    // A second try stays local.
    assert!(matches!(
        builder.build_and_submit(&mut session, ELECTION, "c1").await,
        Err(Error::AlreadyVoted)
    ));
    assert_eq!(mock.count(paths::BLIND_SIGNATURE), 1);
    assert_eq!(mock.count(paths::CAST_VOTE), 1);
}

#[tokio::test]
async fn signing_conflict_means_already_voted() {
    let mock = MockAuthority::new();
    mock.reply(
        paths::BLIND_SIGNATURE,
        409,
        json!({"message": "already issued"}),
    );
    let (mut session, store) = active_session(&mock).await;
    let builder = BlindVoteBuilder::new(CommitmentBlinder);

    let err = builder
        .build_and_submit(&mut session, ELECTION, "c1")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyVoted));
    assert_eq!(session.phase(), Phase::TerminalFailed(Terminal::AlreadyVoted));
    assert!(store.get().unwrap().is_none());
    assert_eq!(mock.count(paths::CAST_VOTE), 0);

    assert!(matches!(
        builder.build_and_submit(&mut session, ELECTION, "c1").await,
        Err(Error::AlreadyVoted)
    ));
    assert_eq!(mock.count(paths::BLIND_SIGNATURE), 1);
}
