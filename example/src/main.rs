use ballotbox::{Client, Config, Credential, Error, Phase};
use ballotbox_shared::{Election, StringConversion};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const USAGE: &str = "usage: example <aadhaar> <voter-id> <name> [election-id] [candidate-id]";

type StdinLines = tokio::io::Lines<BufReader<tokio::io::Stdin>>;

async fn read_line(prompt: &str, lines: &mut StdinLines) -> Result<String, Error> {
    println!("{}", prompt);
    lines
        .next_line()
        .await?
        .ok_or_else(|| Error::Validation("stdin closed".into()))
}

fn pick_election(elections: Vec<Election>, wanted: Option<&str>) -> Result<Election, Error> {
    let found = match wanted {
        Some(id) => elections.into_iter().find(|e| e.id == id),
        None => elections.into_iter().next(),
    };
    found.ok_or_else(|| Error::Validation("no matching active election".into()))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();
    let config = Config::from_env()?;
    let client = Client::new(config)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut session = client.resume_session(client.session_store())?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    let election = pick_election(
        client.active_elections().await?,
        args.get(3).map(String::as_str),
    )?;
    info!("election: {} ({} candidates)", election.title, election.candidates.len());

    let resumed = session.phase() == Phase::SessionActive
        && session.election_id() == Some(election.id.as_str());
    if !resumed {
        if args.len() < 3 {
            eprintln!("{}", USAGE);
            return Err(Error::Validation("missing credentials".into()));
        }
        session.abandon();
        let credential = Credential::new(&args[0], &args[1], &args[2])?;
        let details = session.verify_identity(credential, &election.id).await?;
        info!("identity verified: {:?}", details.name);

        let dispatch = session.send_otp().await?;
        info!(
            "code sent to {}, valid until {}",
            dispatch.masked_email.as_deref().unwrap_or("your registered email"),
            dispatch.expires_at
        );
        let mut tries = 0;
        loop {
            let code = read_line("enter the 6-digit code:", &mut stdin).await?;
            match session.verify_otp(&code).await {
                Ok(()) => break,
                Err(e) if e.is_retryable() && tries < 2 => {
                    warn!("{}", e);
                    tries += 1;
                }
                Err(e) => return Err(e),
            }
        }
        session.create_session(true).await?;
    }

    let candidate = match args.get(4) {
        Some(id) => election
            .candidate(id)
            .ok_or_else(|| Error::Validation(format!("no candidate {}", id)))?,
        None => election
            .candidates
            .first()
            .ok_or_else(|| Error::Validation("election has no candidates".into()))?,
    };
    info!("voting for {}", candidate.display_name());

    let outcome = if client.config().authority_key.is_some() {
        client
            .rsa_vote_builder()?
            .build_and_submit(&mut session, &election.id, &candidate.id)
            .await?
    } else {
        client
            .vote_builder()
            .build_and_submit(&mut session, &election.id, &candidate.id)
            .await?
    };
    info!("cast {}", outcome.vote_id().as_string());

    let tracker = client.receipts();
    let poll = tracker.spawn_poll(&election.id, outcome.vote_id());
    match &outcome.verification {
        Some(token) => {
            tracker.track_token(token);
            let (receipt, choice) =
                futures_util::future::join(poll.wait(), tracker.redeem_verification_token(token))
                    .await;
            info!("receipt: {:?}", receipt?);
            info!("recorded choice: {}", choice?);
        }
        None => info!("receipt: {:?}", poll.wait().await?),
    }
    Ok(())
}
