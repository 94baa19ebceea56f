//! exit-pass CLI entry point.

mod cli;

use chrono::Utc;
use clap::Parser;
use cli::{Cli, CliLogFormat, Command, ItemArg, SessionAction};
use color_eyre::eyre::eyre;
use exit_pass::checkout::{CheckoutRequest, CompletedCheckout, Fulfillment};
use exit_pass::notify::NotificationChannel;
use exit_pass::record::CheckoutSession;
use exit_pass::verification::{ScanOutcome, VerificationState};
use exit_pass::{Gate, GateBuilder, PassVerification};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments
    let cli = Cli::parse();
    let config = cli.to_config()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        CliLogFormat::Text => registry.with(fmt::layer().with_writer(std::io::stderr)).init(),
        CliLogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }

    info!("exit-pass v{}", env!("CARGO_PKG_VERSION"));

    let gate = GateBuilder::new(config).build()?;
    run(&gate, cli.command).await
}

async fn run(gate: &Gate, command: Command) -> color_eyre::Result<()> {
    match command {
        Command::Checkout {
            owner,
            items,
            pickup,
            session_secs,
        } => {
            let started = cli::session_start(Utc::now(), session_secs)
                .ok_or_else(|| eyre!("--session-secs {session_secs} is out of range"))?;
            let done = gate
                .checkout()
                .complete_checkout(CheckoutRequest {
                    owner_id: owner,
                    items: items.into_iter().map(|ItemArg(item)| item).collect(),
                    session_started_at: started,
                    fulfillment: fulfillment(pickup),
                    entropy: None,
                })
                .await?;
            print_checkout(&done);
        }

        Command::Session { action } => run_session(gate, action).await?,

        Command::Refresh { transaction_id } => {
            let pass = gate.checkout().refresh_pass(&transaction_id).await?;
            println!("expires: {}", pass.expires_at);
            println!("{}", pass.token);
        }

        Command::PickupPass { transaction_id } => {
            println!("{}", gate.checkout().issue_pickup_pass(&transaction_id).await?);
        }

        Command::Verify { pass } => match gate.tokens().verify(pass.trim()) {
            PassVerification::Valid(claims) => {
                println!("VALID {} total={} risk={}", claims.id, claims.total, claims.risk_score);
            }
            PassVerification::Expired(claims) => println!("EXPIRED {}", claims.id),
            PassVerification::Invalid(err) => println!("INVALID {err}"),
        },

        Command::Scan {
            input,
            staff,
            release,
            audit,
        } => {
            let terminal = gate.terminal();
            let state = match terminal.handle(&input).await? {
                ScanOutcome::Completed(state) => state,
                ScanOutcome::Dropped => return Err(eyre!("scan dropped")),
            };
            print_state(&state);

            if state.decision().is_some() {
                let outcome = if release {
                    Some(terminal.release(&staff).await?)
                } else if let Some(notes) = audit {
                    Some(terminal.full_audit(&staff, &notes).await?)
                } else {
                    None
                };
                if let Some(outcome) = outcome {
                    println!(
                        "{} {} (ledger updated: {})",
                        outcome.action,
                        outcome.transaction_id,
                        outcome.ledger_updated()
                    );
                }
            }
        }

        Command::List { limit } => {
            for record in gate.ledger().records().await?.into_iter().take(limit) {
                println!(
                    "{:<17} {:<9} total={:<8} risk={:<3} redeemed={:<5} synced={} {}",
                    record.id,
                    record.status,
                    record.total,
                    record.risk_score,
                    record.pass_redeemed,
                    record.synced_to_cloud,
                    record.pickup_code.as_deref().unwrap_or("")
                );
            }
        }

        Command::Watch {
            transaction_id,
            push,
        } => {
            let push_channel = gate.push_channel();
            let polling_channel = gate.polling_channel();
            let channel: &dyn NotificationChannel = if push {
                &push_channel
            } else {
                &polling_channel
            };
            info!("Watching {transaction_id} via {}", channel.name());

            let mut subscription = channel.subscribe(&transaction_id).await?;
            tokio::select! {
                event = subscription.recv() => match event {
                    Some(event) => println!("{}: {}", event.kind.as_str(), event.message),
                    None => println!("notification stream closed"),
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received, stopping watch");
                }
            }
            subscription.unsubscribe();
        }

        Command::InitConfig { path } => {
            gate.config().to_file(&path)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}

async fn run_session(gate: &Gate, action: SessionAction) -> color_eyre::Result<()> {
    let ledger = gate.ledger();
    match action {
        SessionAction::Start { owner } => {
            ledger
                .save_session(&CheckoutSession::start(owner, Utc::now()))
                .await?;
            println!("Session started");
        }
        SessionAction::Add { items } => {
            let mut session = ledger
                .load_session()
                .await?
                .ok_or_else(|| eyre!("no session in progress; run `session start` first"))?;
            for ItemArg(item) in items {
                session.add_item(item);
            }
            ledger.save_session(&session).await?;
            println!("{} lines in cart", session.items.len());
        }
        SessionAction::Show => match ledger.load_session().await? {
            Some(session) => println!("{}", serde_json::to_string_pretty(&session)?),
            None => println!("No session in progress"),
        },
        SessionAction::Pay { pickup } => {
            let done = gate
                .checkout()
                .checkout_session(fulfillment(pickup), None)
                .await?;
            print_checkout(&done);
        }
        SessionAction::Clear => {
            ledger.clear_session().await?;
            println!("Session cleared");
        }
    }
    Ok(())
}

fn fulfillment(pickup: bool) -> Fulfillment {
    if pickup {
        Fulfillment::Pickup
    } else {
        Fulfillment::Exit
    }
}

fn print_checkout(done: &CompletedCheckout) {
    println!("transaction: {}", done.record.id);
    println!(
        "total: {} (subtotal {} + tax {})",
        done.record.total, done.record.subtotal, done.record.tax
    );
    println!("risk: {}", done.record.risk_score);
    println!("expires: {}", done.pass.expires_at);
    println!("pass: {}", done.pass.token);
    if let (Some(code), Some(pass)) = (&done.record.pickup_code, &done.pickup_pass) {
        println!("pickup code: {code}");
        println!("pickup pass: {pass}");
    }
}

fn print_state(state: &VerificationState) {
    match state {
        VerificationState::Success(decision) | VerificationState::Flagged(decision) => {
            println!(
                "{} {} items={} total={} risk={} source={:?}",
                state.name(),
                decision.record.id,
                decision.item_count,
                decision.record.total,
                decision.record.risk_score,
                decision.source
            );
            for reason in &decision.reasons {
                println!("  reason: {reason:?}");
            }
        }
        VerificationState::Expired { transaction_id, .. } => {
            println!("EXPIRED {transaction_id}");
        }
        VerificationState::NotFound { error } => println!("NOT_FOUND {error}"),
        VerificationState::Idle | VerificationState::Verifying => println!("{}", state.name()),
    }
}
