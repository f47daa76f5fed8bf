use std::path::PathBuf;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use chirper_backend::{Backend, BackendConfig};
use chirper_sync::{Chirper, ListEvent};
use chirper_types::{Chirp, SignUpRequest, UserProfile};

const HELP: &str = "\
commands:
  signup <email> <password> <handle> [avatar-url]
  signin <email> <password>
  signout
  post <text>
  like <number>
  pad <text>
  list
  whoami
  quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chirper=debug".into()),
        )
        .init();

    // Config
    let db_path = std::env::var("CHIRPER_DB_PATH").unwrap_or_else(|_| "chirper.db".into());
    let jwt_secret =
        std::env::var("CHIRPER_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let require_auth: bool = std::env::var("CHIRPER_REQUIRE_AUTH")
        .unwrap_or_else(|_| "false".into())
        .parse()
        .context("CHIRPER_REQUIRE_AUTH must be true or false")?;

    let backend = Backend::open(BackendConfig {
        db_path: Some(PathBuf::from(&db_path)),
        jwt_secret,
        require_auth,
        ..Default::default()
    })?;
    info!("Chirper backend opened at {}", db_path);

    let app = Chirper::local(&backend)
        .await
        .context("binding the feed (the console reads it before signing in)")?;
    spawn_feed_printer(&app);

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        if command == "quit" {
            break;
        }
        if let Err(e) = run(&app, command, rest.trim()).await {
            println!("error: {e:#}");
        }
    }

    backend.shutdown();
    Ok(())
}

async fn run(app: &Chirper, command: &str, args: &str) -> anyhow::Result<()> {
    let words: Vec<&str> = args.split_whitespace().collect();

    match (command, words.as_slice()) {
        ("signup", [email, password, handle, rest @ ..]) => {
            let user = app
                .sign_up(SignUpRequest {
                    email: email.to_string(),
                    password: password.to_string(),
                    profile: UserProfile {
                        handle: handle.to_string(),
                        avatar_url: rest.first().map(|s| s.to_string()).unwrap_or_default(),
                    },
                })
                .await?;
            println!("welcome, {} ({})", user.profile.handle, user.id);
        }
        ("signin", [email, password]) => {
            let identity = app.sign_in(email, password).await?;
            println!("signed in as {}", identity.email);
        }
        ("signout", []) => {
            app.sign_out().await;
            println!("signed out");
        }
        ("post", _) => {
            let id = app.post_chirp(args).await?;
            println!("posted {id}");
        }
        ("like", [number]) => {
            let n: usize = number.parse().context("like takes a chirp number from `list`")?;
            let chirp = app
                .chirps()
                .entries()
                .into_iter()
                .nth(n.wrapping_sub(1))
                .with_context(|| format!("no chirp #{n}"))?;
            app.like(&chirp).await?;
        }
        ("pad", _) => {
            app.edit_pad(args).await?;
        }
        ("list", []) => {
            for (i, chirp) in app.chirps().entries().iter().enumerate() {
                println!("{:>3}. {}", i + 1, describe(app, chirp));
            }
            let pad = app.pad().value().unwrap_or_default();
            println!("pad: {}", pad.text);
        }
        ("whoami", []) => match app.current_user() {
            Some(identity) => println!(
                "{} <{}>",
                app.handle_for(&identity.uid).unwrap_or(identity.uid),
                identity.email
            ),
            None => println!("not signed in"),
        },
        ("help", _) => println!("{HELP}"),
        _ => println!("unknown command, try `help`"),
    }
    Ok(())
}

fn describe(app: &Chirper, chirp: &Chirp) -> String {
    let author = app
        .handle_for(&chirp.author_id)
        .unwrap_or_else(|| chirp.author_id.clone());
    let time = chirp
        .created_at
        .resolved()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "pending".into());
    format!("@{} [{}] {} ({} likes)", author, time, chirp.text, chirp.likes)
}

/// Print feed and pad changes made by anyone as they arrive.
fn spawn_feed_printer(app: &Chirper) {
    let mut events = app.chirps().events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ListEvent::Added { entry, .. }) => {
                    println!("+ {}: {}", entry.author_id, entry.text)
                }
                Ok(ListEvent::Changed { entry }) => {
                    println!("~ {} now has {} likes", entry.id, entry.likes)
                }
                Ok(ListEvent::Removed { id }) => println!("- {id}"),
                Err(RecvError::Lagged(n)) => warn!("Feed printer skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut pad = app.pad().watch();
    tokio::spawn(async move {
        while pad.changed().await.is_ok() {
            let text = pad.borrow_and_update().as_ref().map(|d| d.text.clone());
            println!("pad: {}", text.unwrap_or_default());
        }
    });
}
