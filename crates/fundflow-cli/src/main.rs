//! fundflow - command-line client for the fundflow crowdfunding platform.
//!
//! Signs in against the backend, keeps the session in the local store and
//! runs authenticated calls through the core request pipeline.

mod credentials;

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use fundflow_core::api::client::{DEFAULT_ADMIN_PAGE, DEFAULT_PROJECT_PAGE};
use fundflow_core::{ApiClient, ApiError, Config, FileStore};
use serde_json::Value;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use credentials::PasswordVault;

const USAGE: &str = "\
Usage: fundflow <command> [args]

Commands:
  login [email]           Sign in with email and password
  magic-link <email>      Email a sign-in link
  verify-link <token>     Sign in with a magic-link token
  logout                  Sign out and forget local credentials
  whoami                  Show the signed-in user
  projects [status]       List public projects
  my-projects             List your projects
  project <slug>          Show one project
  admin users             List users (admin only)
  ai <message>            Send a message to the AI coach";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let mut config = Config::load()?;
    let data_dir = Config::data_dir()?;
    let store = FileStore::open(&data_dir).context("Failed to open credential store")?;
    let client = ApiClient::connect(&config, Arc::new(store))?;
    debug!(api_url = %config.api_url, "Client ready");

    // Keep the session in step with other processes sharing the store
    let poller = client.session().spawn_auth_poller(config.check_auth_interval());

    let result = run(&client, &mut config, command, &args[1..]).await;
    poller.abort();

    if let Err(e) = result {
        if shows_session_ended_hint(command, &e) {
            eprintln!("Your session has ended. Run `fundflow login` to sign in again.");
        }
        return Err(e);
    }
    Ok(())
}

/// A failed `login` already tells the user what went wrong
fn shows_session_ended_hint(command: &str, error: &anyhow::Error) -> bool {
    command != "login"
        && error
            .downcast_ref::<ApiError>()
            .is_some_and(ApiError::is_session_terminal)
}

async fn run(client: &ApiClient, config: &mut Config, command: &str, args: &[String]) -> Result<()> {
    match (command, args) {
        ("login", rest) => login(client, config, rest.first().map(String::as_str)).await,
        ("magic-link", [email, ..]) => {
            print_json(&client.request_magic_link(email).await?);
            Ok(())
        }
        ("verify-link", [token, ..]) => {
            let response = client.verify_magic_link(token).await?;
            println!("Signed in as {}", display_name(&response.user));
            Ok(())
        }
        ("logout", _) => {
            let email = client.stored_user().and_then(|u| u.email);
            sign_out(client).await;
            if let Some(email) = email {
                PasswordVault::forget(&email)?;
            }
            println!("Signed out");
            Ok(())
        }
        ("whoami", _) => {
            if !client.is_authenticated() {
                println!("Not signed in");
                return Ok(());
            }
            let user = client.current_user().await?;
            println!(
                "{}{}",
                display_name(&user),
                if user.is_admin() { " (admin)" } else { "" }
            );
            Ok(())
        }
        ("projects", rest) => {
            let status = rest.first().map(String::as_str);
            print_json(&client.list_projects(status, 0, DEFAULT_PROJECT_PAGE).await?);
            Ok(())
        }
        ("my-projects", _) => {
            print_json(&client.list_my_projects().await?);
            Ok(())
        }
        ("project", [slug, ..]) => {
            print_json(&client.get_project(slug).await?);
            Ok(())
        }
        ("admin", [sub, ..]) if sub == "users" => {
            if !client.is_admin() {
                anyhow::bail!("Admin access required");
            }
            print_json(&client.list_users(0, DEFAULT_ADMIN_PAGE).await?);
            Ok(())
        }
        ("ai", words) if !words.is_empty() => {
            let message = words.join(" ");
            let session_id = if client.is_authenticated() {
                None
            } else {
                Some(client.ai_session_id()?)
            };
            print_json(&client.ai_generate(&message, None, session_id.as_deref()).await?);
            Ok(())
        }
        _ => {
            eprintln!("{}", USAGE);
            anyhow::bail!("Unknown or incomplete command: {}", command)
        }
    }
}

async fn login(client: &ApiClient, config: &mut Config, email: Option<&str>) -> Result<()> {
    let email = match email {
        Some(email) => email.to_string(),
        None => prompt_line("Email", config.last_email.as_deref())?,
    };

    let remembered = PasswordVault::recall(&email);
    let password = match remembered {
        Some(ref stored) if confirm("Use stored password?")? => stored.clone(),
        _ => rpassword::prompt_password("Password: ")?,
    };

    let response = match client.login(&email, &password, None).await {
        Err(ApiError::Request { status: 403, message }) => {
            println!("{}", message);
            let code = prompt_line("Two-factor code", None)?;
            client.login(&email, &password, Some(&code)).await?
        }
        other => other?,
    };

    if remembered.as_deref() != Some(password.as_str()) && confirm("Remember password?")? {
        PasswordVault::remember(&email, &password)?;
    }

    config.last_email = Some(email);
    config.save()?;

    info!(user_id = response.user.id, "Login successful");
    println!("Signed in as {}", display_name(&response.user));
    Ok(())
}

/// Local credentials are gone even when the server cannot be reached
async fn sign_out(client: &ApiClient) {
    if let Err(e) = client.logout().await {
        warn!(error = %e, "Server did not acknowledge logout");
    }
}

fn display_name(user: &fundflow_core::UserSummary) -> String {
    match (&user.full_name, &user.email) {
        (Some(name), Some(email)) => format!("{} <{}>", name, email),
        (None, Some(email)) => email.clone(),
        (Some(name), None) => name.clone(),
        (None, None) => format!("user #{}", user.id),
    }
}

fn prompt_line(label: &str, default: Option<&str>) -> Result<String> {
    match default {
        Some(default) => print!("{} [{}]: ", label, default),
        None => print!("{}: ", label),
    }
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();
    Ok(match default {
        Some(default) if input.is_empty() => default.to_string(),
        _ => input.to_string(),
    })
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [Y/n]: ", question);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_lowercase() != "n")
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(pretty) => println!("{}", pretty),
        Err(_) => println!("{}", value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fundflow_core::storage::{MemoryStore, TOKEN_KEY, USER_KEY};
    use fundflow_core::KeyValueStore;

    #[test]
    fn test_session_hint_skipped_for_login() {
        let expired: anyhow::Error = ApiError::session_expired("").into();
        assert!(!shows_session_ended_hint("login", &expired));
        assert!(shows_session_ended_hint("whoami", &expired));

        let other: anyhow::Error = ApiError::NetworkError("offline".into()).into();
        assert!(!shows_session_ended_hint("whoami", &other));
    }

    #[tokio::test]
    async fn test_sign_out_clears_when_server_unreachable() {
        let store = Arc::new(MemoryStore::new());
        store.set(TOKEN_KEY, "abc").unwrap();
        store.set(USER_KEY, r#"{"id":1,"email":"ada@example.org"}"#).unwrap();
        let config = Config {
            // Nothing listens on the discard port
            api_url: "http://127.0.0.1:9".to_string(),
            ..Config::default()
        };
        let client = ApiClient::connect(&config, store.clone()).unwrap();
        assert!(client.is_authenticated());

        sign_out(&client).await;

        assert!(!client.is_authenticated());
        assert!(store.get(TOKEN_KEY).is_none());
    }
}
