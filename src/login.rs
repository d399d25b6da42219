use std::io::{self, Write};

use anyhow::{Context, Result};

use crate::config::Config;
use crate::error::Error;
use crate::session::Session;
use crate::token_store::TokenStore;

pub struct LoginArgs {
    pub account_id: String,
    pub quiet: bool,
}

/// Interactive login: reuse a stored token if one validates, otherwise
/// prompt for email/password (and a second factor if OSF demands one) and
/// persist the resulting personal access token. Mirrors the teacher's
/// `run_login` shape (prompt-then-persist) adapted from email-OTP to OSF's
/// Basic-auth + `X-OSF-OTP` flow (SPEC_FULL.md §4.2).
pub async fn run_login(cfg: &Config, args: LoginArgs) -> Result<()> {
    let mut store = TokenStore::load(&cfg.token_store_path()).context("load token store")?;
    let mut session = Session::new(&cfg.api_base).context("build http session")?;

    if let Some(token) = store.get(&args.account_id) {
        if session.login_with_stored_token(token).await.is_ok() {
            if !args.quiet {
                println!("Already logged in as account {}", args.account_id);
            }
            return Ok(());
        }
    }

    let email = prompt_line("Email: ")?;
    let password = prompt_password("Password: ")?;

    let (account_id, token) = match session
        .login_with_password(&email, &password, None)
        .await
    {
        Ok(pair) => pair,
        Err(Error::NeedsSecondFactor) => {
            let otp = prompt_line("Two-factor code: ")?;
            session
                .login_with_password(&email, &password, Some(&otp))
                .await
                .context("login with second factor")?
        }
        Err(e) => return Err(e.into()),
    };

    store.set(&account_id, &token).context("persist token")?;

    if !args.quiet {
        println!("Logged in as account {account_id}");
    }
    Ok(())
}

fn prompt_line(label: &str) -> Result<String> {
    print!("{label}");
    io::stdout().flush().ok();
    let mut line = String::new();
    io::stdin().read_line(&mut line).context("read stdin")?;
    Ok(line.trim().to_string())
}

fn prompt_password(label: &str) -> Result<String> {
    // The teacher's CLI has no password prompt to borrow from (email-OTP
    // flow never collects one); falls back to a visible stdin read rather
    // than pulling in a new terminal-raw-mode dependency for one prompt.
    prompt_line(label)
}
