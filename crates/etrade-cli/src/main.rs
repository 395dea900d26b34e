use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Args, Parser, Subcommand};
use etrade_core::api::EtradeClient;
use etrade_core::auth::{
    AuthError, AuthorizationFlow, CaptureMode, FileTokenStore, FlowOptions, TerminalPrompt,
};
use etrade_core::config::ConfigLocator;
use etrade_core::profile::{Profile, ProfileRegistry};
use etrade_core::services::{Account, AccountService, Balance, Portfolio, Quote, QuoteService};
use rust_decimal::Decimal;
use serde_json::json;
use textwrap::wrap;
use tracing_subscriber::EnvFilter;

type Flow = AuthorizationFlow<FileTokenStore>;

#[derive(Parser, Debug)]
#[command(author, version, about = "Read-only E*TRADE accounts and quotes")]
struct Cli {
    /// Directory for stored tokens (overrides ETRADE_TOKEN_DIR)
    #[arg(long, global = true)]
    token_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List configured profiles
    Profiles(JsonArgs),
    /// Authorization and token management
    #[command(subcommand)]
    Auth(AuthCommand),
    /// Account listing, balances and positions
    #[command(subcommand)]
    Accounts(AccountsCommand),
    /// Quotes for one or more symbols
    Quotes(QuotesArgs),
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    /// Run the authorization handshake and store a fresh access token
    Login(LoginArgs),
    /// Revoke and forget the stored token
    Logout(ProfileArgs),
    /// Show the stored token's expiry
    Status(ProfileArgs),
}

#[derive(Subcommand, Debug)]
enum AccountsCommand {
    /// List accounts visible to the profile
    List(ProfileArgs),
    /// Balance for one account
    Balance(AccountArgs),
    /// Positions held in one account
    Portfolio(AccountArgs),
}

#[derive(Args, Debug)]
struct JsonArgs {
    /// Output JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ProfileArgs {
    /// Profile index (ETRADE_<N>_* variables)
    #[arg(long, default_value_t = 0)]
    profile: u32,
    /// Output JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct LoginArgs {
    #[command(flatten)]
    target: ProfileArgs,
    /// Type the verification code into this terminal instead of the local page
    #[arg(long)]
    prompt: bool,
}

#[derive(Args, Debug)]
struct AccountArgs {
    /// Account id key as printed by `accounts list`
    account_id_key: String,
    #[command(flatten)]
    target: ProfileArgs,
}

#[derive(Args, Debug)]
struct QuotesArgs {
    /// Ticker symbols
    #[arg(required = true)]
    symbols: Vec<String>,
    #[command(flatten)]
    target: ProfileArgs,
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let result = runtime.block_on(run(cli));
    // A cancelled terminal prompt may still be parked on stdin; do not wait for it.
    runtime.shutdown_background();
    result
}

async fn run(cli: Cli) -> Result<()> {
    let token_dir = cli.token_dir;
    match cli.command {
        Commands::Profiles(args) => list_profiles(args)?,
        Commands::Auth(cmd) => match cmd {
            AuthCommand::Login(args) => auth_login(token_dir, args).await?,
            AuthCommand::Logout(args) => auth_logout(token_dir, args).await?,
            AuthCommand::Status(args) => auth_status(token_dir, args)?,
        },
        Commands::Accounts(cmd) => match cmd {
            AccountsCommand::List(args) => accounts_list(token_dir, args).await?,
            AccountsCommand::Balance(args) => accounts_balance(token_dir, args).await?,
            AccountsCommand::Portfolio(args) => accounts_portfolio(token_dir, args).await?,
        },
        Commands::Quotes(args) => quotes(token_dir, args).await?,
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_profile(index: u32) -> Result<Profile> {
    let registry = ProfileRegistry::load().context("unable to load profile configuration")?;
    Ok(registry.get(index)?.clone())
}

fn build_flow(
    token_dir: Option<PathBuf>,
    index: u32,
    capture: Option<CaptureMode>,
) -> Result<Arc<Flow>> {
    let profile = load_profile(index)?;
    let locator = token_locator(token_dir)?;

    let mut options = FlowOptions::detect();
    if let Some(mode) = capture {
        options.preference = options.preference.with_capture_mode(mode);
    }

    let store = FileTokenStore::new(locator);
    let flow = AuthorizationFlow::new(profile, store, Arc::new(TerminalPrompt))
        .context("failed to build OAuth client")?
        .with_options(options);
    Ok(Arc::new(flow))
}

fn token_locator(token_dir: Option<PathBuf>) -> Result<ConfigLocator> {
    let locator = match token_dir {
        Some(dir) => ConfigLocator::at(dir),
        None => ConfigLocator::from_env(),
    };
    locator.context("unable to initialise token store")
}

/// First interrupt cancels the handshake; a second one exits immediately.
async fn on_interrupts<S, F>(mut next_interrupt: S, cancel: impl FnOnce(), exit: impl FnOnce())
where
    S: FnMut() -> F,
    F: Future<Output = std::io::Result<()>>,
{
    if next_interrupt().await.is_err() {
        return;
    }
    cancel();
    if next_interrupt().await.is_ok() {
        exit();
    }
}

fn list_profiles(args: JsonArgs) -> Result<()> {
    let registry = ProfileRegistry::load().context("unable to load profile configuration")?;
    if args.json {
        let profiles: Vec<_> = registry
            .profiles()
            .iter()
            .map(|profile| {
                json!({
                    "index": profile.index(),
                    "label": profile.label(),
                    "environment": profile.environment(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&profiles)?);
        return Ok(());
    }

    println!("{:<6} {:<30} {:<12}", "INDEX", "LABEL", "ENVIRONMENT");
    println!("{}", "-".repeat(50));
    for profile in registry.profiles() {
        println!(
            "{:<6} {:<30} {:<12}",
            profile.index(),
            truncate(profile.label(), 30),
            profile.environment().as_str()
        );
    }
    Ok(())
}

async fn auth_login(token_dir: Option<PathBuf>, args: LoginArgs) -> Result<()> {
    let capture = args.prompt.then_some(CaptureMode::Prompt);
    let flow = build_flow(token_dir, args.target.profile, capture)?;
    let interrupts = {
        let flow = Arc::clone(&flow);
        tokio::spawn(on_interrupts(
            tokio::signal::ctrl_c,
            move || flow.cancel(),
            || {
                std::process::exit(130);
            },
        ))
    };
    let outcome = flow.authorize().await;
    interrupts.abort();
    let record = match outcome {
        Ok(record) => record,
        Err(AuthError::Cancelled) => {
            eprintln!("Login cancelled; stored credentials are unchanged.");
            return Ok(());
        }
        Err(err) => return Err(err).context("authorization failed"),
    };

    let profile = flow.profile();
    if args.target.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "profile": profile.index(),
                "label": profile.label(),
                "environment": profile.environment(),
                "expires_at": record.hard_expiry(),
                "idle_expires_at": record.idle_expiry(),
            }))?
        );
    } else {
        println!(
            "Authorized {} ({}). Token valid until {}.",
            profile.label(),
            profile.environment(),
            local_time(record.hard_expiry())
        );
    }
    Ok(())
}

async fn auth_logout(token_dir: Option<PathBuf>, args: ProfileArgs) -> Result<()> {
    let flow = build_flow(token_dir, args.profile, None)?;
    flow.logout()
        .await
        .context("failed to remove stored credentials")?;
    let profile = flow.profile();
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "profile": profile.index(),
                "environment": profile.environment(),
                "logged_out": true,
            }))?
        );
    } else {
        println!(
            "Deleted credentials for {} ({}).",
            profile.label(),
            profile.environment()
        );
    }
    Ok(())
}

fn auth_status(token_dir: Option<PathBuf>, args: ProfileArgs) -> Result<()> {
    let profile = load_profile(args.profile)?;
    let locator = token_locator(token_dir)?;
    let store = FileTokenStore::new(locator);
    let flow = AuthorizationFlow::new(profile, store, Arc::new(TerminalPrompt))
        .context("failed to build OAuth client")?;
    let record = flow
        .current_record()
        .context("failed to read stored credentials")?;
    let profile = flow.profile();
    let now = Utc::now();

    if args.json {
        let status = match &record {
            Some(record) => json!({
                "profile": profile.index(),
                "environment": profile.environment(),
                "authorized": !record.is_expired_at(now),
                "issued_at": record.access.issued_at,
                "last_renewed_at": record.last_renewed_at,
                "expires_at": record.hard_expiry(),
                "idle_expires_at": record.idle_expiry(),
            }),
            None => json!({
                "profile": profile.index(),
                "environment": profile.environment(),
                "authorized": false,
            }),
        };
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Profile   : {} ({})", profile.label(), profile.index());
    println!("Env       : {}", profile.environment());
    let Some(record) = record else {
        let hint = "No stored token. Run `etrade auth login` to authorize this profile; \
                    data commands will also start the handshake on demand.";
        for line in wrap(hint, 80) {
            println!("{line}");
        }
        return Ok(());
    };
    let state = if record.is_expired_at(now) {
        "expired"
    } else if record.idle_expiry() <= now {
        "idle (renewal required)"
    } else {
        "active"
    };
    println!("Status    : {state}");
    println!("Issued    : {}", local_time(record.access.issued_at));
    println!("Renewed   : {}", local_time(record.last_renewed_at));
    println!("Idle by   : {}", local_time(record.idle_expiry()));
    println!("Expires   : {}", local_time(record.hard_expiry()));
    Ok(())
}

async fn accounts_list(token_dir: Option<PathBuf>, args: ProfileArgs) -> Result<()> {
    let flow = build_flow(token_dir, args.profile, None)?;
    let client = EtradeClient::new(flow).context("failed to build API client")?;
    let accounts = AccountService::new(client)
        .list()
        .await
        .context("account list request failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&accounts)?);
    } else {
        render_accounts(&accounts);
    }
    Ok(())
}

async fn accounts_balance(token_dir: Option<PathBuf>, args: AccountArgs) -> Result<()> {
    let flow = build_flow(token_dir, args.target.profile, None)?;
    let client = EtradeClient::new(flow).context("failed to build API client")?;
    let balance = AccountService::new(client)
        .balance(&args.account_id_key)
        .await
        .context("balance request failed")?;

    if args.target.json {
        println!("{}", serde_json::to_string_pretty(&balance)?);
    } else {
        render_balance(&balance);
    }
    Ok(())
}

async fn accounts_portfolio(token_dir: Option<PathBuf>, args: AccountArgs) -> Result<()> {
    let flow = build_flow(token_dir, args.target.profile, None)?;
    let client = EtradeClient::new(flow).context("failed to build API client")?;
    let portfolio = AccountService::new(client)
        .portfolio(&args.account_id_key)
        .await
        .context("portfolio request failed")?;

    if args.target.json {
        println!("{}", serde_json::to_string_pretty(&portfolio)?);
    } else {
        render_portfolio(&portfolio);
    }
    Ok(())
}

async fn quotes(token_dir: Option<PathBuf>, args: QuotesArgs) -> Result<()> {
    let flow = build_flow(token_dir, args.target.profile, None)?;
    let client = EtradeClient::new(flow).context("failed to build API client")?;
    let quotes = QuoteService::new(client)
        .get_quotes(&args.symbols)
        .await
        .context("quote request failed")?;

    if args.target.json {
        println!("{}", serde_json::to_string_pretty(&quotes)?);
    } else {
        render_quotes(&quotes);
    }
    Ok(())
}

fn render_accounts(accounts: &[Account]) {
    println!(
        "{:<12} {:<24} {:<28} {:<12} {:<8}",
        "ACCOUNT", "KEY", "DESCRIPTION", "TYPE", "STATUS"
    );
    println!("{}", "-".repeat(88));
    for account in accounts {
        println!(
            "{:<12} {:<24} {:<28} {:<12} {:<8}",
            account.account_id,
            truncate(&account.account_id_key, 24),
            truncate(&account.account_desc, 28),
            truncate(&account.account_type, 12),
            account.account_status
        );
    }
}

fn render_balance(balance: &Balance) {
    println!("Account   : {} ({})", balance.account_id, balance.account_type);
    if let Some(description) = &balance.account_description {
        println!("Desc      : {}", description);
    }
    println!("Cash      : {}", money(balance.cash_balance));
    println!("Buy power : {}", money(balance.cash_buying_power));
    if balance.margin_buying_power.is_some() {
        println!("Margin BP : {}", money(balance.margin_buying_power));
    }
    println!("Net value : {}", money(balance.net_account_value));
    println!("Total     : {}", money(balance.total_account_value));
}

fn render_portfolio(portfolio: &Portfolio) {
    println!(
        "{:<10} {:>12} {:>12} {:>14} {:>14}",
        "SYMBOL", "QTY", "LAST", "VALUE", "GAIN"
    );
    println!("{}", "-".repeat(66));
    for position in &portfolio.positions {
        println!(
            "{:<10} {:>12} {:>12} {:>14} {:>14}",
            truncate(&position.symbol, 10),
            position.quantity.normalize().to_string(),
            money(position.last_trade),
            money(position.market_value),
            money(position.total_gain)
        );
    }
    println!("{}", "-".repeat(66));
    println!("{:<10} {:>54}", "TOTAL", money(portfolio.total_market_value));
}

fn render_quotes(quotes: &[Quote]) {
    println!(
        "{:<8} {:<28} {:>12} {:>12} {:>12} {:>10}",
        "SYMBOL", "NAME", "LAST", "BID", "ASK", "CHANGE%"
    );
    println!("{}", "-".repeat(87));
    for quote in quotes {
        println!(
            "{:<8} {:<28} {:>12} {:>12} {:>12} {:>10}",
            quote.symbol,
            truncate(quote.company_name.as_deref().unwrap_or("-"), 28),
            money(quote.last_trade),
            money(quote.bid),
            money(quote.ask),
            quote
                .change_pct
                .map_or("-".to_string(), |pct| pct.round_dp(2).to_string())
        );
    }
}

fn money(value: Option<Decimal>) -> String {
    value.map_or("-".to_string(), |amount| amount.round_dp(2).to_string())
}

fn local_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M %Z").to_string()
}

fn truncate(value: &str, max_len: usize) -> String {
    if value.chars().count() <= max_len {
        return value.to_owned();
    }
    let mut collected: String = value.chars().take(max_len.saturating_sub(1)).collect();
    collected.push('…');
    collected
}
