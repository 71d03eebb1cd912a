use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio::task;
use voyage_core::api::{ApiRequest, HttpTransport};
use voyage_core::auth::{
    AuthError, AuthManager, CredentialStore, FileStorage, RegisterRequest, UserProfile,
};
use voyage_core::config::{ClientConfig, ConfigLocator};

const DEFAULT_PROFILE: &str = "default";

#[derive(Parser, Debug)]
#[command(author, version, about = "Voyage travel-booking terminal client")]
struct Cli {
    /// Profile name for stored credentials
    #[arg(long, global = true, default_value = DEFAULT_PROFILE)]
    profile: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Authentication related commands
    #[command(subcommand)]
    Auth(AuthCommand),
    /// User account details
    #[command(subcommand)]
    User(UserCommand),
    /// Send an authenticated request to the API
    Request(RequestArgs),
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    /// Log in with email and password
    Login(LoginArgs),
    /// Create a new account
    Register(RegisterArgs),
    /// Forget stored credentials and notify the server
    Logout,
    /// Show what is stored for the profile
    Status(StatusArgs),
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    /// Show the current authenticated user
    Me(MeArgs),
}

#[derive(Args, Debug)]
struct LoginArgs {
    #[arg(long)]
    email: String,
    /// Password; prompted for when omitted
    #[arg(long, env = "VOYAGE_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[derive(Args, Debug)]
struct RegisterArgs {
    #[arg(long = "first-name")]
    first_name: String,
    #[arg(long = "last-name")]
    last_name: String,
    #[arg(long)]
    email: String,
    #[arg(long)]
    login: String,
    #[arg(long, default_value = "client")]
    role: String,
    #[arg(long, default_value = "")]
    phone: String,
    /// Password; prompted for when omitted
    #[arg(long, env = "VOYAGE_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct MeArgs {
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct RequestArgs {
    /// HTTP method (GET, POST, PUT, DELETE, ...)
    method: String,
    /// Path relative to the API root, e.g. /bookings
    path: String,
    /// JSON body
    #[arg(long)]
    data: Option<String>,
}

fn main() -> ExitCode {
    voyage_core::logging::init();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = runtime.block_on(run()) {
        match err.downcast_ref::<AuthError>() {
            Some(auth_err) => eprintln!("{}\n{err:?}", auth_err.user_message()),
            None => eprintln!("{err:?}"),
        }
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let manager = build_manager(&cli.profile)?;
    match cli.command {
        Commands::Auth(cmd) => match cmd {
            AuthCommand::Login(args) => auth_login(&manager, &cli.profile, args).await?,
            AuthCommand::Register(args) => auth_register(&manager, args).await?,
            AuthCommand::Logout => auth_logout(&manager, &cli.profile).await?,
            AuthCommand::Status(args) => auth_status(&manager, args)?,
        },
        Commands::User(cmd) => match cmd {
            UserCommand::Me(args) => user_me(&manager, args).await?,
        },
        Commands::Request(args) => send_request(&manager, args).await?,
    }
    Ok(())
}

fn build_manager(profile: &str) -> Result<AuthManager<HttpTransport>> {
    let config = ClientConfig::from_env().context("invalid client configuration")?;
    tracing::debug!(profile, api_url = %config.api_url, "client configured");
    let locator = ConfigLocator::new().context("unable to locate configuration directory")?;
    let storage = FileStorage::for_profile(&locator, profile)
        .context("unable to initialise credential store")?;
    AuthManager::connect(&config, CredentialStore::new(storage))
        .context("failed to build API client")
}

async fn auth_login(
    manager: &AuthManager<HttpTransport>,
    profile: &str,
    args: LoginArgs,
) -> Result<()> {
    let password = match args.password {
        Some(password) => password,
        None => prompt("Password: ").await?,
    };
    let credential = manager
        .auth()
        .login(&args.email, &password)
        .await
        .context("login failed")?;

    println!("Login succeeded. Credentials stored for profile '{profile}'.");
    if let Some(user) = manager.session().current_user() {
        println!("Logged in as {} <{}> ({})", user.display_name(), user.email, user.role);
    }
    println!("Token expires at {} (UTC).", credential.expires_at);
    Ok(())
}

async fn auth_register(manager: &AuthManager<HttpTransport>, args: RegisterArgs) -> Result<()> {
    let password = match args.password {
        Some(password) => password,
        None => prompt("Password: ").await?,
    };
    let ack = manager
        .auth()
        .register(&RegisterRequest {
            first_name: args.first_name,
            last_name: args.last_name,
            email: args.email.clone(),
            login: args.login,
            password,
            role: args.role,
            phone: args.phone,
        })
        .await
        .context("registration failed")?;

    if let Some(error) = ack.error {
        return Err(anyhow!("registration refused: {error}"));
    }
    println!(
        "{}",
        ack.message
            .unwrap_or_else(|| format!("Account created for {}.", args.email))
    );
    Ok(())
}

async fn auth_logout(manager: &AuthManager<HttpTransport>, profile: &str) -> Result<()> {
    manager
        .auth()
        .logout(false)
        .await
        .context("failed to remove stored credentials")?;
    println!("Deleted credentials for profile '{profile}'.");
    Ok(())
}

fn auth_status(manager: &AuthManager<HttpTransport>, args: StatusArgs) -> Result<()> {
    let cached_user = match manager.store().load_user() {
        Ok(user) => user,
        Err(err) => {
            eprintln!("warning: {err}; stored credentials were discarded");
            None
        }
    };
    let snapshot = manager.store().snapshot();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }
    if !snapshot.has_token {
        println!("Not logged in.");
        return Ok(());
    }
    let token_type = snapshot.token_type.as_deref().unwrap_or("Bearer");
    match (snapshot.is_valid, snapshot.expires_at) {
        (true, Some(expiry)) => println!(
            "{token_type} token valid until {expiry} (UTC), {} minutes left.",
            manager.store().remaining().num_minutes()
        ),
        (_, Some(expiry)) => println!("{token_type} token expired at {expiry} (UTC)."),
        (_, None) => println!("{token_type} token has no recorded expiry."),
    }
    if let Some(user) = cached_user {
        println!("Cached user: {} <{}>", user.display_name(), user.email);
    }
    Ok(())
}

async fn user_me(manager: &AuthManager<HttpTransport>, args: MeArgs) -> Result<()> {
    manager.start().await;
    if !manager.session().wait_for_auth().await {
        return Err(anyhow!(
            "not logged in; run `voyage auth login --email <email>` first"
        ));
    }
    let user = manager
        .session()
        .current_user()
        .ok_or(AuthError::Unauthenticated)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&user)?);
    } else {
        render_user(&user);
    }
    Ok(())
}

fn render_user(user: &UserProfile) {
    println!("{}", user.display_name());
    println!("  email: {}", user.email);
    if !user.login.is_empty() {
        println!("  login: {}", user.login);
    }
    println!("  role:  {}", user.role);
    if !user.phone.is_empty() {
        println!("  phone: {}", user.phone);
    }
    if let Some(id) = user.id {
        println!("  id:    {id}");
    }
}

async fn send_request(manager: &AuthManager<HttpTransport>, args: RequestArgs) -> Result<()> {
    let method = parse_method(&args.method)?;
    let mut request = ApiRequest::new(method, args.path);
    if let Some(data) = args.data {
        let body: Value = serde_json::from_str(&data).context("--data is not valid JSON")?;
        request = request.json(&body)?;
    }
    let response = manager.api().send(request).await?;
    let status = response.status();
    match response.json::<Value>() {
        Ok(body) => println!("{}", serde_json::to_string_pretty(&body)?),
        Err(_) => println!("{}", response.text()),
    }
    if !status.is_success() {
        return Err(anyhow!("request failed with status {status}"));
    }
    Ok(())
}

fn parse_method(raw: &str) -> Result<voyage_core::api::Method> {
    voyage_core::api::Method::from_str(&raw.to_ascii_uppercase())
        .map_err(|_| anyhow!("invalid HTTP method '{raw}'"))
}

async fn prompt(label: &'static str) -> Result<String> {
    task::spawn_blocking(move || -> Result<String> {
        use std::io::{self, Write};
        print!("{label}");
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        Ok(input.trim_end_matches(['\r', '\n']).to_owned())
    })
    .await
    .context("input prompt aborted")?
}
