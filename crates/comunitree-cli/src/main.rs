use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use comunitree_core::{
    keys, Authenticator, ConfigBuilder, EnvSource, FileSource, LayeredSource,
};
use comunitree_warehouse::{
    key_material_present, KeyPairBootstrapper, SnowflakeDriver, Value, Warehouse,
};

mod schema;

const DEFAULT_CONFIG_FILE: &str = "comunitree.toml";

/// Comunitree database tooling
#[derive(Parser)]
#[command(name = "comunitree-db")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: comunitree.toml, below the environment)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the Comunitree database, schema and tables
    InitDb {
        /// Register a new key pair if key-pair auth is configured but no key exists
        #[arg(long)]
        bootstrap_key_pair: bool,

        /// How to log in once while registering the key
        #[arg(long, value_enum, default_value = "browser")]
        bootstrap_auth: BootstrapAuth,

        /// MFA code for the bootstrap login (prompted on a terminal otherwise)
        #[arg(long)]
        passcode: Option<String>,

        /// Where to store the private key (default: SNOWFLAKE_PRIVATE_KEY_PATH
        /// or ./snowflake_rsa_key.p8)
        #[arg(long)]
        key_path: Option<PathBuf>,
    },

    /// Run one statement and print its rows as JSON
    Query {
        sql: String,

        /// Positional bind value, in order (repeatable)
        #[arg(short, long = "bind")]
        binds: Vec<String>,
    },

    /// Verify that a session can be opened
    Check,

    /// Print the resolved configuration without secrets
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BootstrapAuth {
    Mfa,
    Browser,
    Password,
}

impl BootstrapAuth {
    fn authenticator(self) -> Authenticator {
        match self {
            Self::Mfa => Authenticator::UsernamePasswordMfa,
            Self::Browser => Authenticator::ExternalBrowser,
            Self::Password => Authenticator::Snowflake,
        }
    }
}

struct InitOptions {
    bootstrap_key_pair: bool,
    bootstrap_auth: BootstrapAuth,
    passcode: Option<String>,
    key_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let builder = match load_builder(cli.config.as_deref(), cli.verbose) {
        Ok(builder) => builder,
        Err(e) => fail(e),
    };
    let warehouse = Warehouse::new(builder, Arc::new(SnowflakeDriver::new()));

    let result = match cli.command {
        Commands::InitDb {
            bootstrap_key_pair,
            bootstrap_auth,
            passcode,
            key_path,
        } => {
            let options = InitOptions {
                bootstrap_key_pair,
                bootstrap_auth,
                passcode,
                key_path,
            };
            init_db_command(&warehouse, options, prompt_passcode).await
        }
        Commands::Query { sql, binds } => query_command(&warehouse, &sql, &binds).await,
        Commands::Check => check_command(&warehouse, cli.verbose).await,
        Commands::Config => config_command(&warehouse),
    };

    warehouse.close().await;

    if let Err(e) = result {
        fail(e);
    }
}

fn fail(error: anyhow::Error) -> ! {
    eprintln!("{} {:#}", "Error:".red().bold(), error);
    std::process::exit(1);
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "comunitree_core={level},comunitree_warehouse={level},comunitree_db={level}"
        ))
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Environment first, then the config file if one is given or present
fn load_builder(config: Option<&Path>, verbose: bool) -> Result<ConfigBuilder> {
    let mut source = LayeredSource::new().with_layer(EnvSource::new());

    let path = match config {
        Some(path) => Some(path.to_path_buf()),
        None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
    };

    match path {
        Some(path) => {
            let file = FileSource::from_file(&path)
                .with_context(|| format!("cannot load {}", path.display()))?;
            if verbose {
                eprintln!("{} {}", "Using config:".cyan(), path.display());
            }
            source = source.with_layer(file);
        }
        None if verbose => {
            eprintln!("{}", "No config file found, using environment only".yellow());
        }
        None => {}
    }

    Ok(ConfigBuilder::new(source))
}

/// Make sure a passcode is available for an MFA login
fn ensure_passcode(
    builder: &ConfigBuilder,
    passcode: Option<&str>,
    prompt: fn() -> Result<String>,
) -> Result<()> {
    if let Some(code) = passcode.map(str::trim).filter(|c| !c.is_empty()) {
        builder.set_override(keys::PASSCODE, code);
        return Ok(());
    }
    if builder.get(keys::PASSCODE).is_some() {
        return Ok(());
    }

    let code = prompt()?;
    if code.is_empty() {
        anyhow::bail!("no MFA code entered");
    }
    builder.set_override(keys::PASSCODE, code);
    Ok(())
}

fn prompt_passcode() -> Result<String> {
    if !std::io::stdin().is_terminal() {
        anyhow::bail!(
            "Cannot prompt for MFA: stdin is not a TTY. Set SNOWFLAKE_PASSCODE or pass --passcode."
        );
    }

    eprint!("Enter your 6-digit MFA code from authenticator app: ");
    std::io::stderr().flush()?;

    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Init-db command - optional key-pair bootstrap, then the schema
async fn init_db_command(
    warehouse: &Warehouse,
    options: InitOptions,
    prompt: fn() -> Result<String>,
) -> Result<()> {
    let builder = warehouse.builder();

    if let Some(path) = &options.key_path {
        builder.set_override(keys::PRIVATE_KEY_PATH, path.display().to_string());
    }

    let wants_key_pair = builder.authenticator() == Some(Authenticator::KeyPairJwt);
    let needs_key = wants_key_pair && !key_material_present(builder);

    if needs_key {
        let target = builder.key_path_or_default();
        if !options.bootstrap_key_pair {
            anyhow::bail!(
                "Key-pair auth is configured but no key was found at {}. \
                 Re-run with --bootstrap-key-pair to register a new key using a one-time login.",
                target.display()
            );
        }

        let via = options.bootstrap_auth.authenticator();
        eprintln!(
            "{} no key found, logging in once with {} to register one",
            "Key-pair:".cyan(),
            via
        );

        builder.set_override(keys::AUTHENTICATOR, via.as_str());
        builder.unset(keys::PRIVATE_KEY_PATH);
        if via == Authenticator::UsernamePasswordMfa {
            tokio::task::block_in_place(|| {
                ensure_passcode(builder, options.passcode.as_deref(), prompt)
            })?;
        }

        let config = warehouse.reconfigure().await;
        let username = config.username()?.to_string();

        let outcome = KeyPairBootstrapper::for_builder(builder)
            .setup_key_pair(warehouse, &username, &target)
            .await?;

        if outcome.used_fallback {
            eprintln!(
                "{} could not write {}, key stored at {}",
                "⚠ Warning:".yellow(),
                target.display(),
                outcome.key_path.display()
            );
        }
        eprintln!(
            "{} {} ({})",
            "✓ Key registered:".green(),
            outcome.key_path.display(),
            outcome.fingerprint
        );
        eprintln!(
            "  Set SNOWFLAKE_AUTHENTICATOR=SNOWFLAKE_JWT and SNOWFLAKE_PRIVATE_KEY_PATH={}",
            outcome.key_path.display()
        );

        warehouse.switch_to_key_pair(&outcome.key_path).await;
    } else if builder.authenticator() == Some(Authenticator::UsernamePasswordMfa) {
        tokio::task::block_in_place(|| {
            ensure_passcode(builder, options.passcode.as_deref(), prompt)
        })?;
        warehouse.reconfigure().await;
    }

    let config = warehouse.config();
    let report = schema::run_schema(warehouse, &config.database, &config.schema).await?;

    for table in &report.tables {
        eprintln!("  {} {}", "✓".green(), table);
    }
    for column in &report.columns_skipped {
        eprintln!("  {} events.{} already exists", "-".dimmed(), column);
    }
    eprintln!("{}", "✓ Comunitree DB init done".green().bold());
    Ok(())
}

/// Bind values from the command line: null, booleans and numbers are typed,
/// everything else is text
fn parse_bind(raw: &str) -> Value {
    match raw {
        "null" | "NULL" => Value::Null,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => {
            if let Ok(i) = raw.parse::<i64>() {
                Value::Integer(i)
            } else if let Some(f) = raw.parse::<f64>().ok().filter(|f| f.is_finite()) {
                Value::Float(f)
            } else {
                Value::Text(raw.to_string())
            }
        }
    }
}

/// Query command - rows as pretty JSON on stdout
async fn query_command(warehouse: &Warehouse, sql: &str, binds: &[String]) -> Result<()> {
    let binds: Vec<Value> = binds.iter().map(|b| parse_bind(b)).collect();
    let rows = warehouse.query(sql, &binds).await?;

    let json = serde_json::Value::Array(rows.into_iter().map(|r| r.into_json()).collect());
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

/// Check command - open a session and report the server version
async fn check_command(warehouse: &Warehouse, verbose: bool) -> Result<()> {
    if verbose {
        eprintln!(
            "{} {} ({})",
            "Connecting to".cyan(),
            warehouse.driver_name(),
            warehouse.strategy()
        );
    }

    let rows = warehouse
        .query("SELECT CURRENT_VERSION()", &[])
        .await
        .context("Failed to connect to warehouse")?;

    let version = rows
        .first()
        .and_then(|row| row.columns().next().and_then(|c| row.get(c)))
        .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    println!("{} version {}", "✓ Connection successful,".green(), version);
    Ok(())
}

/// Config command - print what would be used to connect
fn config_command(warehouse: &Warehouse) -> Result<()> {
    let config = warehouse.config();
    println!("{}", config.redacted_summary());

    if let Err(e) = config.validate() {
        eprintln!("{} {} ({})", "⚠ Warning:".yellow(), e, e.code());
    }
    Ok(())
}
