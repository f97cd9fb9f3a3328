//! Keywarden agent CLI: thin wiring around the session library.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keywarden_agent::client::ApiClient;
use keywarden_agent::config::AgentConfig;
use keywarden_agent::session::{self, NewUser, Session};
use keywarden_agent::AgentError;
use keywarden_core::model::{Item, ItemType, SecretPayload};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Keywarden agent - client for the keywarden secret vault
#[derive(Parser)]
#[command(name = "keywarden", about = "Keywarden secret vault agent")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level override
    #[arg(short, long)]
    log_level: Option<String>,

    /// Disable TLS (testing only)
    #[arg(long)]
    disable_tls: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new account on the configured server
    Register {
        /// Enable two-factor authentication
        #[arg(long)]
        two_factor: bool,

        /// E-mail address
        #[arg(long)]
        email: Option<String>,
    },

    /// List all stored items
    List,

    /// Show a single item
    Get {
        /// Item name
        name: String,

        /// Item type (login/card/note/data)
        #[arg(long, default_value = "login")]
        item_type: String,
    },

    /// Store a login item
    Add {
        /// Item name
        name: String,

        /// Login username
        #[arg(long)]
        username: String,

        /// Notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// Store a file as a secure data item
    AddData {
        /// Item name
        name: String,

        /// File to store
        file: PathBuf,
    },

    /// Write a secure data item's payload to a file
    GetData {
        /// Item name
        name: String,

        /// Output file
        output: PathBuf,
    },

    /// Delete an item by id
    Delete {
        /// Item id
        id: i64,
    },

    /// Show account information
    Account,

    /// Delete the account and all stored items
    DeleteAccount {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Run one forced synchronization cycle
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AgentConfig::load(cli.config.as_deref())?;
    if let Some(level) = &cli.log_level {
        config.loglevel = level.clone();
    }
    if cli.disable_tls {
        config.disabletls = true;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(config.loglevel.parse()?))
        .init();

    config.validate().map_err(|e| anyhow::anyhow!("{e}"))?;
    let client = Arc::new(ApiClient::new(&config).context("failed to build client")?);

    if let Commands::Register { two_factor, email } = &cli.command {
        return register(&config, &client, *two_factor, email.clone()).await;
    }

    let shared = keywarden_agent::config::shared(config);
    let mut session = Session::new(client, shared);

    let (status_tx, mut status_rx) = tokio::sync::mpsc::channel(16);
    tokio::spawn(async move {
        while let Some(status) = status_rx.recv().await {
            tracing::info!(status, "sync");
        }
    });

    login_with_prompt(&mut session, status_tx).await?;

    let outcome = run_command(&mut session, cli.command).await;
    session.logout().await;
    outcome
}

async fn register(
    config: &AgentConfig,
    client: &ApiClient,
    two_factor: bool,
    email: Option<String>,
) -> Result<()> {
    let password = rpassword::prompt_password("New account password: ")?;
    let confirm = rpassword::prompt_password("Confirm password: ")?;

    let totp_key = session::register(
        client,
        &NewUser {
            username: config.user.clone(),
            password,
            password_confirm: confirm,
            secret_key: config.secretkey.clone(),
            email: email.unwrap_or_default(),
            two_factor,
        },
    )
    .await?;

    println!("registered user '{}'", config.user);
    if let Some(totp_key) = totp_key {
        let qr_path = AgentConfig::config_dir().join("totp-qr.png");
        std::fs::write(&qr_path, &totp_key.qr_png)?;
        println!("TOTP secret: {}", totp_key.secret);
        println!("QR code written to {}", qr_path.display());
    }
    Ok(())
}

async fn login_with_prompt(
    session: &mut Session,
    status_tx: tokio::sync::mpsc::Sender<&'static str>,
) -> Result<()> {
    let password = rpassword::prompt_password("Password: ")?;

    match session.login(&password, "", status_tx.clone()).await {
        Ok(()) => Ok(()),
        Err(AgentError::SecondFactorRequired) => {
            let code = rpassword::prompt_password("Verification code: ")?;
            session.login(&password, code.trim(), status_tx).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_command(session: &mut Session, command: Commands) -> Result<()> {
    match command {
        Commands::Register { .. } => unreachable!("handled before login"),

        Commands::List => {
            for item in session.list_items().await? {
                let item_type = ItemType::from_code(&item.item_type)
                    .map(|t| t.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                println!("{:>6}  {:<12}  {}", item.id, item_type, item.name);
            }
            Ok(())
        }

        Commands::Get { name, item_type } => {
            let item_type: ItemType = item_type.parse().map_err(|e| anyhow::anyhow!("{e}"))?;
            let item = session.get_item(&name, item_type).await?;

            println!("name: {}", item.name);
            println!("type: {}", item.item_type);
            if !item.notes.is_empty() {
                println!("notes: {}", item.notes);
            }
            if let Some(secret) = &item.secret {
                println!("secret: {}", secret.display_masked());
            }
            for uri in &item.uris {
                println!("uri: {}", uri.uri);
            }
            Ok(())
        }

        Commands::Add {
            name,
            username,
            notes,
        } => {
            let password = rpassword::prompt_password("Item password: ")?;
            let item = Item {
                name,
                item_type: ItemType::Login,
                notes: notes.unwrap_or_default(),
                secret: Some(SecretPayload::Login {
                    username,
                    password,
                    authkey: String::new(),
                }),
                ..Item::default()
            };

            session.save_item(&item).await?;
            println!("item '{}' saved", item.name);
            Ok(())
        }

        Commands::AddData { name, file } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let item = Item {
                name,
                item_type: ItemType::SecData,
                secret: Some(SecretPayload::Data { bytes }),
                ..Item::default()
            };

            session.save_item(&item).await?;
            println!("item '{}' saved", item.name);
            Ok(())
        }

        Commands::GetData { name, output } => {
            let item = session.get_item(&name, ItemType::SecData).await?;
            match item.secret {
                Some(SecretPayload::Data { bytes }) => {
                    std::fs::write(&output, bytes)?;
                    println!("payload written to {}", output.display());
                    Ok(())
                }
                _ => anyhow::bail!("item '{name}' carries no data payload"),
            }
        }

        Commands::Delete { id } => {
            session.delete_item(id).await?;
            println!("item {id} deleted");
            Ok(())
        }

        Commands::Account => {
            let user = session.account().await?;
            println!("username: {}", user.username);
            if let Some(email) = user.email {
                println!("email: {email}");
            }
            if let Some(regdate) = user.regdate {
                println!("registered: {regdate}");
            }
            Ok(())
        }

        Commands::DeleteAccount { yes } => {
            if !yes {
                anyhow::bail!("refusing to delete the account without --yes");
            }
            session.delete_account().await?;
            println!("account deleted");
            Ok(())
        }

        Commands::Sync => {
            session.sync_now().await;
            let items = session.list_items().await?;
            println!("synced; {} items", items.len());
            Ok(())
        }
    }
}
