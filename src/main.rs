use agenda_checkout::config::{config_path, load_config, save_config, AppConfig, ClientConfig};
use agenda_checkout::logging::init_logging;
use agenda_checkout::psp::mercadopago::MercadoPagoClient;
use agenda_checkout::psp::mock::MockProvider;
use agenda_checkout::psp::notification::Notification;
use agenda_checkout::psp::{CheckoutProvider, Order};
use agenda_checkout::watch::{watch_payment, WatchOptions};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "agenda-checkout",
    author,
    version,
    about = "Agenda.doc checkout tooling",
    long_about = None
)]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long, env = "AGENDA_CHECKOUT_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ProviderKind::Mercadopago, global = true)]
    provider: ProviderKind,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProviderKind {
    Mercadopago,
    Mock,
}

#[derive(Subcommand)]
enum Command {
    #[command(subcommand)]
    Preference(PreferenceCommand),
    #[command(subcommand)]
    Payment(PaymentCommand),
    /// Resolve a webhook body to the payment it refers to
    Notify {
        #[arg(long)]
        body: PathBuf,
    },
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum PreferenceCommand {
    /// Create a checkout preference from an order JSON file
    Create {
        #[arg(long)]
        order: PathBuf,
        /// Overrides the order's own idempotency key
        #[arg(long)]
        idempotency_key: Option<String>,
    },
}

#[derive(Subcommand)]
enum PaymentCommand {
    Get {
        id: String,
    },
    /// Poll until the payment settles
    Watch {
        id: String,
        #[arg(long, default_value_t = 10)]
        interval_secs: u64,
        #[arg(long, default_value_t = 900)]
        deadline_secs: u64,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write default settings
    Init {
        #[arg(long)]
        force: bool,
    },
    Show,
}

fn build_provider(kind: ProviderKind, settings: &AppConfig) -> Result<Arc<dyn CheckoutProvider>> {
    let provider: Arc<dyn CheckoutProvider> = match kind {
        ProviderKind::Mock => Arc::new(MockProvider::new()),
        ProviderKind::Mercadopago => {
            let config = ClientConfig::from_env(settings)?;
            Arc::new(MercadoPagoClient::configure(config)?)
        }
    };
    Ok(provider)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging("info");

    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(config_path);
    let settings = load_config(&path)?;

    run(cli.command, cli.provider, &path, &settings).await
}

async fn run(
    command: Command,
    kind: ProviderKind,
    path: &Path,
    settings: &AppConfig,
) -> Result<()> {
    // Built before any input is read, so a missing token fails first.
    let provider = || -> Result<Arc<dyn CheckoutProvider>> {
        let provider = build_provider(kind, settings)?;
        info!(provider = provider.name(), "checkout provider ready");
        Ok(provider)
    };

    match command {
        Command::Config(cmd) => run_config(cmd, path, settings),
        Command::Preference(PreferenceCommand::Create {
            order,
            idempotency_key,
        }) => {
            let provider = provider()?;
            let data = std::fs::read_to_string(&order)
                .with_context(|| format!("reading order {}", order.display()))?;
            let mut order: Order = serde_json::from_str(&data).context("parsing order")?;
            if let Some(key) = idempotency_key {
                order.idempotency_key = key;
            }
            let handle = provider.create_preference(&order).await?;
            print_json(&handle)
        }
        Command::Payment(PaymentCommand::Get { id }) => {
            let provider = provider()?;
            let record = provider.get_payment(&id).await?;
            print_json(&record)
        }
        Command::Payment(PaymentCommand::Watch {
            id,
            interval_secs,
            deadline_secs,
        }) => {
            let provider = provider()?;
            let options = WatchOptions {
                interval: Duration::from_secs(interval_secs.max(1)),
                deadline: Duration::from_secs(deadline_secs),
            };
            let outcome = watch_payment(provider.as_ref(), &id, options).await?;
            if outcome.timed_out {
                anyhow::bail!(
                    "payment {} still {} after {}s",
                    id,
                    outcome.record.status,
                    deadline_secs
                );
            }
            print_json(&outcome.record)
        }
        Command::Notify { body } => {
            let provider = provider()?;
            let bytes = std::fs::read(&body)
                .with_context(|| format!("reading notification {}", body.display()))?;
            match Notification::parse(&bytes)? {
                Notification::Payment { payment_id } => {
                    let record = provider.get_payment(&payment_id).await?;
                    print_json(&record)
                }
                Notification::Other { topic } => {
                    info!(%topic, "ignoring non-payment notification");
                    Ok(())
                }
            }
        }
    }
}

fn run_config(cmd: ConfigCommand, path: &Path, settings: &AppConfig) -> Result<()> {
    match cmd {
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists, pass --force to overwrite", path.display());
            }
            save_config(path, &AppConfig::default())?;
            println!("wrote {}", path.display());
            Ok(())
        }
        ConfigCommand::Show => {
            let token_set = std::env::var(agenda_checkout::config::ACCESS_TOKEN_ENV)
                .map(|t| !t.trim().is_empty())
                .unwrap_or(false);
            print_json(&serde_json::json!({
                "path": path.display().to_string(),
                "access_token": if token_set { "<set>" } else { "<missing>" },
                "settings": settings,
            }))
        }
    }
}
