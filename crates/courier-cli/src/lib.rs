//! # Courier CLI
//!
//! Command-line interface for Courier message queues.
//!
//! This module provides CLI commands for:
//! - Inspecting the capabilities of a configured queue
//! - Sending, peeking, receiving and draining messages
//! - Listening for pushed messages for a bounded period
//! - Showing the effective configuration
//!
//! Configuration is read from `./config/courier.yaml`, an optional explicit
//! file and `COURIER__`-prefixed environment variables, in that order.

use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use courier_core::{
    ConfigurationError, Context, MessageEnvelope, MessageQueue, MessageReceiver, QueueConfig,
    QueueError, QueueFactory, QueueKind, QueueOperation,
};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Interval between peeks while waiting for messages to arrive
const PEEK_POLL_INTERVAL: Duration = Duration::from_millis(20);

const REDACTED: &str = "********";

// ============================================================================
// CLI Structure
// ============================================================================

/// Courier CLI - operate message queues from the command line
#[derive(Parser)]
#[command(name = "courier")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Operate Courier message queues")]
#[command(
    long_about = "Courier sends, receives and inspects messages on queues built from configuration"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "COURIER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Override the configured queue name
    #[arg(short, long, global = true)]
    pub queue: Option<String>,

    /// Override the configured queue kind
    #[arg(short, long, global = true, value_enum)]
    pub kind: Option<KindArg>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Show which operations the configured queue supports
    Capabilities {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Send one message per payload
    Send {
        /// Message payloads
        #[arg(required = true)]
        payloads: Vec<String>,

        /// Message type attached to every message
        #[arg(short = 't', long = "type", default_value = "Message")]
        message_type: String,

        /// Trace id for end-to-end correlation
        #[arg(long)]
        trace_id: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Receive a single message and settle it
    Receive {
        /// How long to wait for a message
        #[arg(short, long, default_value = "1000")]
        wait_ms: u64,

        /// What to do with the received message
        #[arg(short, long, value_enum, default_value = "complete")]
        settle: Settlement,

        /// Payloads sent to the queue before receiving
        #[arg(long, value_name = "PAYLOAD")]
        seed: Vec<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show messages without leasing them
    Peek {
        /// Maximum number of messages to show
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,

        /// How long to wait for `count` messages to become available
        #[arg(short, long, default_value = "200")]
        wait_ms: u64,

        /// Payloads sent to the queue before peeking
        #[arg(long, value_name = "PAYLOAD")]
        seed: Vec<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Receive and complete messages until the queue is empty
    Drain {
        /// Stop after this many messages
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// How long each receive waits before the queue counts as empty
        #[arg(short, long, default_value = "100")]
        wait_ms: u64,

        /// Payloads sent to the queue before draining
        #[arg(long, value_name = "PAYLOAD")]
        seed: Vec<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Print pushed messages until the duration ends or Ctrl-C
    Listen {
        /// How long to listen
        #[arg(short, long, default_value = "5000")]
        duration_ms: u64,

        /// Stop after this many messages
        #[arg(short = 'n', long)]
        max_messages: Option<usize>,

        /// Payloads sent to the queue before listening
        #[arg(long, value_name = "PAYLOAD")]
        seed: Vec<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the effective configuration
    Config {
        /// Output format
        #[arg(short, long, value_enum, default_value = "yaml")]
        format: ConfigFormat,

        /// Print connection secrets instead of masking them
        #[arg(long)]
        show_secrets: bool,
    },
}

/// Queue kind selectable on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Memory,
    Loopback,
}

impl From<KindArg> for QueueKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Memory => QueueKind::Memory,
            KindArg::Loopback => QueueKind::Loopback,
        }
    }
}

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Configuration output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

/// Settlement applied to a received message
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Settlement {
    Complete,
    Abandon,
    DeadLetter,
    /// Leave the lease to expire
    Keep,
}

// ============================================================================
// Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("Failed to load configuration: {message}")]
    Load { message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] ConfigurationError),
}

// ============================================================================
// Output Types
// ============================================================================

/// Printable form of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvelopeView {
    pub message_id: String,
    pub message_type: String,
    pub trace_id: Option<String>,
    pub sent_time: Option<String>,
    pub payload: String,
}

impl From<&MessageEnvelope> for EnvelopeView {
    fn from(envelope: &MessageEnvelope) -> Self {
        Self {
            message_id: envelope.message_id.to_string(),
            message_type: envelope.message_type.clone(),
            trace_id: envelope.trace_id.clone(),
            sent_time: envelope
                .sent_time
                .map(|time| time.as_datetime().to_rfc3339()),
            payload: String::from_utf8_lossy(&envelope.payload).into_owned(),
        }
    }
}

fn render_envelope(envelope: &MessageEnvelope, format: OutputFormat) -> Result<String, CliError> {
    match format {
        OutputFormat::Text => Ok(envelope.to_string()),
        OutputFormat::Json => to_json_line(&EnvelopeView::from(envelope)),
    }
}

fn to_json_line<T: Serialize>(value: &T) -> Result<String, CliError> {
    serde_json::to_string(value).map_err(|e| CliError::CommandFailed {
        message: format!("failed to render output: {}", e),
    })
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli)?;

    let config = resolve_configuration(&cli)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    execute_command(cli.command, &config, &mut out).await
}

/// Initialize logging based on CLI arguments.
///
/// `RUST_LOG` wins over `--log-level`. Logs go to stderr so command output on
/// stdout stays machine readable.
pub fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cli.log_level).map_err(|e| CliError::InvalidArgument {
            message: format!("invalid log level '{}': {}", cli.log_level, e),
        })?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = if cli.json_logs {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| CliError::CommandFailed {
        message: format!("failed to install log subscriber: {}", e),
    })
}

/// Load the queue configuration.
///
/// Sources, later overriding earlier:
///  1. `./config/courier.yaml` if present
///  2. the explicit file, which must exist
///  3. environment variables prefixed `COURIER__`, e.g.
///     `COURIER__BROKER__GROUP=billing` sets `broker.group`
pub fn load_configuration(config_path: Option<&Path>) -> Result<QueueConfig, ConfigError> {
    let mut builder = config::Config::builder().add_source(
        config::File::with_name("config/courier")
            .required(false)
            .format(config::FileFormat::Yaml),
    );

    if let Some(path) = config_path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        builder = builder.add_source(
            config::File::from(path)
                .required(true)
                .format(config::FileFormat::Yaml),
        );
        info!(path = %path.display(), "Loading configuration from explicit path");
    }

    let settings = builder
        .add_source(config::Environment::with_prefix("COURIER").separator("__"))
        .build()
        .map_err(|e| ConfigError::Load {
            message: e.to_string(),
        })?;

    settings
        .try_deserialize::<QueueConfig>()
        .map_err(|e| ConfigError::Load {
            message: e.to_string(),
        })
}

/// Load configuration, apply command-line overrides and validate the result
pub fn resolve_configuration(cli: &Cli) -> Result<QueueConfig, CliError> {
    let mut config = load_configuration(cli.config.as_deref())?;

    if let Some(name) = &cli.queue {
        config.name = name.clone();
    }
    if let Some(kind) = cli.kind {
        config.kind = kind.into();
    }

    config.validate().map_err(ConfigError::from)?;
    debug!(queue = %config.name, kind = ?config.kind, "Configuration resolved");
    Ok(config)
}

/// Run a parsed command against `config`, writing command output to `out`
pub async fn execute_command(
    command: Commands,
    config: &QueueConfig,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    match command {
        Commands::Capabilities { format } => execute_capabilities_command(config, format, out),
        Commands::Config {
            format,
            show_secrets,
        } => execute_config_command(config, format, show_secrets, out),
        Commands::Send {
            payloads,
            message_type,
            trace_id,
            format,
        } => {
            let ctx = trace_id.map(Context::with_trace_id).unwrap_or_default();
            let queue = open_queue(config, &ctx).await?;
            let result =
                execute_send_command(queue.as_ref(), &ctx, &payloads, &message_type, format, out)
                    .await;
            finish(queue.as_ref(), &ctx, result).await
        }
        Commands::Receive {
            wait_ms,
            settle,
            seed,
            format,
        } => {
            let ctx = Context::new();
            let queue = open_queue(config, &ctx).await?;
            let result = async {
                seed_queue(queue.as_ref(), &ctx, &seed).await?;
                execute_receive_command(queue.as_ref(), &ctx, wait_ms, settle, format, out).await
            }
            .await;
            finish(queue.as_ref(), &ctx, result).await
        }
        Commands::Peek {
            count,
            wait_ms,
            seed,
            format,
        } => {
            let ctx = Context::new();
            let queue = open_queue(config, &ctx).await?;
            let result = async {
                seed_queue(queue.as_ref(), &ctx, &seed).await?;
                execute_peek_command(queue.as_ref(), &ctx, count, wait_ms, format, out).await
            }
            .await;
            finish(queue.as_ref(), &ctx, result).await
        }
        Commands::Drain {
            limit,
            wait_ms,
            seed,
            format,
        } => {
            let ctx = Context::new();
            let queue = open_queue(config, &ctx).await?;
            let result = async {
                seed_queue(queue.as_ref(), &ctx, &seed).await?;
                execute_drain_command(queue.as_ref(), &ctx, limit, wait_ms, format, out).await
            }
            .await;
            finish(queue.as_ref(), &ctx, result).await
        }
        Commands::Listen {
            duration_ms,
            max_messages,
            seed,
            format,
        } => {
            let ctx = Context::new();
            let queue = open_queue(config, &ctx).await?;
            let result = async {
                seed_queue(queue.as_ref(), &ctx, &seed).await?;
                execute_listen_command(
                    queue.as_ref(),
                    &ctx,
                    duration_ms,
                    max_messages,
                    format,
                    out,
                )
                .await
            }
            .await;
            finish(queue.as_ref(), &ctx, result).await
        }
    }
}

// ============================================================================
// Queue Helpers
// ============================================================================

async fn open_queue(config: &QueueConfig, ctx: &Context) -> Result<Box<dyn MessageQueue>, CliError> {
    let queue = QueueFactory::create(config)?;
    queue.open(ctx).await?;
    debug!(queue = %queue.name(), kind = ?config.kind, "Queue opened");
    Ok(queue)
}

/// Close the queue, reporting the command error first if there was one
async fn finish(
    queue: &dyn MessageQueue,
    ctx: &Context,
    result: Result<(), CliError>,
) -> Result<(), CliError> {
    let closed = queue.close(ctx).await;
    result?;
    Ok(closed?)
}

async fn seed_queue(
    queue: &dyn MessageQueue,
    ctx: &Context,
    payloads: &[String],
) -> Result<(), CliError> {
    for payload in payloads {
        let envelope = MessageEnvelope::new(
            ctx.trace_id().map(str::to_string),
            "Seed",
            payload.clone(),
        );
        queue.send(ctx, envelope).await?;
    }

    if !payloads.is_empty() {
        debug!(queue = %queue.name(), count = payloads.len(), "Seeded queue");
    }
    Ok(())
}

/// Forwards pushed messages to the listen command once completed
struct ForwardingReceiver {
    sender: mpsc::UnboundedSender<MessageEnvelope>,
}

#[async_trait]
impl MessageReceiver for ForwardingReceiver {
    async fn receive_message(
        &self,
        mut envelope: MessageEnvelope,
        queue: &dyn MessageQueue,
    ) -> anyhow::Result<()> {
        queue.complete(&mut envelope).await?;
        self.sender
            .send(envelope)
            .map_err(|_| anyhow::anyhow!("listen output closed"))?;
        Ok(())
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

fn execute_capabilities_command(
    config: &QueueConfig,
    format: OutputFormat,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let queue = QueueFactory::create(config)?;
    let capabilities = queue.capabilities();

    match format {
        OutputFormat::Text => {
            writeln!(out, "Queue {} ({:?})", queue.name(), config.kind)?;
            for operation in QueueOperation::ALL {
                let support = if capabilities.supports(operation) {
                    "supported"
                } else {
                    "not supported"
                };
                writeln!(out, "  {:<14}{}", operation.as_str(), support)?;
            }
        }
        OutputFormat::Json => writeln!(out, "{}", to_json_line(&capabilities)?)?,
    }
    Ok(())
}

fn execute_config_command(
    config: &QueueConfig,
    format: ConfigFormat,
    show_secrets: bool,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let mut shown = config.clone();
    if !show_secrets && shown.connection.password.is_some() {
        shown.connection.password = Some(REDACTED.to_string());
    }

    let rendered = match format {
        ConfigFormat::Yaml => {
            serde_yaml::to_string(&shown).map_err(|e| CliError::CommandFailed {
                message: format!("failed to render configuration: {}", e),
            })?
        }
        ConfigFormat::Json => {
            serde_json::to_string_pretty(&shown).map_err(|e| CliError::CommandFailed {
                message: format!("failed to render configuration: {}", e),
            })?
        }
    };

    writeln!(out, "{}", rendered.trim_end())?;
    Ok(())
}

async fn execute_send_command(
    queue: &dyn MessageQueue,
    ctx: &Context,
    payloads: &[String],
    message_type: &str,
    format: OutputFormat,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    for payload in payloads {
        let envelope = MessageEnvelope::new(
            ctx.trace_id().map(str::to_string),
            message_type,
            payload.clone(),
        );
        let message_id = envelope.message_id.clone();
        queue.send(ctx, envelope).await?;

        match format {
            OutputFormat::Text => writeln!(out, "Sent {}", message_id)?,
            OutputFormat::Json => writeln!(
                out,
                "{}",
                to_json_line(&serde_json::json!({
                    "message_id": message_id.as_str(),
                    "message_type": message_type,
                }))?
            )?,
        }
    }

    info!(queue = %queue.name(), count = payloads.len(), "Messages sent");
    Ok(())
}

async fn execute_receive_command(
    queue: &dyn MessageQueue,
    ctx: &Context,
    wait_ms: u64,
    settle: Settlement,
    format: OutputFormat,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let wait = chrono::Duration::milliseconds(wait_ms as i64);
    let Some(mut envelope) = queue.receive(ctx, wait).await? else {
        match format {
            OutputFormat::Text => writeln!(out, "No message available")?,
            OutputFormat::Json => writeln!(out, "null")?,
        }
        return Ok(());
    };

    match settle {
        Settlement::Complete => queue.complete(&mut envelope).await?,
        Settlement::Abandon => queue.abandon(&mut envelope).await?,
        Settlement::DeadLetter => queue.move_to_dead_letter(&mut envelope).await?,
        Settlement::Keep => {}
    }
    debug!(
        queue = %queue.name(),
        message_id = %envelope.message_id,
        settle = ?settle,
        "Received message settled"
    );

    writeln!(out, "{}", render_envelope(&envelope, format)?)?;
    Ok(())
}

async fn execute_peek_command(
    queue: &dyn MessageQueue,
    ctx: &Context,
    count: usize,
    wait_ms: u64,
    format: OutputFormat,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    if count == 0 {
        return Err(CliError::InvalidArgument {
            message: "count must be at least 1".to_string(),
        });
    }

    // Push-subscribed queues fill their buffer in the background
    let deadline = tokio::time::Instant::now() + Duration::from_millis(wait_ms);
    let batch = loop {
        let batch = queue.peek_batch(ctx, count).await?;
        if batch.len() >= count || tokio::time::Instant::now() >= deadline {
            break batch;
        }
        tokio::time::sleep(PEEK_POLL_INTERVAL).await;
    };

    if batch.is_empty() && format == OutputFormat::Text {
        writeln!(out, "No message available")?;
    }
    for envelope in &batch {
        writeln!(out, "{}", render_envelope(envelope, format)?)?;
    }
    Ok(())
}

async fn execute_drain_command(
    queue: &dyn MessageQueue,
    ctx: &Context,
    limit: Option<usize>,
    wait_ms: u64,
    format: OutputFormat,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let wait = chrono::Duration::milliseconds(wait_ms as i64);
    let mut drained = 0usize;

    while limit.map_or(true, |limit| drained < limit) {
        let Some(mut envelope) = queue.receive(ctx, wait).await? else {
            break;
        };
        queue.complete(&mut envelope).await?;
        writeln!(out, "{}", render_envelope(&envelope, format)?)?;
        drained += 1;
    }

    if format == OutputFormat::Text {
        writeln!(out, "Drained {} message(s)", drained)?;
    }
    info!(queue = %queue.name(), count = drained, "Queue drained");
    Ok(())
}

async fn execute_listen_command(
    queue: &dyn MessageQueue,
    ctx: &Context,
    duration_ms: u64,
    max_messages: Option<usize>,
    format: OutputFormat,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let (sender, mut received) = mpsc::unbounded_channel();
    queue
        .listen(ctx, Arc::new(ForwardingReceiver { sender }))
        .await?;
    info!(queue = %queue.name(), duration_ms, "Listening");

    let deadline = tokio::time::Instant::now() + Duration::from_millis(duration_ms);
    let mut count = 0usize;
    let outcome: Result<(), CliError> = async {
        while max_messages.map_or(true, |max| count < max) {
            tokio::select! {
                next = tokio::time::timeout_at(deadline, received.recv()) => match next {
                    Ok(Some(envelope)) => {
                        writeln!(out, "{}", render_envelope(&envelope, format)?)?;
                        count += 1;
                    }
                    Ok(None) | Err(_) => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
            }
        }
        Ok(())
    }
    .await;

    queue.end_listen(ctx).await;
    info!(queue = %queue.name(), count, "Listen finished");
    outcome
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
