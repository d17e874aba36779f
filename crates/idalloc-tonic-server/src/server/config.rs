use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use idalloc::{DEFAULT_SEQUENCE_TABLE, RegistryConfig};
use std::path::PathBuf;

/// Runtime configuration for the `idalloc-tonic-server` binary.
///
/// Values are parsed from CLI arguments or environment variables (a `.env`
/// file is loaded first). Which identifiers exist, and the scheme each one is
/// bound to, lives in a separate JSON document given by `ALLOCATOR_CONFIG`.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "idalloc-tonic-server",
    version,
    about = "A gRPC service handing out database-backed unique ids"
)]
pub struct CliArgs {
    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:50051" or "/tmp/idalloc.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,

    /// SQLite database holding the sequence and counter tables.
    ///
    /// Environment variable: `DATABASE_PATH`
    #[arg(long, env = "DATABASE_PATH", default_value = "idalloc.db")]
    pub database_path: PathBuf,

    /// JSON document binding each identifier to its allocation scheme.
    ///
    /// Environment variable: `ALLOCATOR_CONFIG`
    #[arg(long, env = "ALLOCATOR_CONFIG", default_value = "allocators.json")]
    pub allocator_config: PathBuf,

    /// Table holding the block-scheme sequence rows.
    ///
    /// Environment variable: `SEQUENCE_TABLE`
    #[arg(long, env = "SEQUENCE_TABLE", default_value_t = String::from(DEFAULT_SEQUENCE_TABLE))]
    pub sequence_table: String,

    /// How long a statement waits for a competing writer before failing.
    ///
    /// Environment variable: `STATEMENT_TIMEOUT_MS`
    #[arg(long, env = "STATEMENT_TIMEOUT_MS", default_value_t = 5_000)]
    pub statement_timeout_ms: u64,

    /// How long a request waits for another request's in-flight refill.
    /// Overrides `lock_timeout_ms` from the allocator config when set.
    ///
    /// Environment variable: `LOCK_TIMEOUT_MS`
    #[arg(long, env = "LOCK_TIMEOUT_MS")]
    pub lock_timeout_ms: Option<u64>,

    /// Upper bound on a whole request, refills included.
    ///
    /// Environment variable: `REQUEST_TIMEOUT_MS`
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 10_000)]
    pub request_timeout_ms: u64,

    /// Maximum number of ids allowed per `NextIds` request.
    ///
    /// Environment variable: `MAX_IDS_PER_REQUEST`
    #[arg(long, env = "MAX_IDS_PER_REQUEST", default_value_t = 10_000)]
    pub max_ids_per_request: usize,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub uds: bool,
    pub database_path: PathBuf,
    pub sequence_table: String,
    pub statement_timeout: Duration,
    pub request_timeout: Duration,
    pub max_ids_per_request: usize,
    pub registry: RegistryConfig,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.statement_timeout_ms == 0 {
            bail!("STATEMENT_TIMEOUT_MS must be greater than 0");
        }
        if args.request_timeout_ms == 0 {
            bail!("REQUEST_TIMEOUT_MS must be greater than 0");
        }
        if args.max_ids_per_request == 0 {
            bail!("MAX_IDS_PER_REQUEST must be greater than 0");
        }
        if args.max_ids_per_request > u32::MAX as usize {
            bail!(
                "MAX_IDS_PER_REQUEST ({}) exceeds the protocol limit ({})",
                args.max_ids_per_request,
                u32::MAX
            );
        }

        let raw = std::fs::read_to_string(&args.allocator_config).with_context(|| {
            format!(
                "failed to read allocator config `{}`",
                args.allocator_config.display()
            )
        })?;
        let registry = parse_registry_config(&raw, args.lock_timeout_ms).with_context(|| {
            format!(
                "invalid allocator config `{}`",
                args.allocator_config.display()
            )
        })?;

        Ok(Self {
            server_addr: args.server_addr,
            uds: args.uds,
            database_path: args.database_path,
            sequence_table: args.sequence_table,
            statement_timeout: Duration::from_millis(args.statement_timeout_ms),
            request_timeout: Duration::from_millis(args.request_timeout_ms),
            max_ids_per_request: args.max_ids_per_request,
            registry,
        })
    }
}

fn parse_registry_config(raw: &str, lock_timeout_ms: Option<u64>) -> anyhow::Result<RegistryConfig> {
    let mut registry: RegistryConfig = serde_json::from_str(raw)?;
    if lock_timeout_ms.is_some() {
        registry.lock_timeout_ms = lock_timeout_ms;
    }
    if registry.sequences.is_empty() {
        bail!("no identifiers configured");
    }
    registry.validate()?;
    Ok(registry)
}
