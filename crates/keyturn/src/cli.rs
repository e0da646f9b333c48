use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use keyturn_rotation::{AgentRole, CaType, Phase};

/// Default HTTP API port.
pub const DEFAULT_HTTP_PORT: u16 = 5740;

/// Default daemon endpoint for client commands.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:5740";

#[derive(Parser, Debug)]
#[command(name = "keyturn", version, about = "Zero-downtime CA rotation")]
pub struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "KEYTURN_LOG", default_value = "info", global = true)]
    pub log_level: String,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Write logs to file (in addition to stderr)
    #[arg(long, env = "KEYTURN_LOG_FILE", value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,

    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    pub json: bool,

    /// Daemon endpoint for client commands
    #[arg(long, env = "KEYTURN_ENDPOINT", default_value = DEFAULT_ENDPOINT, global = true)]
    pub endpoint: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the rotation control plane
    Serve(ServeArgs),
    /// Run an agent that keeps one identity current
    Agent(AgentArgs),
    /// Drive a CA rotation
    Rotate(RotateCommand),
    /// Show rotation state
    Status {
        /// CA type (host, user). Omit for every CA.
        ca_type: Option<CaType>,
    },
    /// Show version information
    Version,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// HTTP API port
    #[arg(long, env = "KEYTURN_PORT", default_value_t = DEFAULT_HTTP_PORT)]
    pub port: u16,

    /// Minimum seconds between phase advances
    #[arg(long, env = "KEYTURN_GRACE_PERIOD", default_value = "1800", value_name = "SECONDS")]
    pub grace_period: u64,

    /// Lifetime of issued identity certificates in seconds
    #[arg(long, env = "KEYTURN_CERT_TTL", default_value = "3600", value_name = "SECONDS")]
    pub cert_ttl: u64,

    /// How often automatic rotations are checked, in seconds
    #[arg(long, env = "KEYTURN_AUTO_INTERVAL", default_value = "10", value_name = "SECONDS")]
    pub auto_interval: u64,

    /// Disable the audit log
    #[arg(long, env = "KEYTURN_NO_AUDIT")]
    pub no_audit: bool,

    /// Write an initial identity bundle for an agent, as SUBJECT:ROLE[:CA]
    /// (e.g. "web-1:client" or "db-1:server:user"). Repeatable.
    #[arg(long, value_name = "SUBJECT:ROLE[:CA]")]
    pub bootstrap: Vec<String>,
}

#[derive(Args, Debug)]
pub struct AgentArgs {
    /// Identity subject (defaults to the hostname)
    #[arg(long, env = "KEYTURN_SUBJECT")]
    pub subject: Option<String>,

    /// Agent role
    #[arg(long, env = "KEYTURN_ROLE", default_value = "client")]
    pub role: AgentRole,

    /// CA type that issues this agent's identity
    #[arg(long, env = "KEYTURN_IDENTITY_CA", default_value = "host")]
    pub identity_ca: CaType,

    /// CA types to trust (defaults to every type)
    #[arg(long = "trust", value_name = "CA")]
    pub trusted: Vec<CaType>,

    /// Renew once this fraction of the certificate lifetime has passed
    #[arg(long, env = "KEYTURN_RENEW_FRACTION", default_value = "0.5")]
    pub renew_fraction: f64,

    /// Renewal attempts before giving up until the next trigger (0 = never)
    #[arg(long, env = "KEYTURN_MAX_ATTEMPTS", default_value = "5")]
    pub max_attempts: u32,

    /// Identity bundle directory (default: platform data dir)
    #[arg(long, env = "KEYTURN_IDENTITY_DIR", value_name = "PATH")]
    pub identity_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct RotateCommand {
    #[command(subcommand)]
    pub command: RotateSubcommand,
}

#[derive(Subcommand, Debug)]
pub enum RotateSubcommand {
    /// Generate a standby pair and enter Init
    Start {
        /// CA type. Omit to rotate every CA.
        ca_type: Option<CaType>,
        /// Advance automatically once each grace period elapses
        #[arg(long)]
        auto: bool,
        /// Fail unless the CA's state is still at this version
        #[arg(long)]
        expected_version: Option<u64>,
    },
    /// Move to the next phase, or to --to
    Advance {
        /// CA type. Omit to advance every CA (requires --to).
        ca_type: Option<CaType>,
        /// Target phase (update-clients, update-servers, standby)
        #[arg(long)]
        to: Option<Phase>,
        /// Fail unless the CA's state is still at this version
        #[arg(long)]
        expected_version: Option<u64>,
        /// Skip the grace period check
        #[arg(long)]
        force: bool,
    },
    /// Abandon an in-progress rotation
    Rollback {
        /// CA type. Omit to roll back every CA.
        ca_type: Option<CaType>,
        #[arg(long)]
        expected_version: Option<u64>,
    },
}

/// Parsed `--bootstrap` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapSpec {
    pub subject: String,
    pub role: AgentRole,
    pub ca_type: CaType,
}

impl std::str::FromStr for BootstrapSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let subject = parts.next().unwrap_or_default().trim();
        if subject.is_empty() {
            return Err(format!("missing subject in '{s}'"));
        }
        let role = parts
            .next()
            .ok_or_else(|| format!("missing role in '{s}'"))?
            .parse()?;
        let ca_type = match parts.next() {
            Some(ca) => ca.parse()?,
            None => CaType::Host,
        };
        if parts.next().is_some() {
            return Err(format!("too many fields in '{s}'"));
        }
        Ok(Self {
            subject: subject.to_string(),
            role,
            ca_type,
        })
    }
}
