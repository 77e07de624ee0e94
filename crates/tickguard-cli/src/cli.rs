//! CLI argument definitions for tickguard.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `resolve` | Resolve the current price of one or more assets |
//! | `sources` | Show configured providers and their breaker state |
//! | `config` | Print the effective configuration |
//! | `drawdown` | Replay portfolio valuations through the fail-safe monitor |
//!
//! # Global Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `--config` | `$TICKGUARD_CONFIG` | Path to a TOML config file |
//! | `--format` | `json` | Output format (json, table) |
//! | `--pretty` | `false` | Pretty-print JSON output |
//! | `--verbose` / `--debug` | off | Raise log verbosity on stderr |
//! | `--log-json` | `false` | Emit logs as JSON lines |
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Fresh result |
//! | 2 | Invalid input or configuration |
//! | 3 | Degraded result (stale cache value) |
//! | 4 | Price unavailable from every provider |
//! | 6 | Fail-safe halted |
//! | 7 | Fail-safe reset rejected |
//!
//! # Examples
//!
//! ```bash
//! tickguard resolve BTC ETH --quote USD --pretty
//! tickguard resolve SOL --max-age-secs 30
//! tickguard drawdown --threshold 10 100000 95000 88000
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use tickguard_core::parse_decimal;
use tickguard_core::telemetry::LogFormat;

/// Resilient crypto price resolution with a drawdown fail-safe.
#[derive(Debug, Parser)]
#[command(
    name = "tickguard",
    author,
    version,
    about = "Resilient crypto price resolution with a drawdown fail-safe",
    long_about = "tickguard resolves crypto prices across several providers in priority order.\n\
Each provider sits behind a circuit breaker, a retry policy and a concurrency limit; \
answers are cached per pair and served stale (flagged degraded) when every provider fails.\n\
\n\
Use 'tickguard <command> --help' for command-specific help."
)]
pub struct Cli {
    /// Path to a TOML config file. Falls back to $TICKGUARD_CONFIG, then built-in defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format for results.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Log at debug level for tickguard components.
    #[arg(long, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Log at trace level for tickguard components.
    #[arg(long, global = true, default_value_t = false)]
    pub debug: bool,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true, default_value_t = false)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub fn log_directive(&self, configured: &str) -> String {
        if self.debug {
            String::from("tickguard_core=trace,tickguard=trace,info")
        } else if self.verbose {
            String::from("tickguard_core=debug,tickguard=debug,info")
        } else {
            configured.to_owned()
        }
    }

    pub fn log_format(&self) -> LogFormat {
        if self.log_json {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Plain text for terminal display.
    Table,
    /// Single JSON object output.
    Json,
}

/// Available CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolve the current price of one or more assets.
    ///
    /// # Examples
    ///
    ///   tickguard resolve BTC
    ///   tickguard resolve BTC ETH SOL --quote EUR
    ///   tickguard resolve BTC --allow-stale
    Resolve(ResolveArgs),

    /// Show configured providers in priority order with breaker and limiter state.
    Sources,

    /// Print the effective configuration after defaults are applied.
    Config,

    /// Replay portfolio valuations through the drawdown fail-safe.
    ///
    /// # Examples
    ///
    ///   tickguard drawdown 100000 95000 88000
    ///   tickguard drawdown --threshold 5 100 96 94 --reset-as alice
    Drawdown(DrawdownArgs),
}

#[derive(Debug, Args)]
pub struct ResolveArgs {
    /// Asset tickers, e.g. BTC ETH.
    #[arg(required = true)]
    pub assets: Vec<String>,

    /// Quote currency.
    #[arg(long, default_value = "USD")]
    pub quote: String,

    /// Only accept cached values younger than this many seconds.
    #[arg(long, conflicts_with_all = ["allow_stale", "refresh"])]
    pub max_age_secs: Option<u64>,

    /// Answer from the cache only, accepting stale values.
    #[arg(long, default_value_t = false, conflicts_with = "refresh")]
    pub allow_stale: bool,

    /// Skip the cache read and go to the providers.
    #[arg(long, default_value_t = false)]
    pub refresh: bool,
}

#[derive(Debug, Args)]
pub struct DrawdownArgs {
    /// Portfolio valuations in chronological order.
    #[arg(required = true, value_parser = parse_valuation)]
    pub valuations: Vec<Decimal>,

    /// Halt threshold in percent. Defaults to the configured value.
    #[arg(long, value_parser = parse_threshold)]
    pub threshold: Option<Decimal>,

    /// After the replay, attempt an operator reset using $TICKGUARD_RESET_TOKEN.
    #[arg(long, value_name = "OPERATOR")]
    pub reset_as: Option<String>,

    /// Note recorded in the audit log with the reset.
    #[arg(long, requires = "reset_as")]
    pub note: Option<String>,
}

fn parse_valuation(raw: &str) -> Result<Decimal, String> {
    parse_decimal("valuation", raw).map_err(|error| error.to_string())
}

fn parse_threshold(raw: &str) -> Result<Decimal, String> {
    parse_decimal("threshold", raw).map_err(|error| error.to_string())
}
