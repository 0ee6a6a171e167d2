use std::path::PathBuf;
use std::process::exit;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{ArgAction, CommandFactory, Parser};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tproxy_map_common::DEFAULT_MAP_PIN;

mod codec;
mod engine;
mod error;
mod merge;
mod model;
mod pinned;
mod store;

use engine::{PersistMode, UpdateEngine, UpdateRequest};
use pinned::PinnedStore;

#[derive(Parser)]
#[command(name = "tproxy-map")]
#[command(
    about = "Insert or update a redirect rule in the pinned tproxy map",
    long_about = None
)]
struct Cli {
    /// Destination IPv4 address or prefix base
    #[arg(value_name = "DEST_IP")]
    destination: String,
    /// Destination prefix length (1-32)
    #[arg(value_name = "PREFIX_LEN")]
    prefix_length: String,
    /// Port the mapping is stored under; also the low end of the port range
    #[arg(value_name = "DST_PORT")]
    dst_port: String,
    /// High end of the port range
    #[arg(value_name = "SRC_PORT")]
    src_port: String,
    /// Local port of the transparent proxy
    #[arg(value_name = "TPROXY_PORT")]
    proxy_port: String,
    /// IP protocol number: 6 (TCP) or 17 (UDP)
    #[arg(value_name = "PROTOCOL")]
    protocol: String,
    /// Ignored
    #[arg(hide = true, num_args = 0..)]
    extra: Vec<String>,
    /// Path of the pinned rule map
    #[arg(long, value_name = "PATH", env = "TPROXY_MAP_PATH", default_value = DEFAULT_MAP_PIN)]
    map_path: PathBuf,
    /// Address of the transparent proxy
    #[arg(long, value_name = "IP", env = "TPROXY_PROXY_IP", default_value = "127.0.0.1")]
    proxy_ip: String,
    /// Fail instead of overwriting when the rule changed since it was read
    #[arg(long = "compare-and-swap", action = ArgAction::SetTrue)]
    compare_and_swap: bool,
    /// Print the resulting rule record as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::MissingRequiredArgument
                    | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
            ) =>
        {
            Cli::command().print_help().ok();
            println!();
            exit(0);
        }
        Err(err) => {
            let code = if err.use_stderr() { 1 } else { 0 };
            err.print().ok();
            exit(code);
        }
    };

    init_tracing(cli.verbose);

    if let Err(err) = run(cli) {
        eprintln!("tproxy-map error: {err:?}");
        exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default_directive = if verbose {
        "tproxy_map=debug"
    } else {
        "tproxy_map=info"
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(cli: Cli) -> Result<()> {
    if !cli.extra.is_empty() {
        debug!(extra = ?cli.extra, "ignoring trailing arguments");
    }
    let request = UpdateRequest {
        destination: cli.destination,
        prefix_length: cli.prefix_length,
        dst_port: cli.dst_port,
        src_port: cli.src_port,
        proxy_port: cli.proxy_port,
        protocol: cli.protocol,
        proxy_ip: cli.proxy_ip,
    };
    let mode = if cli.compare_and_swap {
        PersistMode::CompareAndSwap
    } else {
        PersistMode::Overwrite
    };

    let validated = engine::validate(&request).inspect_err(log_failure)?;
    let store = PinnedStore::open(&cli.map_path).inspect_err(log_failure)?;
    let mut engine = UpdateEngine::new(store, mode);
    let outcome = engine.apply(validated).inspect_err(log_failure)?;

    info!(
        key = %outcome.key,
        protocol = outcome.protocol.number(),
        port = outcome.port,
        created = outcome.created,
        new_port = outcome.slot_added,
        "rule updated"
    );

    if cli.json {
        let summary = model::record_summary(&outcome.key, &outcome.record)?;
        let rendered =
            serde_json::to_string_pretty(&summary).context("failed to render rule record")?;
        println!("{rendered}");
    }

    Ok(())
}

fn log_failure(err: &error::UpdateError) {
    error!(stage = %err.stage(), "rule update aborted");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_arguments_are_ignored() {
        let cli = Cli::try_parse_from([
            "tproxy-map", "10.0.0.1", "32", "5060", "5060", "5061", "17", "extra", "more",
        ])
        .unwrap();
        assert_eq!(cli.protocol, "17");
        assert_eq!(cli.extra, ["extra", "more"]);
    }

    #[test]
    fn options_parse_around_the_positionals() {
        let cli = Cli::try_parse_from([
            "tproxy-map", "--json", "--map-path", "/tmp/map", "10.0.0.1", "32", "80", "80",
            "8080", "6", "-v",
        ])
        .unwrap();
        assert!(cli.json);
        assert!(cli.verbose);
        assert_eq!(cli.map_path, PathBuf::from("/tmp/map"));
        assert!(cli.extra.is_empty());
    }

    #[test]
    fn missing_positionals_are_a_usage_error() {
        let err = Cli::try_parse_from(["tproxy-map", "10.0.0.1", "32"]).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }
}
