//! Command line and file configuration.
//!
//! The relays file, when present and non-empty, overrides `--relays`;
//! otherwise it is created from them. The nsec file is handled by the
//! identity loader. Both files can be watched for modification to
//! trigger a graceful restart-by-exit.

use anyhow::{Context, Result, bail};
use clap::Parser;
use hornet_client::normalize_relay_url;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP proxy that tunnels round trips through Nostr relays as
/// gift-wrapped events.
#[derive(Parser, Debug)]
#[command(name = "hornet", version, disable_help_flag = true)]
pub struct Args {
    /// Print help
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// TCP port to listen on
    #[arg(short = 'p', long)]
    pub port: u16,

    /// Bind host
    #[arg(short = 'h', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Exclusive bind (disables address reuse)
    #[arg(long)]
    pub exclusive: bool,

    /// Legacy HTTP-listener options blob (parsed as JSON, not honored)
    #[arg(long, default_value = "{}")]
    pub nodejs_http_options: String,

    /// Initial relay URLs; each value may itself contain several
    /// whitespace-separated URLs
    #[arg(long, num_args = 0..)]
    pub relays: Vec<String>,

    /// Persisted relay list; overrides --relays when non-empty
    #[arg(long)]
    pub relays_file: Option<PathBuf>,

    /// Preserve the Host header instead of stripping it
    #[arg(long)]
    pub keep_host: bool,

    /// Secret key file (bech32 nsec)
    #[arg(long)]
    pub nsec_file: Option<PathBuf>,

    /// Generate and save the key when the nsec file is absent
    #[arg(long)]
    pub save_nsec: bool,

    /// Per-request timeout in milliseconds
    #[arg(long, default_value_t = 300_000)]
    pub timeout: u64,

    /// Fixed destination (npub or nprofile) applied to every request
    #[arg(long)]
    pub destination: Option<String>,

    /// Hint-relay cache capacity
    #[arg(long, default_value_t = 10)]
    pub max_cached_relays: usize,

    /// Exit gracefully when the nsec or relays file changes
    #[arg(long)]
    pub exit_on_file_change: bool,

    /// Verbose logging
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub exclusive: bool,
    pub relays: Vec<String>,
    pub keep_host: bool,
    pub timeout: Duration,
    pub destination: Option<String>,
    pub max_cached_relays: usize,
    pub nsec_file: Option<PathBuf>,
    pub save_nsec: bool,
    pub relays_file: Option<PathBuf>,
    pub exit_on_file_change: bool,
    pub verbose: bool,
}

impl Config {
    pub fn resolve(args: Args) -> Result<Self> {
        // The blob must at least be valid JSON so typos fail loudly.
        let http_options: serde_json::Value = serde_json::from_str(&args.nodejs_http_options)
            .context("--nodejs-http-options is not valid JSON")?;
        if http_options
            .as_object()
            .is_some_and(|options| !options.is_empty())
        {
            warn!("--nodejs-http-options keys are accepted but not honored by this listener");
        }

        let flag_relays = split_relay_args(&args.relays);
        let relays = resolve_relays(flag_relays, args.relays_file.as_deref())?;

        Ok(Self {
            host: args.host,
            port: args.port,
            backlog: args.backlog.unwrap_or(511),
            exclusive: args.exclusive,
            relays,
            keep_host: args.keep_host,
            timeout: Duration::from_millis(args.timeout),
            destination: args.destination,
            max_cached_relays: args.max_cached_relays,
            nsec_file: args.nsec_file,
            save_nsec: args.save_nsec,
            relays_file: args.relays_file,
            exit_on_file_change: args.exit_on_file_change,
            verbose: args.verbose,
        })
    }

    /// Files to watch for change-triggered shutdown.
    pub fn watch_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(path) = &self.nsec_file {
            paths.push(path.clone());
        }
        if let Some(path) = &self.relays_file {
            paths.push(path.clone());
        }
        paths
    }
}

/// Each `--relays` value may carry several whitespace-separated URLs.
fn split_relay_args(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|value| value.split_whitespace())
        .map(|url| url.to_string())
        .collect()
}

/// Apply the relays-file precedence, then normalize and de-duplicate.
fn resolve_relays(flag_relays: Vec<String>, file: Option<&std::path::Path>) -> Result<Vec<String>> {
    let raw = match file {
        Some(path) if path.exists() => {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("read relays file {}", path.display()))?;
            let from_file: Vec<String> = contents
                .split_whitespace()
                .map(|url| url.to_string())
                .collect();
            if from_file.is_empty() {
                flag_relays
            } else {
                debug!(path = %path.display(), count = from_file.len(), "relays loaded from file");
                from_file
            }
        }
        Some(path) => {
            if !flag_relays.is_empty() {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent)
                            .with_context(|| format!("create {}", parent.display()))?;
                    }
                }
                fs::write(path, flag_relays.join("\n"))
                    .with_context(|| format!("write relays file {}", path.display()))?;
            }
            flag_relays
        }
        None => flag_relays,
    };

    let mut relays = Vec::new();
    for url in raw {
        let normalized = match normalize_relay_url(&url) {
            Ok(normalized) => normalized,
            Err(e) => bail!("invalid relay url {url}: {e}"),
        };
        if !relays.contains(&normalized) {
            relays.push(normalized);
        }
    }
    Ok(relays)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["hornet", "-p", "8080"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_port_is_required() {
        assert!(Args::try_parse_from(["hornet"]).is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::resolve(args(&[])).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.timeout, Duration::from_millis(300_000));
        assert_eq!(config.max_cached_relays, 10);
        assert!(config.relays.is_empty());
        assert!(!config.keep_host);
    }

    #[test]
    fn test_relays_split_on_whitespace_within_one_value() {
        let config = Config::resolve(args(&[
            "--relays",
            "wss://a.example wss://b.example",
            "--relays",
            "wss://c.example",
        ]))
        .unwrap();
        assert_eq!(
            config.relays,
            vec!["wss://a.example", "wss://b.example", "wss://c.example"]
        );
    }

    #[test]
    fn test_relays_normalized_and_deduped() {
        let config = Config::resolve(args(&[
            "--relays",
            "WSS://A.Example:443/ wss://a.example",
        ]))
        .unwrap();
        assert_eq!(config.relays, vec!["wss://a.example"]);
    }

    #[test]
    fn test_invalid_relay_is_fatal() {
        assert!(Config::resolve(args(&["--relays", "http://nope.example"])).is_err());
    }

    #[test]
    fn test_invalid_http_options_blob_is_fatal() {
        assert!(Config::resolve(args(&["--nodejs-http-options", "{not json"])).is_err());
    }

    #[test]
    fn test_relays_file_overrides_flags() {
        let dir = std::env::temp_dir().join("hornet-config-test-override");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("relays.txt");
        fs::write(&path, "wss://from-file.example\n\nwss://other.example\n").unwrap();

        let config = Config::resolve(args(&[
            "--relays",
            "wss://from-flag.example",
            "--relays-file",
            path.to_str().unwrap(),
        ]))
        .unwrap();
        assert_eq!(
            config.relays,
            vec!["wss://from-file.example", "wss://other.example"]
        );
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_relays_file_created_from_flags() {
        let dir = std::env::temp_dir().join("hornet-config-test-create");
        let _ = fs::remove_dir_all(&dir);
        let path = dir.join("relays.txt");

        let config = Config::resolve(args(&[
            "--relays",
            "wss://seed.example",
            "--relays-file",
            path.to_str().unwrap(),
        ]))
        .unwrap();
        assert_eq!(config.relays, vec!["wss://seed.example"]);
        assert!(fs::read_to_string(&path).unwrap().contains("wss://seed.example"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_empty_relays_file_falls_back_to_flags() {
        let dir = std::env::temp_dir().join("hornet-config-test-empty");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("relays.txt");
        fs::write(&path, "\n  \n").unwrap();

        let config = Config::resolve(args(&[
            "--relays",
            "wss://flag.example",
            "--relays-file",
            path.to_str().unwrap(),
        ]))
        .unwrap();
        assert_eq!(config.relays, vec!["wss://flag.example"]);
        let _ = fs::remove_dir_all(&dir);
    }
}
