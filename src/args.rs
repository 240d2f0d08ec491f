//! Command-line arguments and the optional `collabshare.toml`.
//!
//! The file is looked up in the working directory first, then in the data
//! directory. CLI values override file values.

use clap::{ArgAction, Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use collabshare::{SessionConfig, TransferConfig};

pub const CONFIG_FILE_NAME: &str = "collabshare.toml";

/// collabshare - collaboration sessions and conversation export over P2P data channels.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Directory for all persistent data (session intent, logs).
    /// Defaults to ~/.collabshare/
    #[clap(long, global = true)]
    pub conf: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Mount a session: restore the previous one, follow an invite, or join.
    Run {
        /// Invitation address; preferred over a persisted session on mount.
        #[clap(long)]
        invite: Option<String>,

        /// Explicitly join this signaling address.
        #[clap(long)]
        join: Option<String>,
    },

    /// Forget the persisted session so the next `run` starts clean.
    Leave,

    /// Send a JSON conversation through two in-process peers and verify it.
    Loopback {
        /// File holding a JSON array of messages.
        file: PathBuf,

        /// Override the chunk size in bytes.
        #[clap(long)]
        chunk_size: Option<usize>,
    },
}

/// Settings that may come from `collabshare.toml`.
#[derive(Deserialize, Default, Clone, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub verbose: Option<u8>,
    pub conf: Option<PathBuf>,
    /// Default invite for `run`.
    pub invite: Option<String>,
    pub chunk_size: Option<usize>,
    pub connect_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub reconnect_delays_secs: Option<Vec<u64>>,
    /// How often `run` re-checks connectivity while idle.
    pub online_probe_secs: Option<u64>,
}

/// Effective configuration after merging.
#[derive(Clone, Debug)]
pub struct Settings {
    pub verbose: u8,
    pub conf: Option<PathBuf>,
    pub command: Command,
    pub file: FileConfig,
}

impl Settings {
    pub const DEFAULT_ONLINE_PROBE: Duration = Duration::from_secs(60);

    /// Parse the CLI and merge it over the config file, if any.
    pub fn load() -> Self {
        let mut cli = Args::parse();
        cli.conf = cli.conf.map(resolve_path);

        let file = Self::find_file(cli.conf.as_deref())
            .and_then(|path| FileConfig::from_file(&path))
            .unwrap_or_default();
        Self::merge(file, cli)
    }

    fn find_file(conf: Option<&Path>) -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        let dir = conf
            .map(Path::to_path_buf)
            .or_else(collabshare::utils::data_dir::default_dir)?;
        let path = dir.join(CONFIG_FILE_NAME);
        path.exists().then_some(path)
    }

    fn merge(file: FileConfig, cli: Args) -> Self {
        let verbose = if cli.verbose > 0 {
            cli.verbose
        } else {
            file.verbose.unwrap_or(0)
        };
        let conf = cli.conf.or_else(|| file.conf.clone().map(resolve_path));
        let command = match cli.command {
            Command::Run { invite, join } => Command::Run {
                invite: invite.or_else(|| file.invite.clone()),
                join,
            },
            other => other,
        };
        Self {
            verbose,
            conf,
            command,
            file,
        }
    }

    pub fn transfer_config(&self, chunk_size: Option<usize>) -> TransferConfig {
        let mut config = TransferConfig::default();
        if let Some(size) = chunk_size.or(self.file.chunk_size).filter(|s| *s > 0) {
            config.chunk_size = size;
        }
        config
    }

    pub fn session_config(&self, invite: Option<String>) -> SessionConfig {
        let mut config = SessionConfig {
            invite,
            ..SessionConfig::default()
        };
        if let Some(secs) = self.file.connect_timeout_secs {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = self.file.max_retries {
            config.max_retries = n;
        }
        if let Some(delays) = self.file.reconnect_delays_secs.as_ref().filter(|d| !d.is_empty()) {
            config.retry_delays = delays.iter().map(|s| Duration::from_secs(*s)).collect();
        }
        config
    }

    pub fn online_probe(&self) -> Duration {
        self.file
            .online_probe_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(Self::DEFAULT_ONLINE_PROBE)
    }
}

impl FileConfig {
    fn from_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        match toml::from_str::<FileConfig>(&content) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                // Logging is not up yet; this goes to stderr directly.
                eprintln!("Ignoring invalid {}: {e}", path.display());
                warn!(event = "config_file_invalid", path = %path.display(), error = %e);
                None
            }
        }
    }
}

fn resolve_path(p: PathBuf) -> PathBuf {
    if p.is_absolute() {
        p
    } else {
        std::env::current_dir().unwrap_or_default().join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_parse_subcommands() {
        let args = cli(&["collabshare", "-vv", "run", "--join", "ws://x/room"]);
        assert_eq!(args.verbose, 2);
        assert!(matches!(args.command, Command::Run { join: Some(ref j), invite: None } if j == "ws://x/room"));

        let args = cli(&["collabshare", "loopback", "conv.json", "--chunk-size", "1024", "-v"]);
        assert_eq!(args.verbose, 1);
        assert!(matches!(args.command, Command::Loopback { chunk_size: Some(1024), .. }));

        assert!(Args::try_parse_from(["collabshare"]).is_err());
    }

    #[test]
    fn test_cli_wins_over_file() {
        let file: FileConfig = toml::from_str(
            r#"
            verbose = 1
            invite = "ws://file/invite"
            chunk_size = 4096
            reconnect_delays_secs = [2, 4]
            "#,
        )
        .unwrap();

        let settings = Settings::merge(file.clone(), cli(&["collabshare", "-vvv", "run"]));
        assert_eq!(settings.verbose, 3);
        assert!(matches!(settings.command, Command::Run { invite: Some(ref i), .. } if i == "ws://file/invite"));
        assert_eq!(settings.transfer_config(None).chunk_size, 4096);
        assert_eq!(settings.transfer_config(Some(512)).chunk_size, 512);
        assert_eq!(
            settings.session_config(None).retry_delays,
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );

        let settings = Settings::merge(file, cli(&["collabshare", "run", "--invite", "ws://cli"]));
        assert_eq!(settings.verbose, 1);
        assert!(matches!(settings.command, Command::Run { invite: Some(ref i), .. } if i == "ws://cli"));
    }

    #[test]
    fn test_unknown_file_keys_rejected() {
        assert!(toml::from_str::<FileConfig>("colour = true").is_err());
    }
}
