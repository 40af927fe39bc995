//! Command line and environment configuration.

use std::collections::HashSet;
use std::time::Duration;

use clap::Parser;
use pitwall_common::helpers::{env_bool, is_reserved_team, split_list};
use pitwall_common::{Error, Result, Role};
use pitwall_radio::{EngineConfig, Identity};
use tracing::warn;
use url::Url;

use crate::signaling::validate_signaling_url;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080";

#[derive(Parser, Debug, Clone)]
#[command(name = "pitwall", about = "Push-to-talk team radio")]
pub struct Args {
    /// driver or director
    #[arg(long, env = "PITWALL_ROLE", default_value = "driver")]
    pub role: String,

    /// Team identifier; also the radio channel address
    #[arg(long, env = "PITWALL_TEAM", default_value = "")]
    pub team: String,

    /// Name shown to the other side
    #[arg(long, env = "PITWALL_NAME", default_value = "")]
    pub name: String,

    /// Signaling relay (WebSocket)
    #[arg(long, env = "PITWALL_SIGNALING_URL", default_value = DEFAULT_SIGNALING_URL)]
    pub signaling_url: String,

    /// Director only: teams to call when the relay connects (comma separated)
    #[arg(long, env = "PITWALL_ROSTER", default_value = "")]
    pub roster: String,

    /// STUN/TURN URLs (comma separated)
    #[arg(long, env = "PITWALL_ICE_SERVERS", default_value = "")]
    pub ice_servers: String,

    /// Give up on the radio beep after this long
    #[arg(long, default_value_t = 2_000)]
    pub cue_timeout_ms: u64,

    /// Delay between relay reconnect attempts
    #[arg(long, default_value_t = 2_000)]
    pub reconnect_delay_ms: u64,

    /// Repeat unanswered offers and retry failed connections this often
    #[arg(long, default_value_t = 3_000)]
    pub redial_interval_ms: u64,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Validated client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub identity: Identity,
    pub signaling_url: Url,
    pub roster: Vec<String>,
    pub ice_servers: Vec<String>,
    pub cue_timeout: Duration,
    pub reconnect_delay: Duration,
    pub redial_interval: Duration,
    pub log_level: String,
}

fn production() -> bool {
    env_bool("PITWALL_ENVIRONMENT_PRODUCTION", false)
        || std::env::var("PITWALL_ENVIRONMENT")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false)
}

impl ClientConfig {
    pub fn from_args(args: Args) -> Result<Self> {
        let role: Role = args.role.parse()?;
        let identity = Identity::new(role, &args.team, &args.name)?;

        let require_secure =
            production() && !env_bool("PITWALL_ALLOW_INSECURE_SIGNALING", false);
        let signaling_url = validate_signaling_url(&args.signaling_url, require_secure)?;

        let mut roster = split_list(&args.roster);
        if let Some(reserved) = roster.iter().find(|team| is_reserved_team(team)) {
            return Err(Error::config(format!(
                "roster entry {reserved:?} is reserved"
            )));
        }
        if role == Role::Driver && !roster.is_empty() {
            warn!("roster is ignored for drivers");
            roster.clear();
        }
        let mut seen = HashSet::new();
        roster.retain(|team| seen.insert(team.clone()));

        if args.cue_timeout_ms == 0 {
            return Err(Error::config("cue timeout must be positive"));
        }
        if args.redial_interval_ms == 0 {
            return Err(Error::config("redial interval must be positive"));
        }

        Ok(Self {
            identity,
            signaling_url,
            roster,
            ice_servers: split_list(&args.ice_servers),
            cue_timeout: Duration::from_millis(args.cue_timeout_ms),
            reconnect_delay: Duration::from_millis(args.reconnect_delay_ms),
            redial_interval: Duration::from_millis(args.redial_interval_ms),
            log_level: args.log_level,
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::new(self.identity.clone());
        config.roster = self.roster.clone();
        config.cue_timeout = self.cue_timeout;
        config.redial_interval = self.redial_interval;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Result<ClientConfig> {
        let args = Args::try_parse_from(std::iter::once("pitwall").chain(argv.iter().copied()))
            .map_err(Error::config)?;
        ClientConfig::from_args(args)
    }

    #[test]
    fn test_driver_config() {
        let config = parse(&["--role", "driver", "--team", " redteam ", "--name", "Lando"]).unwrap();
        assert_eq!(config.identity.team_id(), "redteam");
        assert_eq!(config.identity.display_name(), "Lando");
        assert_eq!(config.signaling_url.as_str(), "ws://127.0.0.1:8080/");
        assert_eq!(config.cue_timeout, Duration::from_secs(2));
        assert!(config.roster.is_empty());
    }

    #[test]
    fn test_director_roster() {
        let config = parse(&[
            "--role",
            "director",
            "--roster",
            "redteam, blueteam",
            "--ice-servers",
            "stun:a:3478;turn:b:3478",
        ])
        .unwrap();
        assert!(config.identity.is_director());
        assert_eq!(config.roster, vec!["redteam", "blueteam"]);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.engine_config().roster, config.roster);
    }

    #[test]
    fn test_roster_duplicates_keep_first_order() {
        let config = parse(&[
            "--role",
            "director",
            "--roster",
            "redteam,blueteam,redteam,greenteam,blueteam",
        ])
        .unwrap();
        assert_eq!(config.roster, vec!["redteam", "blueteam", "greenteam"]);
    }

    #[test]
    fn test_redial_interval() {
        let config = parse(&["--team", "redteam", "--redial-interval-ms", "500"]).unwrap();
        assert_eq!(config.engine_config().redial_interval, Duration::from_millis(500));
        assert!(parse(&["--team", "redteam", "--redial-interval-ms", "0"]).is_err());
    }

    #[test]
    fn test_invalid_configs() {
        assert!(matches!(
            parse(&["--role", "driver"]),
            Err(Error::Config(_))
        ));
        assert!(parse(&["--role", "marshal", "--team", "x"]).is_err());
        assert!(parse(&["--team", "none"]).is_err());
        assert!(parse(&["--role", "director", "--roster", "redteam,all"]).is_err());
        assert!(parse(&["--team", "redteam", "--signaling-url", "http://relay"]).is_err());
        assert!(parse(&["--team", "redteam", "--cue-timeout-ms", "0"]).is_err());
    }

    #[test]
    fn test_driver_roster_ignored() {
        let config = parse(&["--team", "redteam", "--roster", "blueteam"]).unwrap();
        assert!(config.roster.is_empty());
    }
}
