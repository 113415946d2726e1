use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// SSH bastion proxy: terminates inbound sessions, relays them upstream
/// under a recorded, audited transcript.
///
/// One subcommand: there is no admin API, user database, or config-wizard
/// to give subcommands to.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, env = "BASTION_CONFIG")]
    pub config: PathBuf,

    /// Overrides `listen` from the config file.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Pre-authenticated user name to assert for every connection.
    ///
    /// Stands in for an LDAP/SPNEGO front-end — a real deployment replaces
    /// this flag with a front-end that resolves per-connection identity.
    #[arg(long, env = "BASTION_USER")]
    pub user: String,

    /// Upstream target (`host:port`) to relay every connection to.
    #[arg(long, env = "BASTION_TARGET")]
    pub target: String,

    /// Group id granting upstream key access; repeatable.
    #[arg(long = "group", value_name = "GROUP")]
    pub groups: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repeated_group_flags_and_required_args() {
        let cli = Cli::parse_from([
            "bastion",
            "--config",
            "/etc/bastion/config.yaml",
            "--user",
            "alice",
            "--target",
            "10.0.0.5:22",
            "--group",
            "ops",
            "--group",
            "dba",
        ]);

        assert_eq!(cli.config, PathBuf::from("/etc/bastion/config.yaml"));
        assert_eq!(cli.user, "alice");
        assert_eq!(cli.target, "10.0.0.5:22");
        assert_eq!(cli.groups, vec!["ops".to_owned(), "dba".to_owned()]);
        assert_eq!(cli.listen, None);
    }

    #[test]
    fn listen_override_parses_as_a_socket_addr() {
        let cli = Cli::parse_from([
            "bastion",
            "--config",
            "config.yaml",
            "--user",
            "alice",
            "--target",
            "10.0.0.5:22",
            "--listen",
            "0.0.0.0:2222",
        ]);

        assert_eq!(cli.listen, Some("0.0.0.0:2222".parse().unwrap()));
    }
}
