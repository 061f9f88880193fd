//! Command-line surface and resolved runtime configuration.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use clap::Parser;

use crate::acme;
use crate::error::{Error, Result};
use crate::scheduler::RenewalSchedule;

#[derive(Parser, Debug)]
#[command(
    name = "marathon-acme",
    version,
    about = "Automatic ACME certificates for Marathon apps behind marathon-lb"
)]
pub struct Cli {
    /// Directory for certificates and the account key (shared with marathon-lb)
    pub storage_dir: PathBuf,

    /// ACME directory URL
    #[arg(long, env = "MARATHON_ACME_ACME", default_value = acme::LETS_ENCRYPT_DIRECTORY)]
    pub acme: String,

    /// Contact email for ACME account registration
    #[arg(long, env = "MARATHON_ACME_EMAIL")]
    pub email: Option<String>,

    /// Marathon endpoints, comma-separated
    #[arg(
        long,
        env = "MARATHON_ACME_MARATHON",
        default_value = "http://localhost:8080",
        value_delimiter = ','
    )]
    pub marathon: Vec<String>,

    /// marathon-lb endpoints, comma-separated
    #[arg(
        long,
        env = "MARATHON_ACME_LB",
        default_value = "http://localhost:9090",
        value_delimiter = ','
    )]
    pub lb: Vec<String>,

    /// HAProxy group whose apps get certificates
    #[arg(long, env = "MARATHON_ACME_GROUP", default_value = "external")]
    pub group: String,

    /// Issue a certificate for every entry of a domain label, not just the first
    #[arg(long, env = "MARATHON_ACME_ALLOW_MULTIPLE_CERTS")]
    pub allow_multiple_certs: bool,

    /// Listen address for challenges and health ("host:port"; empty host = all interfaces)
    #[arg(long, env = "MARATHON_ACME_LISTEN", default_value = ":8000")]
    pub listen: String,

    /// Log level (debug, info, warn, error, critical)
    #[arg(long, env = "MARATHON_ACME_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Validated runtime configuration.
#[derive(Debug)]
pub struct Config {
    pub storage_dir: PathBuf,
    pub acme_directory: String,
    pub email: Option<String>,
    pub marathon_endpoints: Vec<String>,
    pub lb_endpoints: Vec<String>,
    pub group: String,
    pub allow_multiple_certs: bool,
    pub listen: SocketAddr,
    pub renewal: RenewalSchedule,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        Ok(Self {
            storage_dir: cli.storage_dir.clone(),
            acme_directory: validate_endpoint(&cli.acme)?,
            email: cli.email.clone(),
            marathon_endpoints: validate_endpoints("--marathon", &cli.marathon)?,
            lb_endpoints: validate_endpoints("--lb", &cli.lb)?,
            group: cli.group.clone(),
            allow_multiple_certs: cli.allow_multiple_certs,
            listen: parse_listen(&cli.listen)?,
            renewal: RenewalSchedule::default(),
        })
    }
}

/// Map the CLI log level onto a tracing filter directive. `critical` has no
/// tracing equivalent and collapses into `error`.
pub fn env_filter_directive(level: &str) -> Result<&'static str> {
    match level {
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" => Ok("warn"),
        "error" | "critical" => Ok("error"),
        other => Err(Error::ConfigInvalid(format!(
            "unknown log level {other:?} (expected debug, info, warn, error, or critical)"
        ))),
    }
}

fn validate_endpoints(flag: &str, endpoints: &[String]) -> Result<Vec<String>> {
    if endpoints.is_empty() {
        return Err(Error::ConfigInvalid(format!(
            "{flag} needs at least one endpoint"
        )));
    }
    endpoints.iter().map(|e| validate_endpoint(e)).collect()
}

/// Check the scheme and trim a trailing slash so paths concatenate cleanly.
fn validate_endpoint(endpoint: &str) -> Result<String> {
    let url = reqwest::Url::parse(endpoint)
        .map_err(|e| Error::ConfigInvalid(format!("invalid URL {endpoint:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(endpoint.trim_end_matches('/').to_string()),
        other => Err(Error::ConfigInvalid(format!(
            "unsupported scheme {other:?} in {endpoint:?} (expected http or https)"
        ))),
    }
}

/// Parse `host:port`, allowing the empty-host form `:8000` meaning all
/// interfaces.
fn parse_listen(value: &str) -> Result<SocketAddr> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| Error::ConfigInvalid(format!("--listen {value:?} must be host:port")))?;
    let host = if host.is_empty() { "0.0.0.0" } else { host };

    let port: u16 = port
        .parse()
        .map_err(|_| Error::ConfigInvalid(format!("--listen port {port:?} is not a number")))?;

    format!("{host}:{port}")
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| Error::ConfigInvalid(format!("--listen host {host:?} does not resolve")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(
            std::iter::once("marathon-acme").chain(args.iter().copied()),
        )
        .unwrap()
    }

    #[test]
    fn minimal_invocation_uses_defaults() {
        let cli = parse(&["/var/store"]);
        let config = Config::from_cli(&cli).unwrap();

        assert_eq!(config.storage_dir, PathBuf::from("/var/store"));
        assert_eq!(config.acme_directory, acme::LETS_ENCRYPT_DIRECTORY);
        assert_eq!(config.marathon_endpoints, ["http://localhost:8080"]);
        assert_eq!(config.lb_endpoints, ["http://localhost:9090"]);
        assert_eq!(config.group, "external");
        assert!(!config.allow_multiple_certs);
        assert_eq!(config.listen.port(), 8000);
        assert!(config.listen.ip().is_unspecified());
    }

    #[test]
    fn comma_separated_endpoint_lists() {
        let cli = parse(&[
            "/var/store",
            "--marathon",
            "http://m1:8080,http://m2:8080",
            "--lb",
            "http://lb1:9090,http://lb2:9090,http://lb3:9090",
        ]);
        let config = Config::from_cli(&cli).unwrap();
        assert_eq!(
            config.marathon_endpoints,
            ["http://m1:8080", "http://m2:8080"]
        );
        assert_eq!(config.lb_endpoints.len(), 3);
    }

    #[test]
    fn endpoints_are_normalised_without_trailing_slash() {
        let cli = parse(&["/var/store", "--marathon", "http://m1:8080/"]);
        let config = Config::from_cli(&cli).unwrap();
        assert_eq!(config.marathon_endpoints, ["http://m1:8080"]);
    }

    #[test]
    fn bad_endpoint_scheme_is_config_invalid() {
        let cli = parse(&["/var/store", "--lb", "ftp://lb1:9090"]);
        assert!(matches!(
            Config::from_cli(&cli),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn unparsable_endpoint_is_config_invalid() {
        let cli = parse(&["/var/store", "--marathon", "not a url"]);
        assert!(matches!(
            Config::from_cli(&cli),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn listen_forms() {
        assert_eq!(parse_listen(":8000").unwrap().port(), 8000);
        assert_eq!(
            parse_listen("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse().unwrap()
        );
        assert!(parse_listen("8000").is_err());
        assert!(parse_listen(":notaport").is_err());
    }

    #[test]
    fn allow_multiple_certs_flag() {
        let cli = parse(&["/var/store", "--allow-multiple-certs"]);
        let config = Config::from_cli(&cli).unwrap();
        assert!(config.allow_multiple_certs);
    }

    #[test]
    fn log_levels_map_to_filter_directives() {
        assert_eq!(env_filter_directive("debug").unwrap(), "debug");
        assert_eq!(env_filter_directive("critical").unwrap(), "error");
        assert!(env_filter_directive("loud").is_err());
    }

    #[test]
    fn storage_dir_is_required() {
        assert!(Cli::try_parse_from(["marathon-acme"]).is_err());
    }
}
