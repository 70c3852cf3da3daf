//! Configuration surface: the connection parameters the engine itself
//! needs to open an [`Account`](crate::account::Account), exposed both as a
//! plain value type and as a `clap::Args`-derived CLI surface for a host
//! binary, the same way a host's `Arguments` struct exposes its own
//! connection parameters. This is deliberately not an RC-file
//! configuration language — it is the minimal knob set the engine
//! consumes.

use std::time;

/// How the connection is secured, per the `imap(s)://` URL forms in §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Security {
  /// `imap://`, no TLS unless the server offers `STARTTLS` and it is used.
  Plain,
  /// `imap://` upgraded in place via `STARTTLS` before authentication.
  StartTls,
  /// `imaps://`, TLS negotiated before the first byte of IMAP traffic.
  ImplicitTls,
}

impl Security {
  pub fn default_port(self) -> u16 {
    match self {
      Security::Plain | Security::StartTls => 143,
      Security::ImplicitTls => 993,
    }
  }

  /// Whether the wire is encrypted at the point the greeting arrives —
  /// relevant to the `ssl_force_tls` PREAUTH check in §4.4.
  pub fn encrypted_at_connect(self) -> bool {
    matches!(self, Security::ImplicitTls)
  }
}

fn parse_duration(argument: &str) -> Result<time::Duration, std::num::ParseIntError> {
  Ok(time::Duration::from_secs(argument.parse()?))
}

/// Connection parameters for one account, independent of how they were
/// sourced (CLI flags, a host's own config file, a URL per §6).
#[derive(Debug, Clone)]
pub struct AccountConfig {
  pub host: String,
  pub port: u16,
  pub security: Security,
  pub user: String,
  /// TCP/TLS I/O timeout; also the freshness threshold `check()` (§4.8)
  /// uses to decide whether a `NOOP` is due.
  pub timeout: Option<time::Duration>,
  /// How long the engine leaves a connection in IDLE before cycling it
  /// with a fresh `IDLE`/`DONE` pair, per §4.8.
  pub keepalive: time::Duration,
  /// Refuse a cleartext PREAUTH greeting or a STARTTLS-less server, per
  /// §4.4's MITM guard.
  pub ssl_force_tls: bool,
}

impl AccountConfig {
  pub fn new(host: impl Into<String>, user: impl Into<String>, security: Security) -> Self {
    let host = host.into();
    Self {
      port: security.default_port(),
      security,
      host,
      user: user.into(),
      timeout: None,
      keepalive: time::Duration::from_secs(29 * 60),
      ssl_force_tls: true,
    }
  }
}

/// CLI surface for [`AccountConfig`]. A host binary embeds this with
/// `#[clap(flatten)]`; it is not itself a full program.
#[derive(clap::Args, Debug)]
#[group(skip)]
pub struct ConnectArgs {
  #[arg(long = "host", help = "IMAP server host")]
  pub host: String,
  #[arg(long = "port", help = "IMAP server port (defaults per --security)")]
  pub port: Option<u16>,
  #[arg(long = "security", help = "Transport security", default_value = "implicit-tls")]
  pub security: Security,
  #[arg(long = "user", help = "IMAP user")]
  pub user: String,
  #[arg(long = "timeout", help = "TCP/TLS timeout (seconds)", value_parser = parse_duration)]
  pub timeout: Option<time::Duration>,
  #[arg(long = "keepalive", help = "IDLE cycle interval (seconds)", default_value_t = 29 * 60, value_parser = clap::value_parser!(u64))]
  pub keepalive_secs: u64,
  #[arg(
    long = "ssl-force-tls",
    help = "Refuse cleartext PREAUTH or a server offering no STARTTLS",
    default_value_t = true
  )]
  pub ssl_force_tls: bool,
}

impl From<ConnectArgs> for AccountConfig {
  fn from(args: ConnectArgs) -> Self {
    let port = args.port.unwrap_or_else(|| args.security.default_port());
    Self {
      host: args.host,
      port,
      security: args.security,
      user: args.user,
      timeout: args.timeout,
      keepalive: time::Duration::from_secs(args.keepalive_secs),
      ssl_force_tls: args.ssl_force_tls,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_ports_match_security_mode() {
    assert_eq!(Security::Plain.default_port(), 143);
    assert_eq!(Security::StartTls.default_port(), 143);
    assert_eq!(Security::ImplicitTls.default_port(), 993);
  }

  #[test]
  fn account_config_picks_up_default_port() {
    let config = AccountConfig::new("imap.example.com", "me", Security::ImplicitTls);
    assert_eq!(config.port, 993);
  }
}
