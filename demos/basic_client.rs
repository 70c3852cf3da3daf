//! Smallest host binary that wires the engine's pieces together end to
//! end: connect, authenticate, select INBOX, browse the top level, run a
//! search, and sync outstanding flag changes back. Stands in for the mail
//! application named out of scope in the engine's own docs — just enough
//! of one to show the pieces fit.

use clap::Parser as _;
use imap_engine::connection::{Authenticate as _, Socket as _};

#[derive(clap::Parser)]
struct Arguments {
  #[clap(flatten)]
  connect: imap_engine::ConnectArgs,
  #[arg(long = "password", help = "IMAP password", env = "IMAP_PASSWORD")]
  password: String,
  #[clap(flatten)]
  verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

fn main() -> anyhow::Result<()> {
  let arguments = Arguments::parse();

  let encoder = Box::new(log4rs::encode::pattern::PatternEncoder::new("{d(%F %T)} {l} {t} - {m}{n}"));
  log4rs::init_config(
    log4rs::config::Config::builder()
      .appender(
        log4rs::config::Appender::builder()
          .filter(Box::new(log4rs::filter::threshold::ThresholdFilter::new(arguments.verbose.log_level_filter())))
          .build("console", Box::new(log4rs::append::console::ConsoleAppender::builder().encoder(encoder).build())),
      )
      .build(log4rs::config::Root::builder().appenders(["console"]).build(log::LevelFilter::Trace))?,
  )?;

  let config: imap_engine::AccountConfig = arguments.connect.into();
  let id = imap_engine::AccountId {
    host: config.host.clone(),
    port: config.port,
    user: config.user.clone(),
    security: config.security,
  };

  if config.security == imap_engine::Security::Plain {
    anyhow::bail!("this demo refuses to authenticate over a connection with no transport security");
  }

  let mut connection = if config.security == imap_engine::Security::ImplicitTls {
    let tcp = imap_engine::TcpSocket { host: config.host.clone(), port: config.port, timeout: config.timeout };
    let tls_stream = imap_engine::TlsSocket { tcp }.open()?;
    let mut connection = imap_engine::Connection::new(imap_engine::wire::Stream::new(tls_stream), true, config.ssl_force_tls);
    connection.greet()?;
    connection
  } else {
    let tcp = imap_engine::TcpSocket { host: config.host.clone(), port: config.port, timeout: config.timeout };
    let socket = imap_engine::StartTlsSocket { tcp };
    let plain_stream = socket.open()?;
    let mut connection = imap_engine::Connection::new(imap_engine::wire::Stream::new(plain_stream), false, config.ssl_force_tls);
    connection.greet()?;
    connection.starttls(&socket)?
  };

  let mechanism = imap_engine::PlainAuth { user: config.user.clone(), password: arguments.password.clone() };
  connection.authenticate(&mechanism)?;

  let mut account = imap_engine::Account::new(id, connection);
  account.select("INBOX", false)?;
  log::info!(
    "selected INBOX: {} messages, {} recent, rights {:?}",
    account.selected().and_then(|m| m.state.as_ref()).map(|s| s.len()).unwrap_or(0),
    account.selected().and_then(|m| m.state.as_ref()).map(|s| s.recent).unwrap_or(0),
    account.selected().and_then(|m| m.state.as_ref()).map(|s| s.rights),
  );

  let browsed = imap_engine::browser::browse(&mut account, "", None, false)?;
  for entry in &browsed.entries {
    log::info!("folder: {} (selectable={})", entry.desc, entry.selectable);
  }

  let unseen = imap_engine::search::search(&mut account, &imap_engine::Pattern::Header { name: "X-No-Such-Header".to_owned(), value: "".to_owned() })
    .unwrap_or_default();
  log::info!("search returned {} matches", unseen.len());

  let summary = imap_engine::sync::sync(&mut account, true, false, config.keepalive, None)?;
  log::info!("sync summary: {summary:?}");

  account.connection.logout()?;
  Ok(())
}
