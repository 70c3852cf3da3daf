//! Connection state machine: DISCONNECTED → CONNECTED → AUTHENTICATED →
//! SELECTED ↔ IDLE, plus the external Socket/TLS/Authenticate primitives
//! and the default transport wiring built on top of them.

use crate::error::{Error, Result};
use crate::tag::Queue;
use crate::wire::{OwnedRespCode, OwnedUntagged, Stream};
use std::{collections::HashSet, io, net, time};

/// Non-blocking readiness probe, the engine's abstraction over the
/// external `poll(timeout_ms)` socket primitive (§6). Used only by the
/// check/IDLE loop (§4.8) to decide whether a push from the server is
/// already sitting in the socket buffer, never to block.
pub trait Readiness {
  fn poll_readable(&self, timeout: time::Duration) -> Result<bool>;
}

impl Readiness for net::TcpStream {
  fn poll_readable(&self, timeout: time::Duration) -> Result<bool> {
    let previous = self.read_timeout()?;
    self.set_read_timeout(Some(timeout.max(time::Duration::from_millis(1))))?;
    let mut probe = [0u8; 1];
    let result = self.peek(&mut probe);
    self.set_read_timeout(previous)?;
    match result {
      Ok(n) => Ok(n > 0),
      Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(false),
      Err(e) => Err(e.into()),
    }
  }
}

impl Readiness for TlsStream {
  fn poll_readable(&self, timeout: time::Duration) -> Result<bool> {
    self.with_tcp_stream(|tcp_stream| tcp_stream.poll_readable(timeout))
  }
}

#[cfg(test)]
impl Readiness for io::Cursor<Vec<u8>> {
  fn poll_readable(&self, _timeout: time::Duration) -> Result<bool> {
    Ok((self.position() as usize) < self.get_ref().len())
  }
}

/// Test-only duplex stream: reads a canned server script, writes go to a
/// separate buffer instead of back into the script. A bare
/// `io::Cursor<Vec<u8>>` can't stand in for the wire in a round-trip test
/// — its read and write halves share one position, so writing an
/// outgoing command overwrites the very script bytes the next read is
/// about to consume.
#[cfg(test)]
pub(crate) struct TestDuplex {
  input: io::Cursor<Vec<u8>>,
  pub(crate) written: Vec<u8>,
}

#[cfg(test)]
impl TestDuplex {
  pub(crate) fn new(script: &[u8]) -> Self {
    Self { input: io::Cursor::new(script.to_vec()), written: Vec::new() }
  }
}

#[cfg(test)]
impl io::Read for TestDuplex {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.input.read(buf)
  }
}

#[cfg(test)]
impl io::Write for TestDuplex {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.written.extend_from_slice(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

#[cfg(test)]
impl Readiness for TestDuplex {
  fn poll_readable(&self, _timeout: time::Duration) -> Result<bool> {
    Ok((self.input.position() as usize) < self.input.get_ref().len())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
  Disconnected,
  Connected,
  Authenticated,
  Selected,
  Idle,
}

/// An open socket primitive, external to the engine (§6). A default
/// blocking TCP implementation is provided below.
pub trait Socket {
  type RW: io::Read + io::Write;
  fn open(&self) -> Result<Self::RW>;
}

/// STARTTLS upgrade primitive, external to the engine. `Upgraded` is a
/// distinct associated type rather than `Self::RW` itself: a real upgrade
/// (plain TCP in, TLS stream out) changes the concrete type of the wire,
/// which `Socket::RW` alone can't express.
pub trait Tls: Socket {
  type Upgraded: io::Read + io::Write;
  fn starttls(&self, plain: <Self as Socket>::RW) -> Result<Self::Upgraded>;
}

/// Blocking TCP socket, the engine's default transport.
pub struct TcpSocket {
  pub host: String,
  pub port: u16,
  pub timeout: Option<time::Duration>,
}

impl Socket for TcpSocket {
  type RW = net::TcpStream;

  fn open(&self) -> Result<Self::RW> {
    use std::net::ToSocketAddrs as _;
    let address = (self.host.as_str(), self.port)
      .to_socket_addrs()
      .map_err(|e| Error::fatal(e.to_string()))?
      .next()
      .ok_or_else(|| Error::fatal(format!("couldn't resolve {}:{}", self.host, self.port)))?;
    log::debug!("connecting to {address:?} with timeout {:?}", self.timeout);
    let stream = match self.timeout {
      Some(duration) => {
        let stream = net::TcpStream::connect_timeout(&address, duration)?;
        stream.set_read_timeout(Some(duration))?;
        stream
      }
      None => net::TcpStream::connect(address)?,
    };
    Ok(stream)
  }
}

/// A self-referential TLS-in-place wrapper around a TCP socket and its
/// `rustls::ClientConnection`, built with `ouroboros` since `rustls::Stream`
/// borrows from both.
#[ouroboros::self_referencing]
pub struct TlsStream {
  tcp_stream: net::TcpStream,
  tls_connection: rustls::ClientConnection,
  #[borrows(mut tcp_stream, mut tls_connection)]
  #[covariant]
  tls_stream: rustls::Stream<'this, rustls::ClientConnection, net::TcpStream>,
}

impl io::Read for TlsStream {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.with_mut(|fields| fields.tls_stream.read(buf))
  }
}

impl io::Write for TlsStream {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.with_mut(|fields| fields.tls_stream.write(buf))
  }

  fn flush(&mut self) -> io::Result<()> {
    self.with_mut(|fields| fields.tls_stream.flush())
  }
}

/// Implicit-TLS socket (`imaps://`): wraps a `TcpSocket` and negotiates
/// TLS immediately on `open`.
pub struct TlsSocket {
  pub tcp: TcpSocket,
}

impl Socket for TlsSocket {
  type RW = TlsStream;

  fn open(&self) -> Result<Self::RW> {
    let tcp_stream = self.tcp.open()?;
    wrap_tls(&self.tcp.host, tcp_stream)
  }
}

fn wrap_tls(host: &str, tcp_stream: net::TcpStream) -> Result<TlsStream> {
  let mut root_store = rustls::RootCertStore::empty();
  for certificate in rustls_native_certs::load_native_certs().map_err(|e| Error::fatal(e.to_string()))? {
    root_store.add(&rustls::Certificate(certificate.0)).map_err(|e| Error::fatal(e.to_string()))?;
  }
  let server_name: rustls::ServerName =
    host.try_into().map_err(|_| Error::fatal(format!("couldn't convert {host} to a server name")))?;
  let tls_connection = rustls::ClientConnection::new(
    std::sync::Arc::new(
      rustls::ClientConfig::builder().with_safe_defaults().with_root_certificates(root_store).with_no_client_auth(),
    ),
    server_name,
  )
  .map_err(|e| Error::fatal(e.to_string()))?;
  Ok(
    TlsStreamBuilder { tcp_stream, tls_connection, tls_stream_builder: |tcp, tls| rustls::Stream::new(tls, tcp) }
      .build(),
  )
}

/// A `STARTTLS`-capable socket: plain TCP until upgraded in place.
pub struct StartTlsSocket {
  pub tcp: TcpSocket,
}

impl Socket for StartTlsSocket {
  type RW = net::TcpStream;

  fn open(&self) -> Result<Self::RW> {
    self.tcp.open()
  }
}

impl Tls for StartTlsSocket {
  type Upgraded = TlsStream;

  fn starttls(&self, plain: net::TcpStream) -> Result<TlsStream> {
    // The caller already exchanged the `STARTTLS` command/response; this
    // just upgrades the raw stream in place. The connection re-requests
    // CAPABILITY afterward (§4.4).
    wrap_tls(&self.tcp.host, plain)
  }
}

/// SASL mechanism primitive, external to the engine (§6).
pub trait Authenticate<RW> {
  /// Runs the mechanism over `stream`, leaving the connection ready for
  /// the caller to re-request CAPABILITY.
  fn authenticate(&self, stream: &mut Stream<RW>, queue: &mut Queue) -> Result<()>;
}

/// SASL PLAIN, the engine's default mechanism.
pub struct PlainAuth {
  pub user: String,
  pub password: String,
}

impl<RW> Authenticate<RW> for PlainAuth
where
  RW: io::Read + io::Write,
{
  fn authenticate(&self, stream: &mut Stream<RW>, queue: &mut Queue) -> Result<()> {
    use zeroize::Zeroize as _;
    let mut credentials = crate::wire::plain(&self.user, &self.password);
    let tag = queue.tag();
    let command = format!("{tag} AUTHENTICATE PLAIN {credentials}\r\n");
    let result = stream.write_command(command.as_bytes(), 0);
    credentials.zeroize();
    result?;
    loop {
      match stream.read_parsed()? {
        crate::wire::OwnedLine::Untagged(_) => continue,
        crate::wire::OwnedLine::Tagged { tag: t, ok: true, .. } if t == tag => return Ok(()),
        crate::wire::OwnedLine::Tagged { tag: t, ok: false, code } if t == tag => {
          return Err(Error::protocol(code.map(|c| format!("{c:?}")), "AUTHENTICATE PLAIN rejected"))
        }
        crate::wire::OwnedLine::Tagged { .. } => continue,
        crate::wire::OwnedLine::Continuation => continue,
      }
    }
  }
}

/// A live connection: transport, command queue, capability set, and the
/// transient protocol state that does not belong to any one mailbox.
pub struct Connection<RW> {
  pub stream: Stream<RW>,
  pub queue: Queue,
  pub state: State,
  pub capabilities: HashSet<String>,
  pub delimiter: char,
  pub utf8_enabled: bool,
  /// Refuse to proceed past a cleartext PREAUTH greeting or a server
  /// offering no STARTTLS; guards against a MITM forcing cleartext auth.
  pub ssl_force_tls: bool,
  already_encrypted: bool,
  /// The tag of the outstanding `IDLE` command while `state == Idle`;
  /// `DONE`'s tagged completion resolves against this, not a fresh tag.
  pub idle_tag: Option<String>,
  /// When the current `IDLE` was started, so the check loop can cycle it
  /// before a bored server or middlebox times the connection out.
  pub idle_since: Option<time::Instant>,
}

impl<RW> Connection<RW>
where
  RW: io::Read + io::Write,
{
  pub fn new(stream: Stream<RW>, already_encrypted: bool, ssl_force_tls: bool) -> Self {
    Self {
      stream,
      queue: Queue::new(),
      state: State::Disconnected,
      capabilities: HashSet::new(),
      delimiter: '/',
      utf8_enabled: false,
      ssl_force_tls,
      already_encrypted,
      idle_tag: None,
      idle_since: None,
    }
  }

  fn apply_capability_code(&mut self, code: &Option<OwnedRespCode>) {
    if let Some(OwnedRespCode::Capability(caps)) = code {
      self.capabilities = caps.iter().map(|c| c.to_uppercase()).collect();
    }
  }

  /// Consumes the server greeting (`* OK`/`* PREAUTH`/`* BYE`) and
  /// transitions accordingly (§4.4, row 1–2).
  pub fn greet(&mut self) -> Result<()> {
    match self.stream.read_parsed()? {
      crate::wire::OwnedLine::Untagged(OwnedUntagged::Ok(code)) => {
        self.apply_capability_code(&code);
        self.state = State::Connected;
        Ok(())
      }
      crate::wire::OwnedLine::Untagged(OwnedUntagged::Preauth(code)) => {
        if self.ssl_force_tls && !self.already_encrypted {
          // A PREAUTH greeting over cleartext is indistinguishable from a
          // MITM that stripped STARTTLS and forged authentication.
          return Err(Error::fatal("Encrypted connection unavailable"));
        }
        self.apply_capability_code(&code);
        self.state = State::Authenticated;
        Ok(())
      }
      crate::wire::OwnedLine::Untagged(OwnedUntagged::Bye(_)) => {
        self.state = State::Disconnected;
        Err(Error::fatal("server sent BYE in greeting"))
      }
      _ => Err(Error::fatal("unexpected response to greeting")),
    }
  }

  pub fn has_capability(&self, name: &str) -> bool {
    self.capabilities.contains(&name.to_uppercase())
  }

  /// Drives one command/response round trip for commands with no
  /// additional untagged-response handling beyond capability codes: used
  /// by ENABLE and other simple exchanges, and by the post-AUTHENTICATE
  /// `CAPABILITY` refresh.
  pub fn exec_simple(&mut self, command: &str) -> Result<Option<OwnedRespCode>> {
    let tag = self.queue.tag();
    let line = format!("{tag} {command}\r\n");
    self.queue.submit(&mut self.stream, tag.clone(), line.as_bytes(), crate::tag::Flag::None)?;
    loop {
      match self.stream.read_parsed()? {
        crate::wire::OwnedLine::Untagged(OwnedUntagged::Ok(code)) => self.apply_capability_code(&code),
        // The `CAPABILITY` command's own response is a standalone
        // untagged line, not a response code nested in an `OK` — distinct
        // from the greeting/tagged-completion form `apply_capability_code`
        // handles above.
        crate::wire::OwnedLine::Untagged(OwnedUntagged::Capability(caps)) => {
          self.capabilities = caps.iter().map(|c| c.to_uppercase()).collect();
        }
        crate::wire::OwnedLine::Untagged(_) => (),
        crate::wire::OwnedLine::Tagged { tag: t, ok, code } if t == tag => {
          self.queue.resolve(&t)?;
          return if ok {
            Ok(code)
          } else {
            Err(Error::protocol(code.map(|c| format!("{c:?}")), format!("{command} rejected")))
          };
        }
        crate::wire::OwnedLine::Tagged { .. } | crate::wire::OwnedLine::Continuation => (),
      }
    }
  }

  /// `ENABLE` one or more capabilities (QRESYNC, UTF8=ACCEPT, …).
  pub fn enable(&mut self, capabilities: &[&str]) -> Result<()> {
    self.exec_simple(&format!("ENABLE {}", capabilities.join(" ")))?;
    if capabilities.iter().any(|c| *c == "UTF8=ACCEPT") {
      self.utf8_enabled = true;
    }
    Ok(())
  }

  /// Sends `STARTTLS`, awaits its tagged completion, and upgrades the raw
  /// stream via `tls` (§4.4). Consumes `self` because the upgrade changes
  /// the wire's concrete type; the returned `Connection` carries over the
  /// negotiated delimiter and UTF8 state and re-requests CAPABILITY, since
  /// a server must not be trusted to repeat pre-TLS capabilities honestly.
  pub fn starttls<T>(mut self, tls: &T) -> Result<Connection<T::Upgraded>>
  where
    T: Tls<RW = RW>,
  {
    let tag = self.queue.tag();
    let line = format!("{tag} STARTTLS\r\n");
    self.queue.submit(&mut self.stream, tag.clone(), line.as_bytes(), crate::tag::Flag::Single)?;
    loop {
      match self.stream.read_parsed()? {
        crate::wire::OwnedLine::Tagged { tag: t, ok, code } if t == tag => {
          self.queue.resolve(&t)?;
          if !ok {
            return Err(Error::protocol(code.map(|c| format!("{c:?}")), "STARTTLS rejected"));
          }
          break;
        }
        crate::wire::OwnedLine::Untagged(_) => continue,
        _ => continue,
      }
    }
    // `into_inner` drops `self.stream`'s read buffer along with it: any
    // bytes a MITM slipped in after the plaintext STARTTLS reply but before
    // the handshake must never be replayed as if they arrived over TLS.
    let plain = self.stream.into_inner();
    let upgraded = tls.starttls(plain)?;
    let mut next = Connection::new(Stream::new(upgraded), true, self.ssl_force_tls);
    next.delimiter = self.delimiter;
    next.utf8_enabled = self.utf8_enabled;
    next.state = State::Connected;
    next.exec_simple("CAPABILITY")?;
    Ok(next)
  }

  pub fn authenticate<A>(&mut self, mechanism: &A) -> Result<()>
  where
    A: Authenticate<RW>,
  {
    if self.ssl_force_tls && !self.already_encrypted {
      // Refuse to hand credentials over a connection that never went
      // through STARTTLS (or wasn't opened implicit-TLS); otherwise a MITM
      // that strips STARTTLS could harvest the password in the clear.
      return Err(Error::fatal("refusing to authenticate before STARTTLS"));
    }
    mechanism.authenticate(&mut self.stream, &mut self.queue)?;
    self.state = State::Authenticated;
    self.exec_simple("CAPABILITY")?;
    Ok(())
  }

  pub fn logout(&mut self) -> Result<()> {
    let tag = self.queue.tag();
    let line = format!("{tag} LOGOUT\r\n");
    self.queue.submit(&mut self.stream, tag.clone(), line.as_bytes(), crate::tag::Flag::Single)?;
    loop {
      match self.stream.read_parsed()? {
        crate::wire::OwnedLine::Untagged(OwnedUntagged::Bye(_)) => continue,
        crate::wire::OwnedLine::Tagged { tag: t, .. } if t == tag => {
          self.queue.resolve(&t)?;
          break;
        }
        _ => continue,
      }
    }
    self.state = State::Disconnected;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  fn connection(input: &[u8]) -> Connection<Cursor<Vec<u8>>> {
    Connection::new(Stream::new(Cursor::new(input.to_vec())), false, true)
  }

  #[test]
  fn greet_ok_transitions_to_connected() {
    let mut conn = connection(b"* OK [CAPABILITY IMAP4rev1 STARTTLS] srv ready\r\n");
    conn.greet().unwrap();
    assert_eq!(conn.state, State::Connected);
    assert!(conn.has_capability("starttls"));
  }

  #[test]
  fn preauth_over_cleartext_with_force_tls_is_refused() {
    let mut conn = connection(b"* PREAUTH srv ready\r\n");
    let result = conn.greet();
    assert!(result.is_err());
    assert_eq!(conn.state, State::Disconnected);
  }

  #[test]
  fn preauth_over_tls_is_accepted() {
    let mut conn = connection(b"* PREAUTH srv ready\r\n");
    conn.already_encrypted = true;
    conn.greet().unwrap();
    assert_eq!(conn.state, State::Authenticated);
  }

  #[test]
  fn exec_simple_applies_a_standalone_capability_line() {
    let mut conn = connection(b"* CAPABILITY IMAP4rev1 AUTH=PLAIN ACL\r\na0000 OK CAPABILITY completed\r\n");
    conn.exec_simple("CAPABILITY").unwrap();
    assert!(conn.has_capability("ACL"));
    assert!(conn.has_capability("AUTH=PLAIN"));
  }

  struct NoopTls;

  impl Socket for NoopTls {
    type RW = Cursor<Vec<u8>>;

    fn open(&self) -> Result<Self::RW> {
      Ok(Cursor::new(Vec::new()))
    }
  }

  impl Tls for NoopTls {
    type Upgraded = Cursor<Vec<u8>>;

    fn starttls(&self, plain: Cursor<Vec<u8>>) -> Result<Cursor<Vec<u8>>> {
      Ok(plain)
    }
  }

  #[test]
  fn starttls_upgrades_then_refreshes_capabilities() {
    let mut conn = connection(b"a0000 OK begin TLS negotiation now\r\n* CAPABILITY IMAP4rev1 AUTH=PLAIN\r\na0001 OK CAPABILITY completed\r\n");
    conn.delimiter = '.';
    let upgraded = conn.starttls(&NoopTls).unwrap();
    assert!(upgraded.has_capability("AUTH=PLAIN"));
    assert_eq!(upgraded.delimiter, '.');
    assert_eq!(upgraded.state, State::Connected);
  }

  #[test]
  fn starttls_rejection_surfaces_as_protocol_error() {
    let conn = connection(b"a0000 NO STARTTLS not available\r\n");
    let result = conn.starttls(&NoopTls);
    assert!(result.is_err());
  }

  #[test]
  fn authenticate_before_starttls_is_refused() {
    let mut conn = connection(b"");
    conn.already_encrypted = false;
    conn.ssl_force_tls = true;
    let mechanism = PlainAuth { user: "me".to_owned(), password: "secret".to_owned() };
    let result = conn.authenticate(&mechanism);
    assert!(result.is_err());
    assert_eq!(conn.state, State::Disconnected);
  }
}
