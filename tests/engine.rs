//! End-to-end session tests: drive the engine through a scripted server
//! transcript over a fake duplex stream, the way `source/connection.rs`'s
//! own unit tests do per-operation, but across a full
//! connect/authenticate/select/sync/logout session.

use imap_engine::connection::{Authenticate as _, Readiness};
use std::{io, time};
use test_log::test;

/// A scripted server: reads come from a canned transcript, writes land in
/// a side buffer instead of looping back into it. Mirrors the crate's own
/// `TestDuplex`, which is `pub(crate)` and so unavailable to an external
/// integration test.
struct Scripted {
  input: io::Cursor<Vec<u8>>,
  written: Vec<u8>,
}

impl Scripted {
  fn new(script: &[u8]) -> Self {
    Self { input: io::Cursor::new(script.to_vec()), written: Vec::new() }
  }
}

impl io::Read for Scripted {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.input.read(buf)
  }
}

impl io::Write for Scripted {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.written.extend_from_slice(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

impl Readiness for Scripted {
  fn poll_readable(&self, _timeout: time::Duration) -> imap_engine::Result<bool> {
    Ok((self.input.position() as usize) < self.input.get_ref().len())
  }
}

fn connection(script: &[u8]) -> imap_engine::Connection<Scripted> {
  imap_engine::Connection::new(imap_engine::wire::Stream::new(Scripted::new(script)), false, true)
}

fn account(id_user: &str, connection: imap_engine::Connection<Scripted>) -> imap_engine::Account<Scripted> {
  imap_engine::Account::new(
    imap_engine::AccountId {
      host: "imap.example.com".to_owned(),
      port: 143,
      user: id_user.to_owned(),
      security: imap_engine::Security::StartTls,
    },
    connection,
  )
}

#[test]
fn full_session_greet_auth_select_search_sync_logout() {
  let mut connection = connection(
    b"* OK [CAPABILITY IMAP4rev1 AUTH=PLAIN] ready for auth\r\n\
      a0000 OK authenticated\r\n\
      * CAPABILITY IMAP4rev1 AUTH=PLAIN ACL\r\n\
      a0001 OK CAPABILITY completed\r\n\
      * FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)\r\n\
      * 2 EXISTS\r\n\
      * 0 RECENT\r\n\
      * OK [UIDVALIDITY 100] UIDs valid\r\n\
      * OK [UIDNEXT 10] Predicted next UID\r\n\
      a0002 OK [READ-WRITE] SELECT completed\r\n\
      * MYRIGHTS \"INBOX\" lrswipkxtecda\r\n\
      a0003 OK MYRIGHTS completed\r\n\
      * SEARCH 2\r\n\
      a0004 OK SEARCH completed\r\n\
      a0005 OK NOOP completed\r\n\
      a0006 OK STORE completed\r\n\
      a0007 OK STORE completed\r\n\
      a0008 OK STORE completed\r\n\
      a0009 OK STORE completed\r\n\
      * BYE logging out\r\n\
      a0010 OK LOGOUT completed\r\n",
  );
  connection.greet().unwrap();
  assert_eq!(connection.state, imap_engine::State::Connected);

  let mechanism = imap_engine::PlainAuth { user: "me".to_owned(), password: "secret".to_owned() };
  mechanism.authenticate(&mut connection.stream, &mut connection.queue).unwrap();
  connection.state = imap_engine::State::Authenticated;
  connection.exec_simple("CAPABILITY").unwrap();
  assert!(connection.has_capability("ACL"));

  let mut acc = account("me", connection);
  acc.select("INBOX", false).unwrap();
  let state = acc.selected().unwrap().state.as_ref().unwrap();
  assert_eq!(state.len(), 2);
  assert_eq!(state.uidvalidity, 100);

  let uids = imap_engine::search::search(
    &mut acc,
    &imap_engine::Pattern::WholeMsg("quarterly".to_owned()),
  )
  .unwrap();
  assert_eq!(uids, vec![2]);

  acc.selected_state_mut().unwrap().push(5).deleted = true;
  acc.selected_state_mut().unwrap().by_uid_mut(5).unwrap().changed = true;
  let summary = imap_engine::sync::sync(&mut acc, false, false, time::Duration::from_secs(900), None).unwrap();
  assert_eq!(summary.flags_synced, 1);
  assert!(!summary.expunged, "expunge was not requested");

  acc.connection.logout().unwrap();
  assert_eq!(acc.connection.state, imap_engine::State::Disconnected);
}

#[test]
fn rejected_select_surfaces_as_protocol_error() {
  let mut connection = connection(b"* OK ready\r\na0000 NO [NONEXISTENT] no such mailbox\r\n");
  connection.greet().unwrap();
  let mut acc = account("me", connection);
  let error = acc.select("Missing", false).unwrap_err();
  assert!(matches!(error.kind(), imap_engine::Kind::Protocol { .. }));
}
