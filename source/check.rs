//! Check/IDLE loop (§4.8): chooses between `NOOP` and `IDLE`, steps
//! pending untagged responses, and translates the mailbox's pending bits
//! into a result the caller acts on.

use crate::account::Account;
use crate::connection::{Readiness, State};
use crate::error::{Error, Result};
use crate::response::dispatch;
use crate::wire::OwnedLine;
use std::{io, time};

/// What a [`check`] call surfaced, in the priority order §4.8 specifies:
/// a reopen takes precedence over new mail, which takes precedence over a
/// plain flag update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
  None,
  Reopened,
  NewMail,
  Flags,
}

/// Drains untagged responses already sitting in the stream buffer (or
/// whatever `read_parsed` returns without blocking further once the
/// socket goes quiet) into mailbox state. Used both while IDLE and after
/// a `NOOP`/`DONE` round trip.
fn drain_untagged<RW>(account: &mut Account<RW>, stop_tag: Option<&str>) -> Result<()>
where
  RW: io::Read + io::Write,
{
  loop {
    match account.connection.stream.read_parsed()? {
      OwnedLine::Untagged(untagged) => {
        let mailbox = account.selected_state_mut();
        match dispatch(mailbox, None, untagged) {
          crate::response::DispatchSignal::Normal => {}
          crate::response::DispatchSignal::Bye => {
            account.connection.state = State::Disconnected;
            return Err(Error::fatal("server sent BYE"));
          }
          crate::response::DispatchSignal::Inconsistent(reason) => {
            account.connection.state = State::Disconnected;
            return Err(Error::fatal(reason));
          }
        }
      }
      OwnedLine::Tagged { tag, ok, code } => {
        account.connection.queue.resolve(&tag)?;
        match stop_tag {
          Some(expected) if expected == tag => {
            if !ok {
              return Err(Error::protocol(code.map(|c| format!("{c:?}")), "command rejected"));
            }
            return Ok(());
          }
          _ => continue,
        }
      }
      OwnedLine::Continuation if stop_tag.is_none() => return Ok(()),
      OwnedLine::Continuation => continue,
    }
  }
}

/// Sends `IDLE`, waits for the `+` continuation, and switches the
/// connection state to `Idle`.
fn start_idle<RW>(account: &mut Account<RW>) -> Result<()>
where
  RW: io::Read + io::Write,
{
  let tag = account.connection.queue.tag();
  let line = format!("{tag} IDLE\r\n");
  account.connection.queue.submit(&mut account.connection.stream, tag.clone(), line.as_bytes(), crate::tag::Flag::Single)?;
  loop {
    match account.connection.stream.read_parsed()? {
      OwnedLine::Continuation => break,
      OwnedLine::Untagged(untagged) => {
        let mailbox = account.selected_state_mut();
        match dispatch(mailbox, None, untagged) {
          crate::response::DispatchSignal::Normal => {}
          crate::response::DispatchSignal::Bye => {
            account.connection.state = State::Disconnected;
            return Err(Error::fatal("server sent BYE"));
          }
          crate::response::DispatchSignal::Inconsistent(reason) => {
            account.connection.state = State::Disconnected;
            return Err(Error::fatal(reason));
          }
        }
      }
      OwnedLine::Tagged { .. } => return Err(Error::fatal("server rejected IDLE before continuation")),
    }
  }
  account.connection.idle_tag = Some(tag);
  account.connection.idle_since = Some(time::Instant::now());
  account.connection.state = State::Idle;
  Ok(())
}

/// Sends `DONE`, consuming untagged pushes until the tagged completion
/// for the outstanding `IDLE`, and returns the connection to `Selected`.
fn stop_idle<RW>(account: &mut Account<RW>) -> Result<()>
where
  RW: io::Read + io::Write,
{
  account.connection.stream.write_command(b"DONE\r\n", 6)?;
  let tag = account.connection.idle_tag.take().ok_or_else(|| Error::fatal("DONE sent with no outstanding IDLE tag"))?;
  drain_untagged(account, Some(&tag))?;
  account.connection.idle_since = None;
  account.connection.state = State::Selected;
  Ok(())
}

/// Sends a bare `NOOP`, with the `POLL` submission flag per §4.2, and
/// drains its untagged side effects.
fn noop<RW>(account: &mut Account<RW>) -> Result<()>
where
  RW: io::Read + io::Write,
{
  let tag = account.connection.queue.tag();
  let line = format!("{tag} NOOP\r\n");
  account.connection.queue.submit(&mut account.connection.stream, tag.clone(), line.as_bytes(), crate::tag::Flag::Poll)?;
  drain_untagged(account, Some(&tag))
}

/// `check(mailbox, force)` per §4.8. `want_idle` stands in for "IDLE is
/// enabled for this session" (a host policy, not a capability check —
/// capability support is still consulted below). `keepalive` bounds how
/// long a single `IDLE` is left running before it is cycled with a fresh
/// `DONE`/`IDLE` pair.
pub fn check<RW>(account: &mut Account<RW>, force: bool, want_idle: bool, keepalive: time::Duration) -> Result<CheckResult>
where
  RW: io::Read + io::Write + Readiness,
{
  let has_idle = account.connection.has_capability("IDLE");

  if has_idle && want_idle && account.selected().is_some() {
    let stale = matches!(account.connection.idle_since, Some(since) if since.elapsed() >= keepalive);
    if account.connection.state == State::Idle && stale {
      stop_idle(account)?;
    }
    if account.connection.state != State::Idle {
      start_idle(account)?;
    }
    match account.connection.stream.get_ref().poll_readable(time::Duration::from_millis(0)) {
      Ok(true) => drain_untagged(account, None)?,
      Ok(false) => (),
      Err(error) => {
        log::warn!("IDLE poll failed, disabling IDLE for the rest of the session: {error}");
        account.connection.capabilities.remove("IDLE");
        stop_idle(account)?;
        if force {
          noop(account)?;
        }
      }
    }
  } else {
    if account.connection.state == State::Idle {
      stop_idle(account)?;
    }
    if force {
      noop(account)?;
    }
  }

  let pending = match account.selected_state_mut() {
    Some(state) => {
      let pending = state.pending;
      state.pending = Default::default();
      pending
    }
    None => Default::default(),
  };

  Ok(if pending.expunge_pending || pending.reopen_allowed {
    CheckResult::Reopened
  } else if pending.newmail_pending {
    CheckResult::NewMail
  } else if pending.flags_pending {
    CheckResult::Flags
  } else {
    CheckResult::None
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::account::{Account, AccountId};
  use crate::connection::{Connection, TestDuplex};
  use crate::wire::Stream;

  const SELECT_SCRIPT: &[u8] = b"* 3 EXISTS\r\n\
    * FLAGS (\\Seen)\r\n\
    * OK [UIDVALIDITY 1] x\r\n\
    * OK [UIDNEXT 4] x\r\n\
    a0000 OK [READ-WRITE] SELECT completed\r\n";

  fn account_selected(after_select: &[u8]) -> Account<TestDuplex> {
    let mut script = SELECT_SCRIPT.to_vec();
    script.extend_from_slice(after_select);
    let mut connection = Connection::new(Stream::new(TestDuplex::new(&script)), true, true);
    connection.state = State::Authenticated;
    let mut acc = Account::new(
      AccountId {
        host: "imap.example.com".to_owned(),
        port: 993,
        user: "me".to_owned(),
        security: crate::config::Security::ImplicitTls,
      },
      connection,
    );
    acc.select("INBOX", false).unwrap();
    acc
  }

  #[test]
  fn noop_without_idle_drains_exists_and_reports_new_mail() {
    let mut acc = account_selected(b"* 4 EXISTS\r\na0001 OK NOOP completed\r\n");
    let result = check(&mut acc, true, false, time::Duration::from_secs(1740)).unwrap();
    assert_eq!(result, CheckResult::NewMail);
  }

  #[test]
  fn quiescent_check_reports_none() {
    let mut acc = account_selected(b"a0001 OK NOOP completed\r\n");
    let result = check(&mut acc, true, false, time::Duration::from_secs(1740)).unwrap();
    assert_eq!(result, CheckResult::None);
  }
}
