//! Sync engine (§4.7): pushes locally-modified flags and deletions back to
//! the server in a small, fixed phase sequence, reusing the message-set
//! builder to keep every `STORE` inside the wire ceiling.

use crate::account::Account;
use crate::check::{self, CheckResult};
use crate::connection::Readiness;
use crate::error::{Error, Rejection, Result};
use crate::mailbox::MailboxState;
use crate::messageset::{self, Predicate, Selector};
use crate::response::dispatch;
use crate::tag::Flag;
use crate::wire::{OwnedLine, OwnedRespCode};
use std::{io, time};

/// Supplies the body to re-append for a message with structural local
/// changes (attachment deletion, header rewrite, thread relink). External
/// collaborator, analogous to the body cache's `bc_fetch` (§6) — the
/// engine never stores message bodies itself.
pub trait AppendSource {
  fn body(&self, uid: u64) -> Result<Vec<u8>>;
}

/// Summary of one [`sync`] call, for callers that want to report progress
/// rather than just success/failure.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
  pub deleted: usize,
  pub reuploaded: usize,
  pub flags_synced: usize,
  pub expunged: bool,
  pub closed: bool,
}

const SYSTEM_FLAGS: [(Selector, Option<&str>); 5] = [
  (Selector::Deleted, Some("\\Deleted")),
  (Selector::Flagged, Some("\\Flagged")),
  // `Old` has no wire representation: it is the absence of `\Recent`,
  // which only the server controls. Kept in the loop so every
  // sync-relevant selector gets one uniform pass.
  (Selector::Old, None),
  (Selector::Read, Some("\\Seen")),
  (Selector::Replied, Some("\\Answered")),
];

fn selected_state_ref<RW>(account: &Account<RW>) -> Result<&MailboxState>
where
  RW: io::Read + io::Write,
{
  account.selected().and_then(|m| m.state.as_ref()).ok_or_else(|| Error::local("no mailbox selected"))
}

/// Drains responses for `expected` outstanding tags, applying untagged
/// ones to mailbox state and returning the first rejection encountered
/// (if any) rather than failing fast, so every tag is still resolved.
fn drain_tags<RW>(account: &mut Account<RW>, expected: usize) -> Result<Option<(String, Option<OwnedRespCode>)>>
where
  RW: io::Read + io::Write,
{
  let mut remaining = expected;
  let mut rejection = None;
  while remaining > 0 {
    match account.connection.stream.read_parsed()? {
      OwnedLine::Untagged(untagged) => {
        let mailbox = account.selected_state_mut();
        match dispatch(mailbox, None, untagged) {
          crate::response::DispatchSignal::Normal => {}
          crate::response::DispatchSignal::Bye => {
            account.connection.state = crate::connection::State::Disconnected;
            return Err(Error::fatal("server sent BYE mid-sync"));
          }
          crate::response::DispatchSignal::Inconsistent(reason) => {
            account.connection.state = crate::connection::State::Disconnected;
            return Err(Error::fatal(reason));
          }
        }
      }
      OwnedLine::Tagged { tag, ok, code } => {
        account.connection.queue.resolve(&tag)?;
        remaining -= 1;
        if !ok && rejection.is_none() {
          rejection = Some((tag, code));
        }
      }
      OwnedLine::Continuation => continue,
    }
  }
  Ok(rejection)
}

fn submit_uid_store<RW>(account: &mut Account<RW>, set: &str, add: bool, flag: &str) -> Result<()>
where
  RW: io::Read + io::Write,
{
  let verb = if add { "+FLAGS.SILENT" } else { "-FLAGS.SILENT" };
  let tag = account.connection.queue.tag();
  let line = format!("{tag} UID STORE {set} {verb} ({flag})\r\n");
  account.connection.queue.submit(&mut account.connection.stream, tag, line.as_bytes(), Flag::Queue)
}

/// Runs [`messageset::build_all`] for `predicate`, queuing one `UID STORE`
/// per batch. Returns how many commands were queued.
fn queue_store_batches<RW>(account: &mut Account<RW>, reserved: usize, predicate: &Predicate, add: bool, flag: &str) -> Result<usize>
where
  RW: io::Read + io::Write,
{
  let mut batches = Vec::new();
  {
    let state = selected_state_ref(account)?;
    messageset::build_all(state, predicate, reserved, |set| batches.push(set.to_owned()));
  }
  let count = batches.len();
  for set in batches {
    submit_uid_store(account, &set, add, flag)?;
  }
  Ok(count)
}

fn clear_changed(state: &mut MailboxState, uids: &[u64]) {
  for &uid in uids {
    if let Some(message) = state.by_uid_mut(uid) {
      message.changed = false;
    }
  }
}

fn matching_uids(state: &MailboxState, predicate: &Predicate) -> Vec<u64> {
  state.uid_sorted_view().iter().map(|&i| &state.messages()[i]).filter(|m| predicate.matches(m)).map(|m| m.uid).collect()
}

/// Phase 2: `UID STORE set +FLAGS.SILENT (\Deleted)` for every changed
/// `\Deleted` message, run only when the caller asked to expunge and the
/// mailbox's ACL rights allow deletion.
fn fast_delete<RW>(account: &mut Account<RW>) -> Result<usize>
where
  RW: io::Read + io::Write,
{
  let predicate = Predicate::new(Selector::Deleted).changed_only();
  let uids = matching_uids(selected_state_ref(account)?, &predicate);
  if uids.is_empty() {
    return Ok(0);
  }
  let queued = queue_store_batches(account, 32, &predicate, true, "\\Deleted")?;
  account.connection.queue.flush(&mut account.connection.stream)?;
  if let Some((tag, code)) = drain_tags(account, queued)? {
    return Err(Error::protocol(code.map(|c| format!("{c:?}")), format!("fast-delete STORE ({tag}) rejected")));
  }
  if let Some(state) = account.selected_state_mut() {
    clear_changed(state, &uids);
  }
  Ok(uids.len())
}

/// `APPEND mailbox {n}\r\n<body>`: a literal-framed command that needs a
/// send/continuation/send round trip, so (like [`crate::connection::PlainAuth`])
/// it bypasses the tag queue's pipeline bookkeeping entirely rather than
/// force-fitting it into `Queue::submit`. Exposed directly for the
/// `append(msg)`/`append-open` consumer operation (§6); [`reupload`] is
/// just its other caller.
pub fn append<RW>(account: &mut Account<RW>, mailbox: &str, body: &[u8]) -> Result<()>
where
  RW: io::Read + io::Write,
{
  let tag = account.connection.queue.tag();
  let quoted = crate::wire::quote(mailbox.as_bytes());
  let header = format!("{tag} APPEND {} {{{}}}\r\n", String::from_utf8_lossy(&quoted), body.len());
  account.connection.stream.write_command(header.as_bytes(), header.len())?;
  loop {
    match account.connection.stream.read_parsed()? {
      OwnedLine::Continuation => break,
      OwnedLine::Untagged(untagged) => {
        let mailbox = account.selected_state_mut();
        match dispatch(mailbox, None, untagged) {
          crate::response::DispatchSignal::Normal => {}
          crate::response::DispatchSignal::Bye => {
            account.connection.state = crate::connection::State::Disconnected;
            return Err(Error::fatal("server sent BYE mid-APPEND"));
          }
          crate::response::DispatchSignal::Inconsistent(reason) => {
            account.connection.state = crate::connection::State::Disconnected;
            return Err(Error::fatal(reason));
          }
        }
      }
      OwnedLine::Tagged { .. } => return Err(Error::fatal("server rejected APPEND before continuation")),
    }
  }
  let mut rest = Vec::with_capacity(body.len() + 2);
  rest.extend_from_slice(body);
  rest.extend_from_slice(b"\r\n");
  account.connection.stream.write_command(&rest, 0)?;
  loop {
    match account.connection.stream.read_parsed()? {
      OwnedLine::Untagged(untagged) => {
        let mailbox = account.selected_state_mut();
        match dispatch(mailbox, None, untagged) {
          crate::response::DispatchSignal::Normal => {}
          crate::response::DispatchSignal::Bye => {
            account.connection.state = crate::connection::State::Disconnected;
            return Err(Error::fatal("server sent BYE mid-APPEND"));
          }
          crate::response::DispatchSignal::Inconsistent(reason) => {
            account.connection.state = crate::connection::State::Disconnected;
            return Err(Error::fatal(reason));
          }
        }
      }
      OwnedLine::Tagged { tag: t, ok, code } if t == tag => {
        return if ok { Ok(()) } else { Err(Error::protocol(code.map(|c| format!("{c:?}")), "APPEND rejected")) };
      }
      OwnedLine::Tagged { .. } | OwnedLine::Continuation => continue,
    }
  }
}

/// Phase 3: re-append every message the host marked as structurally
/// changed, via `source`. The server assigns a fresh UID; the old copy is
/// left in place for the host to mark `\Deleted` through the normal flag
/// path once it has adopted the new one.
fn reupload<RW>(account: &mut Account<RW>, source: &dyn AppendSource) -> Result<usize>
where
  RW: io::Read + io::Write,
{
  let uids: Vec<u64> =
    selected_state_ref(account)?.messages().iter().filter(|m| m.needs_reupload).map(|m| m.uid).collect();
  let mailbox_name = account.selected().map(|m| m.name.clone()).expect("selected mailbox required");
  for uid in &uids {
    let body = source.body(*uid)?;
    append(account, &mailbox_name, &body)?;
    if let Some(state) = account.selected_state_mut() {
      if let Some(message) = state.by_uid_mut(*uid) {
        message.needs_reupload = false;
      }
    }
  }
  Ok(uids.len())
}

/// Phases 4–5: push every flag kind's diff in one pipelined batch, then
/// clear `changed` on every message that was part of it. A single
/// combined `changed` bit (§3) means one `sync()` call always pushes every
/// outstanding flag dimension together, so reconciliation only needs to
/// run once at the end rather than per flag kind.
fn flag_sync<RW>(account: &mut Account<RW>) -> Result<usize>
where
  RW: io::Read + io::Write,
{
  let changed_uids: Vec<u64> =
    selected_state_ref(account)?.messages().iter().filter(|m| m.changed).map(|m| m.uid).collect();
  if changed_uids.is_empty() {
    return Ok(0);
  }

  let mut queued = 0;
  for (selector, wire_flag) in SYSTEM_FLAGS {
    let Some(flag) = wire_flag else { continue };
    let add = Predicate::new(selector).changed_only();
    let remove = add.inverted();
    queued += queue_store_batches(account, 32, &add, true, flag)?;
    queued += queue_store_batches(account, 32, &remove, false, flag)?;
  }
  if queued == 0 {
    return Ok(0);
  }
  account.connection.queue.flush(&mut account.connection.stream)?;
  if let Some((tag, code)) = drain_tags(account, queued)? {
    return Err(Error::protocol(code.map(|c| format!("{c:?}")), format!("flag sync STORE ({tag}) rejected")));
  }
  if let Some(state) = account.selected_state_mut() {
    clear_changed(state, &changed_uids);
  }
  Ok(changed_uids.len())
}

/// `sync(mailbox, expunge, close)` (§4.7): poll, fast-delete, reupload,
/// flag sync, reconcile, expunge, close — in that fixed order. Aborts
/// before any wire traffic beyond the poll if the poll itself reports a
/// reopen is required.
pub fn sync<RW>(
  account: &mut Account<RW>,
  expunge: bool,
  close: bool,
  keepalive: time::Duration,
  source: Option<&dyn AppendSource>,
) -> Result<SyncSummary>
where
  RW: io::Read + io::Write + Readiness,
{
  if check::check(account, true, false, keepalive)? == CheckResult::Reopened {
    return Err(Error::local("mailbox reopen required, sync aborted"));
  }

  let mut summary = SyncSummary::default();

  let can_delete = selected_state_ref(account)?.rights.delete;
  if expunge && can_delete {
    summary.deleted = fast_delete(account)?;
  }

  if let Some(source) = source {
    summary.reuploaded = reupload(account, source)?;
  }

  summary.flags_synced = flag_sync(account)?;

  // RFC 4314's `d` right covers both storing `\Deleted` and performing
  // EXPUNGE, so the same `can_delete` gate applies here.
  if expunge && can_delete && !close {
    if let Some(state) = account.selected_state_mut() {
      state.pending.expunge_expected = true;
    }
    // `EXPUNGE`'s own untagged `* n EXPUNGE` responses have to go through
    // the same `dispatch`-into-mailbox-state path `fast_delete` uses:
    // `Connection::exec_simple` only tracks capability codes and discards
    // every other untagged line, so routing through it here would never
    // set `server_expunged` on anything and leave `compact()` with nothing
    // to remove (§4.7 phase 6, §8's EXPUNGE-reconciliation property).
    let tag = account.connection.queue.tag();
    let line = format!("{tag} EXPUNGE\r\n");
    account.connection.queue.submit(&mut account.connection.stream, tag, line.as_bytes(), Flag::None)?;
    if let Some((tag, code)) = drain_tags(account, 1)? {
      return Err(Error::protocol(code.map(|c| format!("{c:?}")), format!("EXPUNGE ({tag}) rejected")));
    }
    if let Some(state) = account.selected_state_mut() {
      state.compact();
      state.pending.expunge_expected = false;
    }
    summary.expunged = true;
  }

  if close {
    account.close()?;
    summary.closed = true;
  }

  Ok(summary)
}

/// Fast-trash (§4.7): `UID COPY set trash_mbox`, offering to create the
/// destination once on `[TRYCREATE]` via `create`, then retrying the copy
/// exactly once.
pub fn fast_trash<RW>(account: &mut Account<RW>, set: &str, trash_mailbox: &str, create: impl FnOnce() -> bool) -> Result<()>
where
  RW: io::Read + io::Write,
{
  match copy(account, set, trash_mailbox) {
    Err(error) => match error.kind() {
      crate::error::Kind::RejectedExpected(Rejection::TryCreate) if create() => {
        let quoted = String::from_utf8_lossy(&crate::wire::quote(trash_mailbox.as_bytes())).into_owned();
        account.connection.exec_simple(&format!("CREATE {quoted}"))?;
        copy(account, set, trash_mailbox)
      }
      _ => Err(error),
    },
    ok => ok,
  }
}

fn copy<RW>(account: &mut Account<RW>, set: &str, mailbox: &str) -> Result<()>
where
  RW: io::Read + io::Write,
{
  let quoted = String::from_utf8_lossy(&crate::wire::quote(mailbox.as_bytes())).into_owned();
  account.connection.exec_simple(&format!("UID COPY {set} {quoted}")).map(|_| ()).map_err(reclassify_trycreate)
}

/// `exec_simple` surfaces every rejection as plain `Protocol`; fast-trash
/// needs `[TRYCREATE]` specifically so it can offer to create the
/// destination, per §7's rejected-expected category.
fn reclassify_trycreate(error: Error) -> Error {
  match error.kind() {
    crate::error::Kind::Protocol { qualifier: Some(q) } if q.contains("TryCreate") => {
      Error::rejected(Rejection::TryCreate, "destination mailbox does not exist")
    }
    _ => error,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::account::{Account, AccountId};
  use crate::connection::{Connection, TestDuplex};
  use crate::mailbox::{MailboxState, Rights};
  use crate::wire::Stream;

  fn account(script: &[u8]) -> Account<TestDuplex> {
    let mut connection = Connection::new(Stream::new(TestDuplex::new(script)), true, true);
    connection.state = crate::connection::State::Authenticated;
    Account::new(
      AccountId {
        host: "imap.example.com".to_owned(),
        port: 993,
        user: "me".to_owned(),
        security: crate::config::Security::ImplicitTls,
      },
      connection,
    )
  }

  fn state_with(uids_deleted: &[(u64, bool)]) -> MailboxState {
    let mut state = MailboxState::default();
    state.rights = Rights::ALL;
    for &(uid, deleted) in uids_deleted {
      let message = state.push(uid);
      message.deleted = deleted;
      message.changed = true;
    }
    state
  }

  #[test]
  fn sync_fast_deletes_then_expunges() {
    let mut acc = account(
      b"a0000 OK NOOP completed\r\n\
        a0001 OK STORE completed\r\n\
        * 2 EXPUNGE\r\n\
        * 1 EXPUNGE\r\n\
        a0002 OK EXPUNGE completed\r\n",
    );
    acc.inject_selected_state("INBOX", state_with(&[(10, true), (11, true)]));
    let summary = sync(&mut acc, true, false, time::Duration::from_secs(900), None).unwrap();
    assert_eq!(summary.deleted, 2);
    assert_eq!(summary.flags_synced, 0);
    assert!(summary.expunged);
    assert!(!summary.closed);
    let state = acc.selected().unwrap().state.as_ref().unwrap();
    assert_eq!(state.len(), 0, "both messages expunged and compacted away");
  }

  #[test]
  fn sync_without_delete_right_skips_fast_delete_and_expunge_but_still_syncs_flags() {
    // With no fast-delete, the one changed-but-never-stored `\Deleted`
    // message still needs its full flag-sync pass: one `+FLAGS.SILENT
    // (\Deleted)` plus a no-op `-FLAGS.SILENT` for every other system flag
    // the message never actually had (Flagged, Seen, Answered — `Old` has
    // no wire form), since sync has no per-flag "did this one change"
    // bit, only the message-level `changed` bit.
    let mut acc = account(
      b"a0000 OK NOOP completed\r\n\
        a0001 OK STORE completed\r\n\
        a0002 OK STORE completed\r\n\
        a0003 OK STORE completed\r\n\
        a0004 OK STORE completed\r\n",
    );
    let mut state = state_with(&[(10, true)]);
    state.rights = Rights { delete: false, ..Rights::ALL };
    acc.inject_selected_state("INBOX", state);
    let summary = sync(&mut acc, true, false, time::Duration::from_secs(900), None).unwrap();
    assert_eq!(summary.deleted, 0);
    assert_eq!(summary.flags_synced, 1);
    assert!(!summary.expunged, "EXPUNGE is gated on the same delete right as fast-delete");
  }

  #[test]
  fn fast_trash_reclassifies_trycreate() {
    let error = Error::protocol(Some("TryCreate".to_owned()), "no such mailbox");
    let reclassified = reclassify_trycreate(error);
    assert!(matches!(reclassified.kind(), crate::error::Kind::RejectedExpected(Rejection::TryCreate)));
  }

  #[test]
  fn matching_uids_respects_changed_only_and_order() {
    let mut state = MailboxState::default();
    state.push(30).deleted = true;
    state.by_uid_mut(30).unwrap().changed = true;
    state.push(10).deleted = true;
    // left unchanged: excluded by `changed_only`
    let predicate = Predicate::new(Selector::Deleted).changed_only();
    assert_eq!(matching_uids(&state, &predicate), vec![30]);
  }
}
