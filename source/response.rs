//! Response dispatcher: applies unilateral untagged responses to the
//! selected mailbox's state, and separately feeds per-command result
//! accumulators (LIST/LSUB/SEARCH/STATUS) registered at submission time.
//!
//! This replaces the source's single giant switch keyed off a
//! connection-wide mutable out-parameter: a command that wants structured
//! results declares a [`Sink`] when it is submitted, and the dispatcher
//! appends to *that* sink specifically, leaving the always-on mailbox
//! mutation path untouched by command-specific data.

use crate::mailbox::MailboxState;
use crate::wire::{OwnedListEntry, OwnedMailbox, OwnedMsgAtt, OwnedRespCode, OwnedUntagged};

/// A per-command result accumulator, supplied at submission time.
#[derive(Debug, Default)]
pub enum Sink {
  #[default]
  None,
  List(Vec<OwnedListEntry>),
  Lsub(Vec<OwnedListEntry>),
  Search(Vec<u64>),
  Status(Option<(OwnedMailbox, Vec<(String, u64)>)>),
}

impl Sink {
  fn accepts(&self, untagged: &OwnedUntagged) -> bool {
    matches!(
      (self, untagged),
      (Sink::List(_), OwnedUntagged::List(_))
        | (Sink::Lsub(_), OwnedUntagged::Lsub(_))
        | (Sink::Search(_), OwnedUntagged::Search(_))
        | (Sink::Status(_), OwnedUntagged::Status { .. })
    )
  }

  fn feed(&mut self, untagged: OwnedUntagged) {
    match (self, untagged) {
      (Sink::List(entries), OwnedUntagged::List(entry)) => entries.push(entry),
      (Sink::Lsub(entries), OwnedUntagged::Lsub(entry)) => entries.push(entry),
      (Sink::Search(uids), OwnedUntagged::Search(mut new)) => uids.append(&mut new),
      (Sink::Status(slot), OwnedUntagged::Status { mailbox, attrs }) => *slot = Some((mailbox, attrs)),
      _ => unreachable!("accepts() must be checked before feed()"),
    }
  }
}

/// What [`dispatch`] observed that the caller can't just shrug off by
/// mutating mailbox state: the connection has to come down either way,
/// but the fatal message differs (a deliberate BYE vs. a protocol
/// inconsistency), so callers get to decide the exact wording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchSignal {
  /// Applied normally; no special action needed.
  Normal,
  /// The server sent `BYE`.
  Bye,
  /// A server response contradicted mailbox state the engine already
  /// holds (§4.3's `<n> EXISTS` shrink-without-EXPUNGE/VANISHED case).
  /// The connection is no longer trustworthy and must be torn down.
  Inconsistent(String),
}

/// Applies one untagged response to mailbox state (when one is selected)
/// and, if it matches, to `sink`. Returns a [`DispatchSignal`] telling the
/// caller whether the connection must come down and why.
pub fn dispatch(mailbox: Option<&mut MailboxState>, sink: Option<&mut Sink>, untagged: OwnedUntagged) -> DispatchSignal {
  if let Some(sink) = sink {
    if sink.accepts(&untagged) {
      sink.feed(untagged);
      return DispatchSignal::Normal;
    }
  }
  match (mailbox, untagged) {
    (Some(state), OwnedUntagged::Flags(flags)) => state.permanent_flags = flags,
    (Some(state), OwnedUntagged::Ok(Some(code))) => apply_ok_code(state, code),
    (Some(state), OwnedUntagged::Exists(n)) => {
      // §4.3: a shrink with no preceding EXPUNGE/VANISHED is a server
      // inconsistency. `active_len` already reflects every EXPUNGE/VANISHED
      // applied so far (they flip `server_expunged` immediately, ahead of
      // the deferred `compact()` pass), so comparing against it rather
      // than the raw (pre-compaction) array length is what lets a
      // legitimate post-expunge EXISTS through while still catching a
      // genuine regression.
      let active = state.active_len() as u64;
      if n < active {
        return DispatchSignal::Inconsistent(format!(
          "server reported {n} EXISTS, below the {active} active messages already known with no preceding EXPUNGE/VANISHED"
        ));
      }
      state.new_mail_count = n;
      state.pending.newmail_pending = true;
      // Placeholder UID for a newly-announced message: `0`, the same
      // convention `Account::select`'s own EXISTS handling uses before any
      // FETCH resolves the real UID. `uidnext` stays server-authoritative
      // (§3), populated only by the `OK [UIDNEXT]` response code above.
      while (state.len() as u64) < n {
        state.push(0);
      }
    }
    (Some(state), OwnedUntagged::Recent(n)) => state.recent = n,
    (Some(state), OwnedUntagged::Expunge(n)) => {
      if !state.pending.expunge_expected {
        state.pending.reopen_allowed = true;
      }
      state.mark_expunged(n);
    }
    (Some(state), OwnedUntagged::Vanished { uids, .. }) => {
      for (start, end) in uids {
        for uid in start..=end {
          state.mark_vanished(uid);
        }
      }
    }
    (Some(state), OwnedUntagged::Fetch { msn, attrs }) => apply_fetch(state, msn, attrs),
    (_, OwnedUntagged::Bye(_)) => return DispatchSignal::Bye,
    _ => (),
  }
  DispatchSignal::Normal
}

fn apply_ok_code(state: &mut MailboxState, code: OwnedRespCode) {
  match code {
    OwnedRespCode::PermanentFlags(flags) => state.permanent_flags = flags,
    OwnedRespCode::UidValidity(n) => state.uidvalidity = n,
    OwnedRespCode::UidNext(n) => state.uidnext = n,
    OwnedRespCode::HighestModSeq(n) => state.modseq = n,
    OwnedRespCode::Unseen(n) => state.unseen = n,
    OwnedRespCode::ReadOnly => state.read_only = true,
    OwnedRespCode::ReadWrite => state.read_only = false,
    _ => (),
  }
}

fn apply_fetch(state: &mut MailboxState, msn: u64, attrs: Vec<OwnedMsgAtt>) {
  if state.by_msn(msn).is_none() {
    return;
  }
  let mut flags_changed = false;
  let mut new_uid = None;
  {
    let message = state.by_msn_mut(msn).expect("checked above");
    for attr in attrs {
      match attr {
        OwnedMsgAtt::Uid(uid) => new_uid = Some(uid),
        OwnedMsgAtt::Flags(flags) => {
          message.apply_system_flags(&flags);
          flags_changed = true;
        }
        OwnedMsgAtt::InternalDate(raw) => message.internal_date = Some(raw),
        OwnedMsgAtt::Rfc822Size(size) => message.size = Some(size),
        OwnedMsgAtt::ModSeq(_) | OwnedMsgAtt::Body(_) => (),
      }
    }
  }
  // Rekeying through `set_uid` rather than a direct field write keeps the
  // UID index consistent when a FETCH resolves the placeholder UID a
  // SELECT/EXISTS growth assigned.
  if let Some(uid) = new_uid {
    state.set_uid(msn, uid);
  }
  if flags_changed {
    state.pending.flags_pending = true;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::wire::parser;

  fn owned(line: &[u8]) -> OwnedUntagged {
    match crate::wire::OwnedLine::from_borrowed(&parser::line(line).unwrap()) {
      crate::wire::OwnedLine::Untagged(u) => u,
      other => panic!("expected untagged line, got {other:?}"),
    }
  }

  #[test]
  fn exists_grows_array_and_sets_pending() {
    let mut state = MailboxState::default();
    state.uidnext = 10;
    assert_eq!(dispatch(Some(&mut state), None, owned(b"3 EXISTS\r\n")), DispatchSignal::Normal);
    assert_eq!(state.len(), 3);
    assert!(state.pending.newmail_pending);
    assert_eq!(state.new_mail_count, 3);
    // `uidnext` is server-authoritative (§3): growth placeholders must not
    // touch it.
    assert_eq!(state.uidnext, 10);
  }

  #[test]
  fn exists_shrink_without_expunge_is_inconsistent() {
    let mut state = MailboxState::default();
    state.push(10);
    state.push(11);
    state.push(12);
    match dispatch(Some(&mut state), None, owned(b"2 EXISTS\r\n")) {
      DispatchSignal::Inconsistent(_) => {}
      other => panic!("expected Inconsistent, got {other:?}"),
    }
  }

  #[test]
  fn exists_after_expunge_is_not_flagged_inconsistent() {
    let mut state = MailboxState::default();
    state.push(10);
    state.push(11);
    state.push(12);
    assert_eq!(dispatch(Some(&mut state), None, owned(b"2 EXPUNGE\r\n")), DispatchSignal::Normal);
    // Two messages are still live (array not yet compacted); an EXISTS of
    // 2 matches that exactly and must not be treated as a shrink.
    assert_eq!(dispatch(Some(&mut state), None, owned(b"2 EXISTS\r\n")), DispatchSignal::Normal);
  }

  #[test]
  fn expunge_marks_without_immediate_compaction() {
    let mut state = MailboxState::default();
    state.push(10);
    state.push(11);
    state.push(12);
    assert_eq!(dispatch(Some(&mut state), None, owned(b"2 EXPUNGE\r\n")), DispatchSignal::Normal);
    assert_eq!(state.len(), 3, "compaction is deferred to the cleanup pass");
    assert!(state.pending.expunge_pending);
    assert!(state.pending.reopen_allowed);
  }

  #[test]
  fn fetch_updates_flags_without_polluting_a_list_sink() {
    let mut state = MailboxState::default();
    state.push(10);
    let mut sink = Sink::List(Vec::new());
    dispatch(Some(&mut state), Some(&mut sink), owned(b"1 FETCH (FLAGS (\\Seen))\r\n"));
    assert!(state.by_msn(1).unwrap().read);
    match sink {
      Sink::List(entries) => assert!(entries.is_empty()),
      _ => unreachable!(),
    }
  }

  #[test]
  fn list_response_is_routed_to_its_sink_not_mailbox_state() {
    let mut sink = Sink::List(Vec::new());
    let signal = dispatch(None, Some(&mut sink), owned(b"LIST (\\HasNoChildren) \"/\" INBOX\r\n"));
    assert_eq!(signal, DispatchSignal::Normal);
    match sink {
      Sink::List(entries) => assert_eq!(entries.len(), 1),
      _ => unreachable!(),
    }
  }

  #[test]
  fn bye_is_reported_to_the_caller() {
    assert_eq!(dispatch(None, None, owned(b"BYE logging out\r\n")), DispatchSignal::Bye);
  }
}
