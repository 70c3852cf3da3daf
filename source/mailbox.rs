//! Mailbox state: per-selected-mailbox flags, UID bookkeeping, and the
//! message array with its MSN/UID indices.

use crate::wire::{MailboxCodec, Utf7Codec};
use std::collections::HashMap;

/// A named mailbox in the hierarchy. Carries its own wire encoding so the
/// codec choice (mUTF-7 vs UTF-8, §6) is pinned at construction time
/// rather than re-derived from connection state on every command.
pub struct Mailbox {
  /// Human-facing name, e.g. `"Sent Items"` or `"台北/日本語"`.
  pub name: String,
  /// The delimiter-joined path as the server names it.
  pub path: Vec<String>,
  delimiter: char,
  /// Populated once SELECT/EXAMINE succeeds; `None` while unselected.
  pub state: Option<MailboxState>,
}

impl Mailbox {
  pub fn new(path: Vec<String>, delimiter: char) -> Self {
    let name = path.join(&delimiter.to_string());
    Self { name, path, delimiter, state: None }
  }

  pub fn root(delimiter: char) -> Self {
    Self::new(vec!["INBOX".to_owned()], delimiter)
  }

  /// The name as it should appear on the wire, mUTF-7-encoded unless the
  /// connection has negotiated `UTF8=ACCEPT` (in which case callers pass
  /// [`crate::wire::Utf8Codec`] instead).
  pub fn wire_name(&self, codec: &dyn MailboxCodec) -> String {
    codec.encode(&self.name)
  }

  pub fn is_selected(&self) -> bool {
    self.state.is_some()
  }
}

impl Default for Mailbox {
  fn default() -> Self {
    Self::root('/')
  }
}

/// Decodes a wire mailbox name into a [`Mailbox`], splitting on `delimiter`.
/// INBOX is case-insensitive per RFC 3501 §5.1 and is always normalized to
/// the literal string `"INBOX"`. Falls back to a lossy UTF-8 decode if the
/// name is not valid modified UTF-7 rather than dropping the mailbox.
pub fn from_wire(raw: &[u8], delimiter: char) -> Mailbox {
  let decoded = Utf7Codec.decode(raw).unwrap_or_else(|| String::from_utf8_lossy(raw).into_owned());
  let path: Vec<String> = if decoded.eq_ignore_ascii_case("INBOX") {
    vec!["INBOX".to_owned()]
  } else if delimiter == '\0' {
    vec![decoded]
  } else {
    decoded.split(delimiter).map(str::to_owned).collect()
  };
  Mailbox::new(path, delimiter)
}

/// Per-message server-flag cache plus the two explicit pending bits that
/// replace the source's overloaded `active == false` convention.
#[derive(Debug, Clone)]
pub struct Message {
  /// 1-based position in the mailbox's message array; recomputed whenever
  /// the array is compacted.
  pub msn: u64,
  pub uid: u64,
  pub read: bool,
  pub old: bool,
  pub flagged: bool,
  pub replied: bool,
  pub deleted: bool,
  /// Custom (non-system) keywords last reported by the server.
  pub flags_remote: Vec<String>,
  /// Local edits not yet reconciled with the server copy.
  pub changed: bool,
  /// The server has announced this MSN as expunged/vanished; the message
  /// is awaiting the array-compaction pass.
  pub server_expunged: bool,
  /// Caller-directed exclusion from the next message-set build, independent
  /// of any server-side state.
  pub exclude_from_next_set: bool,
  pub internal_date: Option<Vec<u8>>,
  pub size: Option<u64>,
  /// Host-facing tags, independent of any IMAP keyword.
  pub tags: Vec<String>,
  /// Set by the host when a structural edit (attachment deletion, header
  /// rewrite, thread relink) means this message must be re-appended rather
  /// than patched in place; consumed by the sync engine's reupload phase.
  pub needs_reupload: bool,
}

impl Message {
  pub fn new(msn: u64, uid: u64) -> Self {
    Self {
      msn,
      uid,
      read: false,
      old: false,
      flagged: false,
      replied: false,
      deleted: false,
      flags_remote: Vec::new(),
      changed: false,
      server_expunged: false,
      exclude_from_next_set: false,
      internal_date: None,
      size: None,
      tags: Vec::new(),
      needs_reupload: false,
    }
  }

  pub fn apply_system_flags(&mut self, flags: &[String]) {
    self.read = false;
    self.old = false;
    self.flagged = false;
    self.replied = false;
    self.deleted = false;
    let mut custom = Vec::new();
    for flag in flags {
      match flag.as_str() {
        "\\Seen" => self.read = true,
        "\\Flagged" => self.flagged = true,
        "\\Answered" => self.replied = true,
        "\\Deleted" => self.deleted = true,
        "\\Draft" | "\\Recent" => (),
        other => custom.push(other.to_owned()),
      }
    }
    self.flags_remote = custom;
  }
}

/// ACL rights bits (§6 glossary), RFC 2086 single-letter form. Assumed
/// all-granted when the server doesn't advertise ACL (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rights {
  pub lookup: bool,
  pub read: bool,
  pub seen: bool,
  pub write: bool,
  pub insert: bool,
  pub post: bool,
  pub create: bool,
  pub delete: bool,
  pub administer: bool,
}

impl Rights {
  pub const ALL: Rights = Rights {
    lookup: true,
    read: true,
    seen: true,
    write: true,
    insert: true,
    post: true,
    create: true,
    delete: true,
    administer: true,
  };

  /// Parses an RFC 2086 rights string (e.g. `"lrswipcda"`); unrecognized
  /// letters (RFC 4314 extensions) are ignored rather than rejected.
  pub fn parse(raw: &[u8]) -> Self {
    let has = |c: u8| raw.contains(&c);
    Rights {
      lookup: has(b'l'),
      read: has(b'r'),
      seen: has(b's'),
      write: has(b'w'),
      insert: has(b'i'),
      post: has(b'p'),
      create: has(b'c'),
      delete: has(b'd'),
      administer: has(b'a'),
    }
  }
}

impl Default for Rights {
  fn default() -> Self {
    Rights::ALL
  }
}

/// Pending-event bits set by the dispatcher between `check()` calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct Pending {
  pub reopen_allowed: bool,
  pub expunge_expected: bool,
  pub expunge_pending: bool,
  pub newmail_pending: bool,
  pub flags_pending: bool,
}

/// The state associated with the currently-selected mailbox. Dropped on
/// CLOSE/deselect; reconstructed on the next SELECT.
#[derive(Debug, Default)]
pub struct MailboxState {
  pub permanent_flags: Vec<String>,
  pub uidvalidity: u64,
  pub uidnext: u64,
  pub modseq: u64,
  pub recent: u64,
  pub unseen: u64,
  pub read_only: bool,
  pub new_mail_count: u64,
  pub rights: Rights,
  pub pending: Pending,
  messages: Vec<Message>,
  by_uid: HashMap<u64, usize>,
}

impl MailboxState {
  pub fn messages(&self) -> &[Message] {
    &self.messages
  }

  pub fn len(&self) -> usize {
    self.messages.len()
  }

  /// Count of messages not yet marked `server_expunged`, i.e. the
  /// mailbox's live size as the server would currently report it even
  /// though the array hasn't been compacted yet (§4.3, EXISTS shrink
  /// check).
  pub fn active_len(&self) -> usize {
    self.messages.iter().filter(|m| !m.server_expunged).count()
  }

  pub fn is_empty(&self) -> bool {
    self.messages.is_empty()
  }

  pub fn by_msn(&self, msn: u64) -> Option<&Message> {
    self.messages.get(usize::try_from(msn).ok()?.checked_sub(1)?)
  }

  pub fn by_msn_mut(&mut self, msn: u64) -> Option<&mut Message> {
    let index = usize::try_from(msn).ok()?.checked_sub(1)?;
    self.messages.get_mut(index)
  }

  pub fn by_uid(&self, uid: u64) -> Option<&Message> {
    self.by_uid.get(&uid).map(|&index| &self.messages[index])
  }

  pub fn by_uid_mut(&mut self, uid: u64) -> Option<&mut Message> {
    let index = *self.by_uid.get(&uid)?;
    Some(&mut self.messages[index])
  }

  /// Rekeys the UID index after a `FETCH` reports a UID for an MSN whose
  /// recorded UID (commonly the `0` placeholder `SELECT` assigns) differs,
  /// keeping the §3 invariant `array[i-1].uid → array[i-1]` intact.
  pub fn set_uid(&mut self, msn: u64, uid: u64) {
    let Some(index) = usize::try_from(msn).ok().and_then(|m| m.checked_sub(1)) else { return };
    let Some(message) = self.messages.get_mut(index) else { return };
    let old_uid = message.uid;
    if old_uid == uid {
      return;
    }
    message.uid = uid;
    self.by_uid.remove(&old_uid);
    self.by_uid.insert(uid, index);
  }

  /// Appends a freshly-learned message (EXISTS growth, or SELECT/FETCH
  /// discovering one); MSN is its new array position.
  pub fn push(&mut self, uid: u64) -> &mut Message {
    let msn = self.messages.len() as u64 + 1;
    self.messages.push(Message::new(msn, uid));
    let index = self.messages.len() - 1;
    self.by_uid.insert(uid, index);
    &mut self.messages[index]
  }

  /// Marks MSN `n` as server-expunged (EXPUNGE) without reindexing yet;
  /// later MSNs are still addressed by their pre-compaction positions
  /// until [`MailboxState::compact`] runs, per RFC 3501 §7.4.1.
  pub fn mark_expunged(&mut self, msn: u64) {
    if let Some(message) = self.by_msn_mut(msn) {
      message.server_expunged = true;
    }
    self.pending.expunge_pending = true;
  }

  /// Marks a UID vanished (QRESYNC `VANISHED`), independent of MSN.
  pub fn mark_vanished(&mut self, uid: u64) {
    if let Some(&index) = self.by_uid.get(&uid) {
      self.messages[index].server_expunged = true;
    }
    self.pending.expunge_pending = true;
  }

  /// Compacts the array: removes every `server_expunged` message and
  /// renumbers MSNs, restoring the dense-array invariant.
  pub fn compact(&mut self) {
    self.messages.retain(|message| !message.server_expunged);
    self.by_uid.clear();
    for (index, message) in self.messages.iter_mut().enumerate() {
      message.msn = index as u64 + 1;
      self.by_uid.insert(message.uid, index);
    }
    self.pending.expunge_pending = false;
  }

  /// A UID-ascending view of live (non-`server_expunged`) message indices,
  /// built fresh each call rather than persisted, so the canonical array's
  /// MSN order is never clobbered by a sort.
  pub fn uid_sorted_view(&self) -> Vec<usize> {
    let mut indices: Vec<usize> =
      (0..self.messages.len()).filter(|&i| !self.messages[i].server_expunged).collect();
    indices.sort_by_key(|&i| self.messages[i].uid);
    indices
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn from_wire_splits_on_delimiter_and_normalizes_inbox() {
    let m = from_wire(b"inbox", '/');
    assert_eq!(m.path, vec!["INBOX".to_owned()]);
    let m = from_wire(b"Sent/&ZeVnLIqe-", '/');
    assert_eq!(m.path, vec!["Sent".to_owned(), "日本語".to_owned()]);
  }

  #[test]
  fn push_keeps_msn_dense() {
    let mut state = MailboxState::default();
    state.push(10);
    state.push(11);
    state.push(12);
    assert_eq!(state.len(), 3);
    assert_eq!(state.by_msn(1).unwrap().uid, 10);
    assert_eq!(state.by_msn(3).unwrap().uid, 12);
  }

  #[test]
  fn expunge_then_compact_reindexes() {
    let mut state = MailboxState::default();
    state.push(10);
    state.push(11);
    state.push(12);
    state.mark_expunged(2);
    assert!(state.pending.expunge_pending);
    state.compact();
    assert_eq!(state.len(), 2);
    assert_eq!(state.by_msn(1).unwrap().uid, 10);
    assert_eq!(state.by_msn(2).unwrap().uid, 12);
    assert!(state.by_uid(11).is_none());
    assert_eq!(state.by_uid(12).unwrap().msn, 2);
  }

  #[test]
  fn set_uid_rekeys_the_uid_index() {
    let mut state = MailboxState::default();
    state.push(0);
    state.push(0);
    state.set_uid(1, 100);
    state.set_uid(2, 101);
    assert_eq!(state.by_uid(100).unwrap().msn, 1);
    assert_eq!(state.by_uid(101).unwrap().msn, 2);
    assert!(state.by_uid(0).is_none());
  }

  #[test]
  fn uid_sorted_view_does_not_mutate_array() {
    let mut state = MailboxState::default();
    state.push(30);
    state.push(10);
    state.push(20);
    let view = state.uid_sorted_view();
    let uids: Vec<u64> = view.iter().map(|&i| state.messages()[i].uid).collect();
    assert_eq!(uids, vec![10, 20, 30]);
    // canonical array order is untouched
    assert_eq!(state.by_msn(1).unwrap().uid, 30);
  }
}
