//! Message-set builder: turns a predicate over the selected mailbox's
//! messages into the shortest `u,u:v,...` UID-range expression that covers
//! exactly the matching messages, within a hard per-command length
//! ceiling (§4.6).

use crate::mailbox::{MailboxState, Message};

/// The flag a predicate selects on. `Tagged` and `Trash` are host-facing
/// concepts carried on [`Message::flags_remote`]/[`Message::tags`] rather
/// than system flags; the engine still builds sets over them so a sync
/// pass can batch "move everything tagged" the same way it batches
/// `\Deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
  Deleted,
  Flagged,
  Old,
  Read,
  Replied,
  Tagged,
  Trash,
}

impl Selector {
  fn matches(self, message: &Message) -> bool {
    match self {
      Selector::Deleted => message.deleted,
      Selector::Flagged => message.flagged,
      Selector::Old => message.old,
      Selector::Read => message.read,
      Selector::Replied => message.replied,
      Selector::Tagged | Selector::Trash => !message.tags.is_empty(),
    }
  }
}

/// A predicate over messages: a flag selector, optionally gated to only
/// locally-modified messages, optionally inverted.
#[derive(Debug, Clone, Copy)]
pub struct Predicate {
  pub selector: Selector,
  pub changed_only: bool,
  pub invert: bool,
}

impl Predicate {
  pub fn new(selector: Selector) -> Self {
    Self { selector, changed_only: false, invert: false }
  }

  pub fn changed_only(mut self) -> Self {
    self.changed_only = true;
    self
  }

  pub fn inverted(mut self) -> Self {
    self.invert = true;
    self
  }

  pub(crate) fn matches(&self, message: &Message) -> bool {
    if message.exclude_from_next_set {
      return false;
    }
    if self.changed_only && !message.changed {
      return false;
    }
    self.selector.matches(message) != self.invert
  }
}

/// The hard per-command length ceiling from §4.6 rule 4: MTU headroom for
/// lazy servers, applied to the whole command line including tag and CRLF.
pub const CEILING: usize = 1024;

/// Result of one [`build`] call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Built {
  /// The `u,u:v,...` expression, with no leading/trailing separators.
  pub set: String,
  /// How many messages this call's `set` covers.
  pub emitted: usize,
  /// Index into the UID-sorted view to resume from on the next call, or
  /// `None` once the predicate has been fully covered.
  pub cursor: Option<usize>,
}

/// Builds one batch of a message set starting at `cursor` (0 on the first
/// call), stopping before `set` would push a command of length `reserved
/// + set.len()` past [`CEILING`]. Traverses in UID-ascending order via a
/// temporary sorted view (§4.6 rule 1) — the canonical MSN-ordered array
/// is never reordered.
pub fn build(state: &MailboxState, predicate: &Predicate, reserved: usize, cursor: usize) -> Built {
  let view = state.uid_sorted_view();
  let mut set = String::new();
  let mut emitted = 0;
  let mut run_start: Option<u64> = None;
  let mut run_end: Option<u64> = None;
  let mut index = cursor;

  let flush_run = |set: &mut String, run_start: u64, run_end: u64| {
    if !set.is_empty() {
      set.push(',');
    }
    if run_start == run_end {
      set.push_str(&run_start.to_string());
    } else {
      set.push_str(&format!("{run_start}:{run_end}"));
    }
  };

  while index < view.len() {
    let message = &state.messages()[view[index]];
    if !predicate.matches(message) {
      if let (Some(start), Some(end)) = (run_start.take(), run_end.take()) {
        flush_run(&mut set, start, end);
      }
      index += 1;
      continue;
    }

    // Project the committed set plus the in-progress run as it would read
    // if flushed right now, to decide whether adding this message would
    // cross the ceiling.
    let mut projected = set.clone();
    if let (Some(start), Some(end)) = (run_start, run_end) {
      let next_end = if end + 1 == message.uid { message.uid } else { end };
      if !projected.is_empty() {
        projected.push(',');
      }
      if start == next_end {
        projected.push_str(&start.to_string());
      } else {
        projected.push_str(&format!("{start}:{next_end}"));
      }
    } else {
      if !projected.is_empty() {
        projected.push(',');
      }
      projected.push_str(&message.uid.to_string());
    }
    if reserved + projected.len() > CEILING && emitted > 0 {
      break;
    }

    match (run_start, run_end) {
      (Some(_), Some(end)) if end + 1 == message.uid => run_end = Some(message.uid),
      (Some(start), Some(end)) => {
        flush_run(&mut set, start, end);
        run_start = Some(message.uid);
        run_end = Some(message.uid);
      }
      _ => {
        run_start = Some(message.uid);
        run_end = Some(message.uid);
      }
    }
    emitted += 1;
    index += 1;
  }

  if let (Some(start), Some(end)) = (run_start, run_end) {
    flush_run(&mut set, start, end);
  }

  Built { set, emitted, cursor: if index < view.len() { Some(index) } else { None } }
}

/// Runs [`build`] to exhaustion, invoking `emit` once per batch with the
/// UID-set text. Mirrors the caller loop described in §4.6 rule 4
/// (`PRE setlist POST` per iteration until the cursor reaches the end).
pub fn build_all(
  state: &MailboxState,
  predicate: &Predicate,
  reserved: usize,
  mut emit: impl FnMut(&str),
) -> usize {
  let mut cursor = 0;
  let mut total = 0;
  loop {
    let built = build(state, predicate, reserved, cursor);
    if built.emitted == 0 {
      break;
    }
    emit(&built.set);
    total += built.emitted;
    match built.cursor {
      Some(next) => cursor = next,
      None => break,
    }
  }
  total
}

#[cfg(test)]
mod tests {
  use super::*;

  fn state_with(uids_deleted: &[(u64, bool)]) -> MailboxState {
    let mut state = MailboxState::default();
    for &(uid, deleted) in uids_deleted {
      let message = state.push(uid);
      message.deleted = deleted;
      message.changed = true;
    }
    state
  }

  #[test]
  fn contiguous_uids_collapse_to_one_range() {
    let state = state_with(&[(10, true), (11, true), (12, true)]);
    let built = build(&state, &Predicate::new(Selector::Deleted), 0, 0);
    assert_eq!(built.set, "10:12");
    assert_eq!(built.emitted, 3);
    assert_eq!(built.cursor, None);
  }

  #[test]
  fn non_contiguous_uids_stay_as_separate_entries() {
    let state = state_with(&[(10, true), (11, false), (12, true), (20, true)]);
    let built = build(&state, &Predicate::new(Selector::Deleted), 0, 0);
    assert_eq!(built.set, "10,12,20");
  }

  #[test]
  fn excluded_message_breaks_a_run() {
    let mut state = state_with(&[(10, true), (11, true), (12, true)]);
    state.by_uid_mut(11).unwrap().exclude_from_next_set = true;
    let built = build(&state, &Predicate::new(Selector::Deleted), 0, 0);
    assert_eq!(built.set, "10,12");
  }

  #[test]
  fn invert_selects_the_complement() {
    let state = state_with(&[(10, true), (11, false), (12, true)]);
    let built = build(&state, &Predicate::new(Selector::Deleted).inverted(), 0, 0);
    assert_eq!(built.set, "11");
  }

  #[test]
  fn changed_only_skips_unmodified_messages() {
    let mut state = state_with(&[(10, true), (11, true)]);
    state.by_uid_mut(11).unwrap().changed = false;
    let built = build(&state, &Predicate::new(Selector::Deleted).changed_only(), 0, 0);
    assert_eq!(built.set, "10");
  }

  #[test]
  fn ceiling_splits_large_sets_across_batches() {
    // 500 non-contiguous UIDs (spaced by 2) so every entry is its own run,
    // forcing the 1024-octet ceiling to split the output across calls.
    let pairs: Vec<(u64, bool)> = (0..500).map(|i| (1000 + i * 2, true)).collect();
    let state = state_with(&pairs);
    let predicate = Predicate::new(Selector::Deleted);
    let mut batches = Vec::new();
    let total = build_all(&state, &predicate, 32, |set| batches.push(set.to_owned()));
    assert_eq!(total, 500);
    assert!(batches.len() >= 2, "expected the 1024-octet ceiling to force multiple batches");
    for batch in &batches {
      assert!(32 + batch.len() <= CEILING);
    }
    let mut covered: Vec<u64> = batches
      .iter()
      .flat_map(|batch| batch.split(','))
      .map(|entry| entry.split(':').next().unwrap().parse::<u64>().unwrap())
      .collect();
    covered.sort_unstable();
    let expected: Vec<u64> = pairs.iter().map(|&(uid, _)| uid).collect();
    assert_eq!(covered, expected);
  }
}
