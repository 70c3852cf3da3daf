//! Hierarchy browser (§4.9): lists a mailbox hierarchy one level at a
//! time, inferring the delimiter from a probe `LIST` rather than trusting
//! server "folder + delimiter" echoes, which UW-IMAP and Cyrus disagree on.

use crate::account::Account;
use crate::connection::State;
use crate::error::{Error, Result};
use crate::response::{self, Sink};
use crate::tag::Flag;
use crate::wire::{quote, MailboxCodec, OwnedLine, OwnedMailbox};
use std::io;

/// One row in a folder listing, per §3's `FolderEntry`.
#[derive(Debug, Clone, PartialEq)]
pub struct FolderEntry {
  /// Display name, relative to the folder being browsed.
  pub name: String,
  /// Full path as named on the server, `delimiter`-joined.
  pub desc: String,
  pub delimiter: char,
  pub selectable: bool,
  pub has_inferiors: bool,
  /// True once this entry is known to correspond to a real mailbox
  /// (as opposed to a pure hierarchy node with `\Noselect`).
  pub has_mailbox: bool,
  pub has_new_mail: bool,
  pub msg_count: u64,
  pub msg_unread: u64,
}

/// A folder listing in progress: grows one [`browse`] call at a time as
/// the host descends the hierarchy, per §3.
#[derive(Debug, Default)]
pub struct BrowserState {
  pub entries: Vec<FolderEntry>,
}

fn submit_with_sink<RW>(account: &mut Account<RW>, command: &str, sink: Sink) -> Result<Sink>
where
  RW: io::Read + io::Write,
{
  let mut sink = sink;
  let tag = account.connection.queue.tag();
  let line = format!("{tag} {command}\r\n");
  account.connection.queue.submit(&mut account.connection.stream, tag.clone(), line.as_bytes(), Flag::Single)?;
  loop {
    match account.connection.stream.read_parsed()? {
      OwnedLine::Untagged(untagged) => match response::dispatch(account.selected_state_mut(), Some(&mut sink), untagged) {
        response::DispatchSignal::Normal => {}
        response::DispatchSignal::Bye => {
          account.connection.state = State::Disconnected;
          return Err(Error::fatal("server sent BYE"));
        }
        response::DispatchSignal::Inconsistent(reason) => {
          account.connection.state = State::Disconnected;
          return Err(Error::fatal(reason));
        }
      },
      OwnedLine::Tagged { tag: t, ok, code } if t == tag => {
        account.connection.queue.resolve(&t)?;
        return if ok {
          Ok(sink)
        } else {
          Err(Error::protocol(code.map(|c| format!("{c:?}")), format!("{command} rejected")))
        };
      }
      OwnedLine::Tagged { .. } | OwnedLine::Continuation => (),
    }
  }
}

fn entry_name(mailbox: &OwnedMailbox) -> &str {
  match mailbox {
    OwnedMailbox::Inbox => "INBOX",
    OwnedMailbox::Other(name) => name,
  }
}

/// Shell-style `*`/`?` glob match against a single path segment, used to
/// apply the host's filename mask (§4.9 step 4).
fn glob_match(pattern: &str, text: &str) -> bool {
  fn go(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
      (None, None) => true,
      (Some(b'*'), _) => go(&pattern[1..], text) || (!text.is_empty() && go(pattern, &text[1..])),
      (Some(b'?'), Some(_)) => go(&pattern[1..], &text[1..]),
      (Some(p), Some(t)) if p == t => go(&pattern[1..], &text[1..]),
      _ => false,
    }
  }
  go(pattern.as_bytes(), text.as_bytes())
}

/// Populates a folder view at `path` (server form, `""` for the root),
/// per §4.9. `mask` filters entries by their final path segment; `None`
/// matches everything. `subscribed_only` selects `LSUB`-backed listing
/// (or, where `LIST-EXTENDED` is advertised, `LIST (SUBSCRIBED
/// RECURSIVEMATCH)`, which correctly returns `LIST` responses carrying
/// `\Subscribed` rather than bare `LSUB` ones).
pub fn browse<RW>(account: &mut Account<RW>, path: &str, mask: Option<&str>, subscribed_only: bool) -> Result<BrowserState>
where
  RW: io::Read + io::Write,
{
  let codec = account.codec();
  let has_list_extended = account.connection.has_capability("LIST-EXTENDED");
  let mut delimiter = account.connection.delimiter;

  // Step 1: probe the path itself rather than trusting a server-echoed
  // "folder + delimiter" name, which UW-IMAP and Cyrus disagree on.
  let prefix = if path.is_empty() {
    String::new()
  } else {
    let wire_path = codec.encode(path);
    let probe = if has_list_extended {
      format!("LIST \"\" {} RETURN (CHILDREN)", String::from_utf8_lossy(&quote(wire_path.as_bytes())))
    } else {
      format!("LIST \"\" {}", String::from_utf8_lossy(&quote(wire_path.as_bytes())))
    };
    let sink = submit_with_sink(account, &probe, Sink::List(Vec::new()))?;
    if let Sink::List(entries) = sink {
      if let Some(entry) = entries.first() {
        if let Some(d) = entry.delimiter {
          delimiter = d as char;
        }
      }
    }
    format!("{path}{delimiter}")
  };

  let mut state = BrowserState::default();

  // Step 2: the non-selectable parent entry.
  if !path.is_empty() {
    state.entries.push(FolderEntry {
      name: "..".to_owned(),
      desc: crate::path::parent(path, delimiter).unwrap_or_default(),
      delimiter,
      selectable: false,
      has_inferiors: true,
      has_mailbox: false,
      has_new_mail: false,
      msg_count: 0,
      msg_unread: 0,
    });
  }

  // Step 3: one-level listing under `prefix`.
  let pattern = format!("{}%", codec.encode(&prefix));
  let quoted = String::from_utf8_lossy(&quote(pattern.as_bytes())).into_owned();
  let (command, extended_subscribed) = match (subscribed_only, has_list_extended) {
    (true, true) => (format!("LIST (SUBSCRIBED RECURSIVEMATCH) \"\" {quoted}"), true),
    (true, false) => (format!("LSUB \"\" {quoted}"), false),
    (false, _) => (format!("LIST \"\" {quoted}"), false),
  };
  let sink_template = if subscribed_only && !extended_subscribed { Sink::Lsub(Vec::new()) } else { Sink::List(Vec::new()) };
  let sink = submit_with_sink(account, &command, sink_template)?;
  let raw_entries = match sink {
    Sink::List(entries) | Sink::Lsub(entries) => entries,
    _ => unreachable!("browse always submits a List/Lsub sink"),
  };

  for raw in raw_entries {
    let name = match codec.decode(entry_name(&raw.mailbox).as_bytes()) {
      Some(name) => name,
      None => continue,
    };
    let basename = name.rsplit(delimiter).next().unwrap_or(&name);
    if let Some(mask) = mask {
      if !glob_match(mask, basename) {
        continue;
      }
    }
    let display = name.strip_prefix(&prefix).unwrap_or(&name).to_owned();
    let no_select = raw.flags.iter().any(|f| f.eq_ignore_ascii_case("\\Noselect"));
    let no_inferiors = raw.flags.iter().any(|f| f.eq_ignore_ascii_case("\\Noinferiors"));
    let has_no_children = raw.flags.iter().any(|f| f.eq_ignore_ascii_case("\\HasNoChildren"));
    let known = account.mailbox(&name).and_then(|m| m.state.as_ref());
    state.entries.push(FolderEntry {
      name: display,
      desc: name,
      delimiter,
      selectable: !no_select,
      has_inferiors: !no_inferiors && !has_no_children,
      has_mailbox: !no_select,
      has_new_mail: known.map(|s| s.new_mail_count > 0).unwrap_or(false),
      msg_count: known.map(|s| s.len() as u64).unwrap_or(0),
      msg_unread: known.map(|s| s.unseen).unwrap_or(0),
    });
  }

  Ok(state)
}

/// `SUBSCRIBE`/`UNSUBSCRIBE`.
pub fn subscribe<RW>(account: &mut Account<RW>, path: &str, on: bool) -> Result<()>
where
  RW: io::Read + io::Write,
{
  let wire = account.codec().encode(path);
  let verb = if on { "SUBSCRIBE" } else { "UNSUBSCRIBE" };
  account.connection.exec_simple(&format!("{verb} {}", String::from_utf8_lossy(&quote(wire.as_bytes()))))?;
  Ok(())
}

/// `CREATE`.
pub fn create<RW>(account: &mut Account<RW>, path: &str) -> Result<()>
where
  RW: io::Read + io::Write,
{
  let wire = account.codec().encode(path);
  account.connection.exec_simple(&format!("CREATE {}", String::from_utf8_lossy(&quote(wire.as_bytes()))))?;
  Ok(())
}

/// `DELETE`.
pub fn delete<RW>(account: &mut Account<RW>, path: &str) -> Result<()>
where
  RW: io::Read + io::Write,
{
  let wire = account.codec().encode(path);
  account.connection.exec_simple(&format!("DELETE {}", String::from_utf8_lossy(&quote(wire.as_bytes()))))?;
  Ok(())
}

/// `RENAME`.
pub fn rename<RW>(account: &mut Account<RW>, from: &str, to: &str) -> Result<()>
where
  RW: io::Read + io::Write,
{
  let codec = account.codec();
  let wire_from = codec.encode(from);
  let wire_to = codec.encode(to);
  account.connection.exec_simple(&format!(
    "RENAME {} {}",
    String::from_utf8_lossy(&quote(wire_from.as_bytes())),
    String::from_utf8_lossy(&quote(wire_to.as_bytes()))
  ))?;
  Ok(())
}

/// A `STATUS` result (§4.9, RFC 3501 §6.3.10): the counters a browser
/// wants to paint next to an unselected mailbox without paying for a
/// full `SELECT`/`EXAMINE`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStatus {
  pub messages: u64,
  pub recent: u64,
  pub uidnext: u64,
  pub uidvalidity: u64,
  pub unseen: u64,
}

/// `STATUS`: queries the four standard counters for `path` without
/// selecting it, the way a browser refreshes unread counts for mailboxes
/// it isn't currently showing.
pub fn status<RW>(account: &mut Account<RW>, path: &str) -> Result<MailboxStatus>
where
  RW: io::Read + io::Write,
{
  let wire = account.codec().encode(path);
  let command = format!(
    "STATUS {} (MESSAGES RECENT UIDNEXT UIDVALIDITY UNSEEN)",
    String::from_utf8_lossy(&quote(wire.as_bytes()))
  );
  let sink = submit_with_sink(account, &command, Sink::Status(None))?;
  let attrs = match sink {
    Sink::Status(Some((_, attrs))) => attrs,
    Sink::Status(None) => return Err(Error::protocol(None, "STATUS completed without an untagged STATUS response")),
    _ => unreachable!("status always submits a Status sink"),
  };
  let mut result = MailboxStatus::default();
  for (name, value) in attrs {
    match name.to_ascii_uppercase().as_str() {
      "MESSAGES" => result.messages = value,
      "RECENT" => result.recent = value,
      "UIDNEXT" => result.uidnext = value,
      "UIDVALIDITY" => result.uidvalidity = value,
      "UNSEEN" => result.unseen = value,
      _ => (),
    }
  }
  Ok(result)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::account::AccountId;
  use crate::connection::{Connection, TestDuplex};
  use crate::wire::Stream;

  fn account(input: &[u8]) -> Account<TestDuplex> {
    let mut connection = Connection::new(Stream::new(TestDuplex::new(input)), true, true);
    connection.state = State::Authenticated;
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

  #[test]
  fn browse_root_lists_one_level_and_skips_parent_entry() {
    let mut acc = account(
      b"* LIST (\\HasNoChildren) \"/\" INBOX\r\n\
        * LIST (\\HasChildren) \"/\" Sent\r\n\
        a0000 OK LIST completed\r\n",
    );
    let state = browse(&mut acc, "", None, false).unwrap();
    assert_eq!(state.entries.len(), 2);
    assert!(state.entries.iter().all(|e| e.name != ".."));
    let inbox = state.entries.iter().find(|e| e.desc == "INBOX").unwrap();
    assert!(inbox.selectable);
    assert!(!inbox.has_inferiors);
    let sent = state.entries.iter().find(|e| e.desc == "Sent").unwrap();
    assert!(sent.has_inferiors);
    let sent_command = String::from_utf8_lossy(&acc.connection.stream.get_ref().written).into_owned();
    assert!(sent_command.contains("LIST \"\" \"%\""), "got {sent_command:?}");
  }

  #[test]
  fn browse_nested_path_probes_then_lists_and_adds_parent() {
    let mut acc = account(
      b"* LIST (\\HasChildren) \"/\" Sent\r\n\
        a0000 OK LIST completed\r\n\
        * LIST (\\HasNoChildren) \"/\" Sent/2024\r\n\
        a0001 OK LIST completed\r\n",
    );
    let state = browse(&mut acc, "Sent", None, false).unwrap();
    assert_eq!(state.entries[0].name, "..");
    assert!(!state.entries[0].selectable);
    let child = state.entries.iter().find(|e| e.desc == "Sent/2024").unwrap();
    assert_eq!(child.name, "2024");
  }

  #[test]
  fn mask_filters_by_basename() {
    let mut acc = account(
      b"* LIST (\\HasNoChildren) \"/\" Drafts\r\n\
        * LIST (\\HasNoChildren) \"/\" Sent\r\n\
        a0000 OK LIST completed\r\n",
    );
    let state = browse(&mut acc, "", Some("S*"), false).unwrap();
    assert_eq!(state.entries.len(), 1);
    assert_eq!(state.entries[0].desc, "Sent");
  }

  #[test]
  fn status_collects_the_requested_counters() {
    let mut acc = account(
      b"* STATUS Sent (MESSAGES 12 RECENT 2 UIDNEXT 45 UIDVALIDITY 7 UNSEEN 3)\r\n\
        a0000 OK STATUS completed\r\n",
    );
    let status = status(&mut acc, "Sent").unwrap();
    assert_eq!(status, MailboxStatus { messages: 12, recent: 2, uidnext: 45, uidvalidity: 7, unseen: 3 });
  }

  #[test]
  fn status_without_a_matching_untagged_response_is_a_protocol_error() {
    let mut acc = account(b"a0000 OK STATUS completed\r\n");
    let error = status(&mut acc, "Sent").unwrap_err();
    assert!(matches!(error.kind(), crate::error::Kind::Protocol { .. }));
  }
}
