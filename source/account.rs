//! Account: the unique owner of one live [`Connection`] and every
//! [`Mailbox`] handle it has opened, breaking the natural
//! Connection↔Mailbox reference cycle by keeping the "currently
//! selected" relation as a name lookup rather than an owning pointer.

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::mailbox::{self, Mailbox, MailboxState};
use crate::tag::Flag;
use crate::wire::{MailboxCodec, OwnedRespCode, OwnedUntagged, Utf7Codec, Utf8Codec};
use std::io;

/// `(host, port, user, security)` identity, per §3.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountId {
  pub host: String,
  pub port: u16,
  pub user: String,
  pub security: crate::config::Security,
}

/// Owns the live connection and every mailbox handle opened against it.
/// `selected` names the mailbox SELECTED/EXAMINEd on the connection, if
/// any — a lookup key, not an owning reference, so dropping a `Mailbox`
/// never has to coordinate with the `Connection` that pointed at it.
pub struct Account<RW> {
  pub id: AccountId,
  pub connection: Connection<RW>,
  mailboxes: Vec<Mailbox>,
  selected: Option<String>,
}

impl<RW> Account<RW>
where
  RW: io::Read + io::Write,
{
  pub fn new(id: AccountId, connection: Connection<RW>) -> Self {
    Self { id, connection, mailboxes: Vec::new(), selected: None }
  }

  pub fn mailboxes(&self) -> &[Mailbox] {
    &self.mailboxes
  }

  pub fn mailbox(&self, name: &str) -> Option<&Mailbox> {
    self.mailboxes.iter().find(|m| m.name == name)
  }

  /// The mailbox currently SELECTED/EXAMINEd on the connection, if any.
  pub fn selected(&self) -> Option<&Mailbox> {
    self.selected.as_deref().and_then(|name| self.mailbox(name))
  }

  pub fn selected_state_mut(&mut self) -> Option<&mut MailboxState> {
    let name = self.selected.clone()?;
    self.mailboxes.iter_mut().find(|m| m.name == name)?.state.as_mut()
  }

  pub(crate) fn codec(&self) -> Box<dyn MailboxCodec> {
    if self.connection.utf8_enabled {
      Box::new(Utf8Codec)
    } else {
      Box::new(Utf7Codec)
    }
  }

  /// `SELECT`/`EXAMINE`, per §4.5. Pipelines a trailing `MYRIGHTS` probe
  /// when the server advertises ACL, so the round-trip doubles as a
  /// rights check.
  pub fn select(&mut self, name: &str, read_only: bool) -> Result<()> {
    let codec = self.codec();
    let wire_name = codec.encode(name);
    let verb = if read_only { "EXAMINE" } else { "SELECT" };
    let command = format!("{verb} {}", String::from_utf8_lossy(&crate::wire::quote(wire_name.as_bytes())));
    let has_acl = self.connection.has_capability("ACL");
    let tag = self.connection.queue.tag();
    let mut line = format!("{tag} {command}");
    let myrights_tag = if has_acl {
      let myrights_tag = self.connection.queue.tag();
      line += &format!("\r\n{myrights_tag} MYRIGHTS {}", String::from_utf8_lossy(&crate::wire::quote(wire_name.as_bytes())));
      Some(myrights_tag)
    } else {
      None
    };
    line += "\r\n";
    // Two tags travel on this one write, so the queue needs a slot for
    // each: a single `submit` would only track the first, and the loop
    // below would return as soon as that one resolved, leaving the still
    // outstanding MYRIGHTS completion unread on the wire for the next
    // command to trip over.
    self.connection.queue.submit(&mut self.connection.stream, tag.clone(), line.as_bytes(), Flag::Queue)?;
    if let Some(myrights_tag) = &myrights_tag {
      self.connection.queue.submit(&mut self.connection.stream, myrights_tag.clone(), &[], Flag::Single)?;
    } else {
      self.connection.queue.flush(&mut self.connection.stream)?;
    }

    let mut state = MailboxState::default();
    state.read_only = read_only;
    let mut acl_seen = false;
    let mut select_done = false;
    let mut myrights_done = myrights_tag.is_none();
    loop {
      match self.connection.stream.read_parsed()? {
        crate::wire::OwnedLine::Untagged(OwnedUntagged::Flags(flags)) => state.permanent_flags = flags,
        crate::wire::OwnedLine::Untagged(OwnedUntagged::Exists(n)) => {
          state.new_mail_count = n;
          while (state.len() as u64) < n {
            state.push(0);
          }
        }
        crate::wire::OwnedLine::Untagged(OwnedUntagged::Recent(n)) => state.recent = n,
        crate::wire::OwnedLine::Untagged(OwnedUntagged::MyRights { rights, .. }) => {
          state.rights = mailbox::Rights::parse(rights.as_bytes());
          acl_seen = true;
        }
        crate::wire::OwnedLine::Untagged(OwnedUntagged::Ok(Some(code))) => match code {
          OwnedRespCode::UidValidity(n) => state.uidvalidity = n,
          OwnedRespCode::UidNext(n) => state.uidnext = n,
          OwnedRespCode::Unseen(n) => state.unseen = n,
          OwnedRespCode::HighestModSeq(n) => state.modseq = n,
          OwnedRespCode::ReadOnly => state.read_only = true,
          OwnedRespCode::ReadWrite => state.read_only = false,
          OwnedRespCode::PermanentFlags(flags) => state.permanent_flags = flags,
          _ => (),
        },
        crate::wire::OwnedLine::Untagged(_) => (),
        crate::wire::OwnedLine::Tagged { tag: t, .. } if Some(&t) == myrights_tag.as_ref() => {
          self.connection.queue.resolve(&t)?;
          myrights_done = true;
          if select_done {
            break;
          }
        }
        crate::wire::OwnedLine::Tagged { tag: t, ok, code } if t == tag => {
          self.connection.queue.resolve(&t)?;
          if !ok {
            return Err(Error::protocol(code.map(|c| format!("{c:?}")), format!("{verb} rejected")));
          }
          select_done = true;
          if myrights_done {
            break;
          }
        }
        _ => (),
      }
    }
    if !has_acl || !acl_seen {
      // No ACL support, or the server rejected MYRIGHTS: assume full
      // rights, per §4.5, unless SELECT itself marked the mailbox
      // read-only.
      state.rights = mailbox::Rights::ALL;
    }

    let path: Vec<String> = if name.eq_ignore_ascii_case("INBOX") {
      vec!["INBOX".to_owned()]
    } else {
      name.split(self.connection.delimiter).map(str::to_owned).collect()
    };
    let mut mailbox = mailbox::Mailbox::new(path, self.connection.delimiter);
    mailbox.state = Some(state);
    self.mailboxes.retain(|m| m.name != mailbox.name);
    self.mailboxes.push(mailbox);
    self.selected = Some(name.to_owned());
    self.connection.state = crate::connection::State::Selected;
    Ok(())
  }

  /// Test-only seam: installs `state` as the selected mailbox's state
  /// without a real `SELECT` round trip, so sync-engine tests can script
  /// just the `STORE`/`EXPUNGE` traffic they care about.
  #[cfg(test)]
  pub(crate) fn inject_selected_state(&mut self, name: &str, state: MailboxState) {
    let mut mailbox = mailbox::Mailbox::new(vec![name.to_owned()], self.connection.delimiter);
    mailbox.state = Some(state);
    self.mailboxes.retain(|m| m.name != mailbox.name);
    self.selected = Some(mailbox.name.clone());
    self.mailboxes.push(mailbox);
    self.connection.state = crate::connection::State::Selected;
  }

  /// `CLOSE`: deselects without expunging, dropping the mailbox's state.
  pub fn close(&mut self) -> Result<()> {
    self.connection.exec_simple("CLOSE")?;
    if let Some(name) = self.selected.take() {
      if let Some(mailbox) = self.mailboxes.iter_mut().find(|m| m.name == name) {
        mailbox.state = None;
      }
    }
    self.connection.state = crate::connection::State::Authenticated;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connection::{Connection, TestDuplex};
  use crate::wire::Stream;

  fn account(input: &[u8]) -> Account<TestDuplex> {
    let mut connection = Connection::new(Stream::new(TestDuplex::new(input)), true, true);
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

  #[test]
  fn select_populates_mailbox_state_and_selects_it() {
    let mut acc = account(
      b"* FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)\r\n\
        * 3 EXISTS\r\n\
        * 0 RECENT\r\n\
        * OK [UIDVALIDITY 1234] UIDs valid\r\n\
        * OK [UIDNEXT 50] Predicted next UID\r\n\
        a0000 OK [READ-WRITE] SELECT completed\r\n",
    );
    acc.select("INBOX", false).unwrap();
    let mailbox = acc.selected().unwrap();
    assert_eq!(mailbox.name, "INBOX");
    let state = mailbox.state.as_ref().unwrap();
    assert_eq!(state.len(), 3);
    assert_eq!(state.uidvalidity, 1234);
    assert_eq!(state.uidnext, 50);
    assert_eq!(acc.connection.state, crate::connection::State::Selected);
  }

  #[test]
  fn select_pipelines_myrights_probe_and_drains_both_tagged_completions() {
    let mut acc = account(
      b"* FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)\r\n\
        * 3 EXISTS\r\n\
        * 0 RECENT\r\n\
        a0000 OK [READ-WRITE] SELECT completed\r\n\
        * MYRIGHTS \"INBOX\" lrswi\r\n\
        a0001 OK MYRIGHTS completed\r\n\
        a0002 OK NOOP completed\r\n",
    );
    acc.connection.capabilities.insert("ACL".to_owned());
    acc.select("INBOX", false).unwrap();
    let state = acc.selected().unwrap().state.as_ref().unwrap();
    assert_eq!(state.rights, mailbox::Rights::parse(b"lrswi"));
    // If the MYRIGHTS completion had been left unread, this NOOP would
    // desync against the leftover `a0001` line instead of resolving `a0002`.
    acc.connection.exec_simple("NOOP").unwrap();
  }
}
