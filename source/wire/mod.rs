//! Byte stream ↔ IMAP tokens: CRLF-line framing with literal-length
//! detection, quoting, and the mUTF-7/UTF-8 mailbox-name codec.

pub mod codec;
pub mod grammar;

use crate::error::{Error, Result};
use std::io;

pub use codec::{plain, MailboxCodec, Utf7Codec, Utf8Codec};
pub use grammar::{parser, Line, MsgAtt, RespCode, Untagged};

fn escape(bytes: &[u8]) -> String {
  let mut string = String::new();
  for byte in bytes {
    string += &std::ascii::escape_default(*byte).to_string();
  }
  string
}

fn summarize(bytes: &[u8]) -> String {
  let stop = bytes.windows(2).position(|window| window == b"\r\n").unwrap_or(bytes.len());
  let stop = std::cmp::min(stop + 2, bytes.len());
  let mut string = escape(&bytes[..stop]);
  if stop < bytes.len() {
    string += "...omitted...";
  }
  string
}

/// Detects a trailing literal marker `{N}` on a line that has already had
/// its terminating CRLF stripped. Returns the byte count of the literal
/// body that follows.
fn literal_len(line_sans_crlf: &[u8]) -> Option<usize> {
  if line_sans_crlf.last() != Some(&b'}') {
    return None;
  }
  let open = line_sans_crlf.iter().rposition(|&b| b == b'{')?;
  let digits = &line_sans_crlf[open + 1..line_sans_crlf.len() - 1];
  if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
    return None;
  }
  std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Quote (or, if necessary, literal-encode) a mailbox or other wire string.
/// Returns the bytes to place on the wire, already delimited.
pub fn quote(bytes: &[u8]) -> Vec<u8> {
  let needs_literal = bytes.iter().any(|b| matches!(b, b'\0'..=b'\x1f' | b'\x7f'));
  if needs_literal {
    let mut out = format!("{{{}}}\r\n", bytes.len()).into_bytes();
    out.extend_from_slice(bytes);
    out
  } else {
    let mut out = Vec::with_capacity(bytes.len() + 2);
    out.push(b'"');
    for &b in bytes {
      if b == b'"' || b == b'\\' {
        out.push(b'\\');
      }
      out.push(b);
    }
    out.push(b'"');
    out
  }
}

/// A buffered duplex stream speaking the IMAP4rev1 wire format.
#[derive(Debug)]
pub struct Stream<RW> {
  rw: RW,
  buffer: Vec<u8>,
  end: usize,
}

impl<RW> Stream<RW>
where
  RW: io::Read + io::Write,
{
  pub fn new(rw: RW) -> Self {
    Self { rw, buffer: Vec::new(), end: 0 }
  }

  pub fn get_ref(&self) -> &RW {
    &self.rw
  }

  pub fn into_inner(self) -> RW {
    self.rw
  }

  /// Sends raw bytes. `loggable` is the prefix length that is safe to log
  /// verbatim (commands submitted with the password flag pass 0 here so
  /// credentials never reach the log).
  pub fn write_command(&mut self, bytes: &[u8], loggable: usize) -> Result<()> {
    if log::log_enabled!(log::Level::Debug) && loggable > 0 {
      log::debug!("> {}{}", escape(&bytes[..loggable]), if loggable < bytes.len() { "...omitted..." } else { "" });
    } else {
      log::debug!("> ...omitted...");
    }
    // https://www.rfc-editor.org/rfc/rfc7162#section-4
    // a client should limit command lines to approximately 8192 octets
    // (including all quoted strings but not including literals).
    self.rw.write_all(bytes)?;
    Ok(())
  }

  fn fill(&mut self) -> Result<()> {
    let mut chunk = [0u8; 8192];
    let n = self.rw.read(&mut chunk)?;
    if n == 0 {
      return Err(Error::fatal("end of stream"));
    }
    self.buffer.extend_from_slice(&chunk[..n]);
    Ok(())
  }

  /// Ensures `self.buffer[self.end..]` holds one complete logical response
  /// line, including any embedded literal bodies, reading from the socket
  /// as needed. Returns the byte length of that line (CRLF included).
  fn ensure_line(&mut self) -> Result<usize> {
    let mut scan_from = 0usize;
    loop {
      if self.buffer.len() - self.end <= scan_from {
        self.fill()?;
        continue;
      }
      let found = self.buffer[self.end + scan_from..].windows(2).position(|w| w == b"\r\n");
      match found {
        None => self.fill()?,
        Some(rel) => {
          let crlf_at = scan_from + rel;
          let line_sans_crlf = &self.buffer[self.end..self.end + crlf_at];
          match literal_len(line_sans_crlf) {
            None => return Ok(crlf_at + 2),
            Some(n) => {
              let need = self.end + crlf_at + 2 + n;
              while self.buffer.len() < need {
                self.fill()?;
              }
              scan_from = crlf_at + 2 + n;
            }
          }
        }
      }
    }
  }

  /// Reads one complete server line (resolving embedded literals) and
  /// returns it, advancing past it. The returned buffer owns its bytes so
  /// callers can parse it without holding a borrow of `self`.
  pub fn read_line(&mut self) -> Result<Vec<u8>> {
    let len = self.ensure_line()?;
    let line = self.buffer[self.end..self.end + len].to_vec();
    log::debug!("< {}", summarize(&line));
    self.end += len;
    if self.end > 64 * 1024 {
      self.buffer.copy_within(self.end.., 0);
      self.buffer.truncate(self.buffer.len() - self.end);
      self.end = 0;
    }
    Ok(line)
  }

  /// Reads one line and parses it via the grammar entry point, surfacing
  /// parse failures as local errors (never fatal: a line that fails to
  /// parse does not necessarily mean the connection is unusable).
  pub fn read_parsed(&mut self) -> Result<OwnedLine> {
    let line = self.read_line()?;
    match parser::line(&line) {
      Ok(parsed) => Ok(OwnedLine::from_borrowed(&parsed)),
      Err(error) => {
        log::trace!("parse failure: {error:?} on {}", summarize(&line));
        Err(Error::local(format!("couldn't parse server line: {}", summarize(&line))))
      }
    }
  }
}

/// An owned copy of [`Line`], detached from the buffer it was parsed out
/// of, so dispatch can outlive the next `read_line` call.
#[derive(Debug, PartialEq)]
pub enum OwnedLine {
  Untagged(OwnedUntagged),
  Tagged { tag: String, ok: bool, code: Option<OwnedRespCode> },
  Continuation,
}

#[derive(Debug, PartialEq)]
pub enum OwnedRespCode {
  Alert,
  Parse,
  TryCreate,
  ReadOnly,
  ReadWrite,
  NoModSeq,
  Capability(Vec<String>),
  PermanentFlags(Vec<String>),
  UidNext(u64),
  UidValidity(u64),
  Unseen(u64),
  HighestModSeq(u64),
  AppendUid { uidvalidity: u64, uid: u64 },
  CopyUid { uidvalidity: u64, from: Vec<(u64, u64)>, to: Vec<(u64, u64)> },
  Modified(Vec<(u64, u64)>),
  Other(String),
}

#[derive(Debug, PartialEq)]
pub enum OwnedMailbox {
  Inbox,
  Other(String),
}

#[derive(Debug, PartialEq)]
pub struct OwnedListEntry {
  pub flags: Vec<String>,
  pub delimiter: Option<u8>,
  pub mailbox: OwnedMailbox,
}

#[derive(Debug, PartialEq)]
pub enum OwnedMsgAtt {
  Uid(u64),
  Flags(Vec<String>),
  InternalDate(Vec<u8>),
  Rfc822Size(u64),
  ModSeq(u64),
  Body(Option<Vec<u8>>),
}

#[derive(Debug, PartialEq)]
pub enum OwnedUntagged {
  Capability(Vec<String>),
  Enabled(Vec<String>),
  Flags(Vec<String>),
  Exists(u64),
  Recent(u64),
  Expunge(u64),
  Fetch { msn: u64, attrs: Vec<OwnedMsgAtt> },
  List(OwnedListEntry),
  Lsub(OwnedListEntry),
  Search(Vec<u64>),
  Status { mailbox: OwnedMailbox, attrs: Vec<(String, u64)> },
  MyRights { mailbox: OwnedMailbox, rights: String },
  Vanished { earlier: bool, uids: Vec<(u64, u64)> },
  Bye(Option<OwnedRespCode>),
  Ok(Option<OwnedRespCode>),
  No(Option<OwnedRespCode>),
  Bad(Option<OwnedRespCode>),
  Preauth(Option<OwnedRespCode>),
  Other(String),
}

fn atoms(v: &[&[u8]]) -> Vec<String> {
  v.iter().map(|a| String::from_utf8_lossy(a).into_owned()).collect()
}

fn ranges(v: &[grammar::Range]) -> Vec<(u64, u64)> {
  v.iter().map(|r| (r.0, r.1)).collect()
}

fn mailbox(m: &grammar::MailboxName) -> OwnedMailbox {
  match m {
    grammar::MailboxName::Inbox => OwnedMailbox::Inbox,
    grammar::MailboxName::Other(name) => OwnedMailbox::Other(String::from_utf8_lossy(name).into_owned()),
  }
}

fn list_entry(l: &grammar::ListEntry) -> OwnedListEntry {
  OwnedListEntry { flags: atoms(&l.flags), delimiter: l.delimiter, mailbox: mailbox(&l.mailbox) }
}

fn resp_code(c: &Option<RespCode>) -> Option<OwnedRespCode> {
  c.as_ref().map(|c| match c {
    RespCode::Alert => OwnedRespCode::Alert,
    RespCode::Parse => OwnedRespCode::Parse,
    RespCode::TryCreate => OwnedRespCode::TryCreate,
    RespCode::ReadOnly => OwnedRespCode::ReadOnly,
    RespCode::ReadWrite => OwnedRespCode::ReadWrite,
    RespCode::NoModSeq => OwnedRespCode::NoModSeq,
    RespCode::Capability(cs) => OwnedRespCode::Capability(atoms(cs)),
    RespCode::PermanentFlags(fs) => OwnedRespCode::PermanentFlags(atoms(fs)),
    RespCode::UidNext(n) => OwnedRespCode::UidNext(*n),
    RespCode::UidValidity(n) => OwnedRespCode::UidValidity(*n),
    RespCode::Unseen(n) => OwnedRespCode::Unseen(*n),
    RespCode::HighestModSeq(n) => OwnedRespCode::HighestModSeq(*n),
    RespCode::AppendUid(a) => OwnedRespCode::AppendUid { uidvalidity: a.uidvalidity, uid: a.uid },
    RespCode::CopyUid(m) => {
      OwnedRespCode::CopyUid { uidvalidity: m.uidvalidity, from: ranges(&m.from), to: ranges(&m.to) }
    }
    RespCode::Modified(s) => OwnedRespCode::Modified(ranges(s)),
    RespCode::Other(a) => OwnedRespCode::Other(String::from_utf8_lossy(a).into_owned()),
  })
}

fn msg_att(a: &MsgAtt) -> OwnedMsgAtt {
  match a {
    MsgAtt::Uid(u) => OwnedMsgAtt::Uid(*u),
    MsgAtt::Flags(fs) => OwnedMsgAtt::Flags(atoms(fs)),
    MsgAtt::InternalDate(s) => OwnedMsgAtt::InternalDate(s.to_vec()),
    MsgAtt::Rfc822Size(n) => OwnedMsgAtt::Rfc822Size(*n),
    MsgAtt::ModSeq(n) => OwnedMsgAtt::ModSeq(*n),
    MsgAtt::Body(s) => OwnedMsgAtt::Body(s.as_ref().map(|s| s.to_vec())),
  }
}

impl OwnedLine {
  pub(crate) fn from_borrowed(line: &Line) -> Self {
    match line {
      Line::Continuation => OwnedLine::Continuation,
      Line::Tagged { tag, ok, code } => {
        OwnedLine::Tagged { tag: String::from_utf8_lossy(tag).into_owned(), ok: *ok, code: resp_code(code) }
      }
      Line::Untagged(u) => OwnedLine::Untagged(match u {
        Untagged::Capability(cs) => OwnedUntagged::Capability(atoms(cs)),
        Untagged::Enabled(cs) => OwnedUntagged::Enabled(atoms(cs)),
        Untagged::Flags(fs) => OwnedUntagged::Flags(atoms(fs)),
        Untagged::Exists(n) => OwnedUntagged::Exists(*n),
        Untagged::Recent(n) => OwnedUntagged::Recent(*n),
        Untagged::Expunge(n) => OwnedUntagged::Expunge(*n),
        Untagged::Fetch { msn, attrs } => {
          OwnedUntagged::Fetch { msn: *msn, attrs: attrs.iter().map(msg_att).collect() }
        }
        Untagged::List(l) => OwnedUntagged::List(list_entry(l)),
        Untagged::Lsub(l) => OwnedUntagged::Lsub(list_entry(l)),
        Untagged::Search(uids) => OwnedUntagged::Search(uids.clone()),
        Untagged::Status { mailbox: m, attrs } => OwnedUntagged::Status {
          mailbox: mailbox(m),
          attrs: attrs.iter().map(|a| (String::from_utf8_lossy(a.name).into_owned(), a.value)).collect(),
        },
        Untagged::MyRights { mailbox: m, rights } => {
          OwnedUntagged::MyRights { mailbox: mailbox(m), rights: String::from_utf8_lossy(rights).into_owned() }
        }
        Untagged::Vanished { earlier, uids } => OwnedUntagged::Vanished { earlier: *earlier, uids: ranges(uids) },
        Untagged::Bye(c) => OwnedUntagged::Bye(resp_code(c)),
        Untagged::Ok(c) => OwnedUntagged::Ok(resp_code(c)),
        Untagged::No(c) => OwnedUntagged::No(resp_code(c)),
        Untagged::Bad(c) => OwnedUntagged::Bad(resp_code(c)),
        Untagged::Preauth(c) => OwnedUntagged::Preauth(resp_code(c)),
        Untagged::Other(keyword) => OwnedUntagged::Other(String::from_utf8_lossy(keyword).into_owned()),
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  fn stream(input: &[u8]) -> Stream<Cursor<Vec<u8>>> {
    Stream::new(Cursor::new(input.to_vec()))
  }

  #[test]
  fn read_line_simple() {
    let mut s = stream(b"* 3 EXISTS\r\n* 1 RECENT\r\n");
    assert_eq!(s.read_line().unwrap(), b"* 3 EXISTS\r\n");
    assert_eq!(s.read_line().unwrap(), b"* 1 RECENT\r\n");
  }

  #[test]
  fn read_line_with_literal() {
    let mut s = stream(b"* 1 FETCH (UID 10 BODY[] {5}\r\nhi\r\n\n)\r\nnext\r\n");
    let line = s.read_line().unwrap();
    assert_eq!(line, b"* 1 FETCH (UID 10 BODY[] {5}\r\nhi\r\n\n)\r\n");
  }

  #[test]
  fn parsed_exists() {
    let mut s = stream(b"* 3 EXISTS\r\n");
    let parsed = s.read_parsed().unwrap();
    assert_eq!(parsed, OwnedLine::Untagged(OwnedUntagged::Exists(3)));
  }

  #[test]
  fn parsed_tagged_ok_with_code() {
    let mut s = stream(b"a0001 OK [READ-WRITE] SELECT completed\r\n");
    let parsed = s.read_parsed().unwrap();
    assert_eq!(
      parsed,
      OwnedLine::Tagged { tag: "a0001".to_owned(), ok: true, code: Some(OwnedRespCode::ReadWrite) }
    );
  }

  #[test]
  fn quote_plain_name() {
    assert_eq!(quote(b"INBOX"), b"\"INBOX\"");
    assert_eq!(quote(b"a\"b"), b"\"a\\\"b\"");
  }
}
