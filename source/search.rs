//! Search compiler (§4.10): translates a pattern tree into an IMAP
//! `SEARCH` expression. Only the full-text node kinds the tree can
//! express reach the wire — anything a caller wants evaluated against
//! local state (a flag, a tag) is a [`crate::messageset::Predicate`]
//! instead and never passes through here.

use crate::account::Account;
use crate::error::Error;
use crate::response::Sink;
use crate::tag::Flag;
use crate::wire::{quote, OwnedLine};
use std::io;

/// A search pattern tree. `WholeMsg` compiles to `TEXT`; `ServerSearch`
/// compiles to `X-GM-RAW` and requires `X-GM-EXT-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
  Header { name: String, value: String },
  Body(String),
  WholeMsg(String),
  ServerSearch(String),
  Not(Box<Pattern>),
  Or(Box<Pattern>, Box<Pattern>),
  And(Vec<Pattern>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SearchError {
  #[error("SERVERSEARCH requires X-GM-EXT-1, which this server does not advertise")]
  ServerSearchUnsupported,
}

impl From<SearchError> for Error {
  fn from(error: SearchError) -> Self {
    Error::local(error.to_string())
  }
}

fn quoted(s: &str) -> String {
  String::from_utf8_lossy(&quote(s.as_bytes())).into_owned()
}

/// Compiles one node to a single search-key: `NOT`/`OR` are already
/// atomic search-keys per the IMAP grammar, but an implicit-AND list is
/// only a single key when parenthesized, so [`compile_key`] wraps `And`
/// but not the others.
fn compile_key(pattern: &Pattern, has_x_gm_ext1: bool) -> Result<String, SearchError> {
  match pattern {
    Pattern::Header { name, value } => Ok(format!("HEADER {} {}", quoted(name), quoted(value))),
    Pattern::Body(text) => Ok(format!("BODY {}", quoted(text))),
    Pattern::WholeMsg(text) => Ok(format!("TEXT {}", quoted(text))),
    Pattern::ServerSearch(text) => {
      if !has_x_gm_ext1 {
        return Err(SearchError::ServerSearchUnsupported);
      }
      Ok(format!("X-GM-RAW {}", quoted(text)))
    }
    Pattern::Not(inner) => Ok(format!("NOT {}", compile_key(inner, has_x_gm_ext1)?)),
    Pattern::Or(a, b) => Ok(format!("OR {} {}", compile_key(a, has_x_gm_ext1)?, compile_key(b, has_x_gm_ext1)?)),
    Pattern::And(children) => {
      let parts: Result<Vec<String>, SearchError> = children.iter().map(|c| compile_key(c, has_x_gm_ext1)).collect();
      Ok(format!("({})", parts?.join(" ")))
    }
  }
}

/// Compiles `pattern` into the argument text of a `SEARCH`/`UID SEARCH`
/// command (everything after the verb), per §4.10. The top-level `And`
/// case is unwrapped so the root doesn't gain a redundant pair of
/// parens: IMAP's own search-key list is already an implicit AND.
pub fn compile(pattern: &Pattern, has_x_gm_ext1: bool) -> Result<String, SearchError> {
  match pattern {
    Pattern::And(children) => {
      let parts: Result<Vec<String>, SearchError> = children.iter().map(|c| compile_key(c, has_x_gm_ext1)).collect();
      Ok(parts?.join(" "))
    }
    other => compile_key(other, has_x_gm_ext1),
  }
}

/// Compiles and runs `pattern` as `UID SEARCH`, returning the matching
/// UIDs. UIDs, not MSNs, are requested since they are the durable
/// reference the rest of the engine keys state on (§3 glossary).
pub fn search<RW>(account: &mut Account<RW>, pattern: &Pattern) -> crate::error::Result<Vec<u64>>
where
  RW: io::Read + io::Write,
{
  let expr = compile(pattern, account.connection.has_capability("X-GM-EXT-1"))?;
  let command = format!("UID SEARCH {expr}");
  let tag = account.connection.queue.tag();
  let line = format!("{tag} {command}\r\n");
  account.connection.queue.submit(&mut account.connection.stream, tag.clone(), line.as_bytes(), Flag::Single)?;
  let mut sink = Sink::Search(Vec::new());
  loop {
    match account.connection.stream.read_parsed()? {
      OwnedLine::Untagged(untagged) => match crate::response::dispatch(account.selected_state_mut(), Some(&mut sink), untagged) {
        crate::response::DispatchSignal::Normal => {}
        crate::response::DispatchSignal::Bye => {
          account.connection.state = crate::connection::State::Disconnected;
          return Err(Error::fatal("server sent BYE"));
        }
        crate::response::DispatchSignal::Inconsistent(reason) => {
          account.connection.state = crate::connection::State::Disconnected;
          return Err(Error::fatal(reason));
        }
      },
      OwnedLine::Tagged { tag: t, ok, code } if t == tag => {
        account.connection.queue.resolve(&t)?;
        return if ok {
          match sink {
            Sink::Search(uids) => Ok(uids),
            _ => unreachable!("search always submits a Search sink"),
          }
        } else {
          Err(Error::protocol(code.map(|c| format!("{c:?}")), "SEARCH rejected"))
        };
      }
      OwnedLine::Tagged { .. } | OwnedLine::Continuation => (),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn header_and_body_join_with_implicit_and() {
    let pattern = Pattern::And(vec![
      Pattern::Header { name: "From".to_owned(), value: "alice@example.com".to_owned() },
      Pattern::Body("quarterly report".to_owned()),
    ]);
    let expr = compile(&pattern, false).unwrap();
    assert_eq!(expr, r#"HEADER "From" "alice@example.com" BODY "quarterly report""#);
  }

  #[test]
  fn or_wraps_each_side_as_a_single_key() {
    let pattern = Pattern::Or(Box::new(Pattern::Body("foo".to_owned())), Box::new(Pattern::WholeMsg("bar".to_owned())));
    assert_eq!(compile(&pattern, false).unwrap(), r#"OR BODY "foo" TEXT "bar""#);
  }

  #[test]
  fn not_prefixes_a_compound_and_with_parens() {
    let pattern = Pattern::Not(Box::new(Pattern::And(vec![
      Pattern::Body("foo".to_owned()),
      Pattern::WholeMsg("bar".to_owned()),
    ])));
    assert_eq!(compile(&pattern, false).unwrap(), r#"NOT (BODY "foo" TEXT "bar")"#);
  }

  #[test]
  fn server_search_without_capability_is_a_compile_error() {
    let pattern = Pattern::ServerSearch("is:important".to_owned());
    assert_eq!(compile(&pattern, false), Err(SearchError::ServerSearchUnsupported));
  }

  #[test]
  fn server_search_with_capability_emits_x_gm_raw() {
    let pattern = Pattern::ServerSearch("is:important".to_owned());
    assert_eq!(compile(&pattern, true).unwrap(), r#"X-GM-RAW "is:important""#);
  }
}
