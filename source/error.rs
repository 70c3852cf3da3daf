//! Value-level error classification.
//!
//! IMAP failures are not exceptional by type (a `NO` on a `STORE` is a
//! different *situation* than a dead socket, not a different Rust type) so a
//! single [`Error`] carries a [`Kind`] discriminant a caller can match on.
//! `Display`/`source()` boilerplate comes from `thiserror`; the source chain
//! itself is a boxed `std::error::Error` rather than `anyhow::Error` so the
//! derive's `#[source]` can see through it.

use std::io;

/// What went wrong, at the granularity callers actually need to branch on.
#[derive(Debug)]
pub enum Kind {
  /// The connection is no longer usable; it has been (or must be)
  /// transitioned to `Disconnected`.
  Fatal,
  /// A tagged `NO`/`BAD` completion. The bracketed response code, if any
  /// (e.g. `READ-ONLY`, `CANNOT`), is carried for callers that care.
  Protocol { qualifier: Option<String> },
  /// A `NO`/`BAD` the caller has a specific, named recovery path for.
  RejectedExpected(Rejection),
  /// Failed locally (codec, buffer, compile error) without touching the
  /// wire or the connection state.
  Local,
  /// Abandoned due to an external cancellation signal.
  Cancelled,
}

/// Rejections with a prescribed client-side recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
  /// `[TRYCREATE]` on a COPY/MOVE/APPEND: offer to create the destination
  /// mailbox and retry once.
  TryCreate,
}

/// The crate's single error type.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct Error {
  kind: Kind,
  message: String,
  #[source]
  source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
  pub fn new(kind: Kind, message: impl Into<String>) -> Self {
    Self { kind, message: message.into(), source: None }
  }

  pub fn with_source(mut self, source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
    self.source = Some(source.into());
    self
  }

  pub fn fatal(message: impl Into<String>) -> Self {
    Self::new(Kind::Fatal, message)
  }

  pub fn protocol(qualifier: Option<String>, message: impl Into<String>) -> Self {
    Self::new(Kind::Protocol { qualifier }, message)
  }

  pub fn rejected(rejection: Rejection, message: impl Into<String>) -> Self {
    Self::new(Kind::RejectedExpected(rejection), message)
  }

  pub fn local(message: impl Into<String>) -> Self {
    Self::new(Kind::Local, message)
  }

  pub fn cancelled() -> Self {
    Self::new(Kind::Cancelled, "operation cancelled")
  }

  pub fn kind(&self) -> &Kind {
    &self.kind
  }

  /// Convenience: is this an error the sync engine/caller should treat as
  /// connection-ending?
  pub fn is_fatal(&self) -> bool {
    matches!(self.kind, Kind::Fatal)
  }
}

impl From<io::Error> for Error {
  fn from(error: io::Error) -> Self {
    let message = error.to_string();
    Self::fatal(message).with_source(Box::new(error))
  }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn display_shows_the_message_not_the_kind() {
    let error = Error::protocol(Some("TRYCREATE".to_owned()), "COPY rejected");
    assert_eq!(error.to_string(), "COPY rejected");
  }

  #[test]
  fn io_error_is_fatal_and_carries_a_source() {
    let io_error = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
    let error: Error = io_error.into();
    assert!(error.is_fatal());
    assert!(std::error::Error::source(&error).is_some());
  }
}
