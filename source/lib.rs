// https://www.rfc-editor.org/rfc/rfc3501 - IMAP4rev1
// https://www.rfc-editor.org/rfc/rfc2086 - IMAP4 ACL extension
// https://www.rfc-editor.org/rfc/rfc4315 - UIDPLUS extension
// https://www.rfc-editor.org/rfc/rfc4551 - CONDSTORE extension
// https://www.rfc-editor.org/rfc/rfc5258 - LIST-EXTENDED extension
// https://www.rfc-editor.org/rfc/rfc7162 - Quick Mailbox Resynchronization (QRESYNC)

#![allow(clippy::upper_case_acronyms)]

//! The core of an IMAP4rev1 client library: the protocol engine that
//! turns a byte-level connection into a stateful mailbox interface, the
//! mailbox model it mutates, and the hierarchy browser built on top.
//!
//! Everything outside that core — the on-disk body/header cache, the
//! mail user agent, the RC-file config language, SASL/GSSAPI mechanisms
//! beyond `AUTHENTICATE PLAIN` — is an external collaborator the engine
//! consumes through a narrow trait, not something this crate implements.

pub mod account;
pub mod browser;
pub mod check;
pub mod config;
pub mod connection;
pub mod error;
pub mod mailbox;
pub mod messageset;
pub mod path;
pub mod response;
pub mod search;
pub mod sync;
pub mod tag;
pub mod wire;

pub use account::{Account, AccountId};
pub use check::CheckResult;
pub use config::{AccountConfig, ConnectArgs, Security};
pub use connection::{Authenticate, Connection, PlainAuth, Socket, StartTlsSocket, State, TcpSocket, Tls, TlsSocket};
pub use error::{Error, Kind, Result};
pub use mailbox::{Mailbox, MailboxState, Message, Rights};
pub use path::{MailboxUrl, UrlError};
pub use search::{Pattern, SearchError};
