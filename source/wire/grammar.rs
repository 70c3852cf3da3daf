// https://www.rfc-editor.org/rfc/rfc2234#section-2.3 - ABNF
// https://www.rfc-editor.org/rfc/rfc3501#section-9 - IMAP4rev1 formal syntax
// https://www.rfc-editor.org/rfc/rfc4315#section-4 - UIDPLUS
// https://www.rfc-editor.org/rfc/rfc4551#section-3 - CONDSTORE
// https://www.rfc-editor.org/rfc/rfc7162#section-7 - QRESYNC

use std::borrow;

/// Inclusive UID or sequence-number range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range(pub u64, pub u64);

#[derive(Debug, PartialEq)]
pub enum MailboxName<'input> {
  Inbox,
  Other(borrow::Cow<'input, [u8]>),
}

#[derive(Debug, PartialEq)]
pub struct ListEntry<'input> {
  pub flags: Vec<&'input [u8]>,
  pub delimiter: Option<u8>,
  pub mailbox: MailboxName<'input>,
}

#[derive(Debug, PartialEq)]
pub struct Append {
  pub uidvalidity: u64,
  pub uid: u64,
}

#[derive(Debug, PartialEq)]
pub struct Move {
  pub uidvalidity: u64,
  pub from: Vec<Range>,
  pub to: Vec<Range>,
}

#[derive(Debug, PartialEq)]
pub enum MsgAtt<'input> {
  Uid(u64),
  Flags(Vec<&'input [u8]>),
  InternalDate(borrow::Cow<'input, [u8]>),
  Rfc822Size(u64),
  ModSeq(u64),
  Body(Option<borrow::Cow<'input, [u8]>>),
}

#[derive(Debug, PartialEq)]
pub struct StatusAtt<'input> {
  pub name: &'input [u8],
  pub value: u64,
}

/// `resp-text-code`, generalized: the ones the engine needs structured,
/// with an `Other` catch-all for everything else (logged, not acted on).
#[derive(Debug, PartialEq)]
pub enum RespCode<'input> {
  Alert,
  Parse,
  TryCreate,
  ReadOnly,
  ReadWrite,
  NoModSeq,
  Capability(Vec<&'input [u8]>),
  PermanentFlags(Vec<&'input [u8]>),
  UidNext(u64),
  UidValidity(u64),
  Unseen(u64),
  HighestModSeq(u64),
  AppendUid(Append),
  CopyUid(Move),
  Modified(Vec<Range>),
  Other(&'input [u8]),
}

#[derive(Debug, PartialEq)]
pub enum Untagged<'input> {
  Capability(Vec<&'input [u8]>),
  Enabled(Vec<&'input [u8]>),
  Flags(Vec<&'input [u8]>),
  Exists(u64),
  Recent(u64),
  Expunge(u64),
  Fetch { msn: u64, attrs: Vec<MsgAtt<'input>> },
  List(ListEntry<'input>),
  Lsub(ListEntry<'input>),
  Search(Vec<u64>),
  Status { mailbox: MailboxName<'input>, attrs: Vec<StatusAtt<'input>> },
  MyRights { mailbox: MailboxName<'input>, rights: &'input [u8] },
  Vanished { earlier: bool, uids: Vec<Range> },
  Bye(Option<RespCode<'input>>),
  Ok(Option<RespCode<'input>>),
  No(Option<RespCode<'input>>),
  Bad(Option<RespCode<'input>>),
  /// `* PREAUTH ...`: the greeting indicates the connection is already
  /// authenticated by external means.
  Preauth(Option<RespCode<'input>>),
  /// Anything else: a client MUST be prepared to accept server data it did
  /// not specifically request (RFC 3501 §2.2.2). Carries the leading
  /// keyword only, for logging.
  Other(&'input [u8]),
}

#[derive(Debug, PartialEq)]
pub enum Line<'input> {
  Untagged(Untagged<'input>),
  Tagged { tag: &'input [u8], ok: bool, code: Option<RespCode<'input>> },
  Continuation,
}

fn parse_number(n: &[u8]) -> u64 {
  std::str::from_utf8(n).unwrap().parse().unwrap()
}

// The naive l:$(CHAR8()*<{n}>) in literal() would result in pushing every CHAR8() into the vector
// before discarding it because we reference it: https://github.com/kevinmehall/rust-peg/pull/292
// Instead, use an undocumented escape hatch to do a fast skip (CHAR8() excludes null bytes but it
// shouldn't really matter): https://github.com/kevinmehall/rust-peg/issues/284
trait ParserHacks {
  fn skip(&self, position: usize, n: usize) -> peg::RuleResult<()>;
}

impl ParserHacks for [u8] {
  fn skip(&self, position: usize, n: usize) -> peg::RuleResult<()> {
    if self.len() >= position + n {
      return peg::RuleResult::Matched(position + n, ());
    }
    peg::RuleResult::Failed
  }
}

peg::parser! {
  pub grammar parser() for [u8] {
    // CR = %x0D
    rule CR() = "\r"
    // LF = %x0A
    rule LF() = "\n"
    // CRLF = CR LF
    rule CRLF() = CR() LF()
    // CHAR = %x01-7F
    rule CHAR() -> u8 = [b'\x01'..=b'\x7f']
    // CHAR8 = %x01-ff
    rule CHAR8() = [b'\x01'..=b'\xff']
    // CTL = %x00-1F / %x7F
    rule CTL() = [b'\x00'..=b'\x1f'] / "\x7f"
    // DQUOTE = %x22
    rule DQUOTE() -> u8 = "\"" { b'"' }
    // SP refers to exactly one space.
    rule SP() = " "
    // TEXT-CHAR = <any CHAR except CR and LF>
    rule TEXT_CHAR() -> u8 = !(CR() / LF()) c:CHAR() { c }
    // DIGIT = %x30-39
    rule DIGIT() = [b'\x30'..=b'\x39']
    // digit-nz = %x31-39
    rule digit_nz() = [b'\x31'..=b'\x39']

    // number = 1*DIGIT
    rule number() -> u64 = n:$(DIGIT()+) { parse_number(n) }
    // nz-number = digit-nz *DIGIT
    rule nz_number() -> u64 = n:$(digit_nz() DIGIT()*) { parse_number(n) }
    // uniqueid = nz-number
    rule uniqueid() -> u64 = nz_number()
    // text = 1*TEXT-CHAR
    rule text() -> &'input [u8] = $(TEXT_CHAR()+)

    // nil = "NIL"
    rule nil() = "NIL"
    // list-wildcards = "%" / "*"
    rule list_wildcards() = "%" / "*"
    // quoted-specials = DQUOTE / "\"
    rule quoted_specials() -> u8 = c:(DQUOTE() / ("\\" { b'\\' })) { c }
    // QUOTED-CHAR = <any TEXT-CHAR except quoted-specials> / "\" quoted-specials
    rule QUOTED_CHAR() -> u8 = !quoted_specials() c:TEXT_CHAR() { c } / "\\" c:quoted_specials() { c }
    // resp-specials = "]"
    rule resp_specials() = "]"
    // atom-specials = "(" / ")" / "{" / SP / CTL / list-wildcards / quoted-specials / resp-specials
    rule atom_specials() = "(" / ")" / "{" / SP() / CTL() / list_wildcards() / quoted_specials() / resp_specials()
    // ATOM-CHAR = <any CHAR except atom-specials>
    rule ATOM_CHAR() = !atom_specials() CHAR()
    // atom = 1*ATOM-CHAR
    rule atom() = ATOM_CHAR()+
    // ASTRING-CHAR = ATOM-CHAR / resp-specials
    rule ASTRING_CHAR() = ATOM_CHAR() / resp_specials()
    // quoted = DQUOTE *QUOTED-CHAR DQUOTE
    rule quoted() -> Vec<u8> = DQUOTE() q:(QUOTED_CHAR()*) DQUOTE() { q }
    // literal = "{" number "}" CRLF *CHAR8
    rule literal() -> &'input [u8]
      = "{" n:number() "}" CRLF() position!() l:$(##skip(usize::try_from(n).unwrap()))
      { l }
    // string = quoted / literal
    rule string() -> borrow::Cow<'input, [u8]>
      = q:quoted() { borrow::Cow::Owned(q) } / l:literal() { borrow::Cow::Borrowed(l) }
    // astring = 1*ASTRING-CHAR / string
    rule astring() -> borrow::Cow<'input, [u8]>
      = s:$(ASTRING_CHAR()+) { borrow::Cow::Borrowed(s) } / s:string() { s }
    // nstring = string / nil
    rule nstring() -> Option<borrow::Cow<'input, [u8]>> = s:string() { Some(s) } / nil() { None }

    // tag = 1*<any ASTRING-CHAR except "+">
    rule tag() -> &'input [u8] = $((!"+" ASTRING_CHAR())+)

    // auth-type = atom
    rule auth_type() = atom()
    // capability = ("AUTH=" auth-type) / atom
    rule capability() -> &'input [u8] = $(("AUTH=" auth_type()) / atom())

    // mailbox = "INBOX" / astring (case-insensitive "INBOX")
    rule mailbox() -> MailboxName<'input>
      = ("i" / "I") ("n" / "N") ("b" / "B") ("o" / "O") ("x" / "X") { MailboxName::Inbox }
      / m:astring() { MailboxName::Other(m) }

    // mbx-list-flags, rewritten as a flat SP-separated list for simplicity.
    rule mbx_list_flags() -> Vec<&'input [u8]>
      = fs:((f:$("\\" atom()) { f }) ** SP()) { fs }
    // mailbox-list = "(" [mbx-list-flags] ")" SP (DQUOTE QUOTED-CHAR DQUOTE / nil) SP mailbox
    rule mailbox_list() -> ListEntry<'input>
      = "(" flags:mbx_list_flags() ")" SP()
        delimiter:(DQUOTE() c:QUOTED_CHAR() DQUOTE() { Some(c) } / nil() { None }) SP()
        mailbox:mailbox()
      { ListEntry { flags, delimiter, mailbox } }

    // flag-keyword / flag-extension; flag is the union (a system flag is a valid flag-extension).
    rule flag() -> &'input [u8] = $("\\" atom()) / $(atom())
    // flag-perm = flag / "\*"
    rule flag_perm() -> &'input [u8] = flag() / $("\\*")

    // mod-sequence-value = 1*DIGIT
    rule mod_sequence_value() -> u64 = n:$(DIGIT()+) { parse_number(n) }

    // msg-att-static/dynamic, collected into one order-independent list (servers are not required
    // to emit a fixed order and frequently don't).
    rule msg_att() -> MsgAtt<'input>
      = "UID" SP() u:uniqueid() { MsgAtt::Uid(u) }
      / "FLAGS" SP() "(" fs:(flag() ** SP()) ")" { MsgAtt::Flags(fs) }
      / "INTERNALDATE" SP() s:string() { MsgAtt::InternalDate(s) }
      / "RFC822.SIZE" SP() n:number() { MsgAtt::Rfc822Size(n) }
      / "MODSEQ" SP() "(" m:mod_sequence_value() ")" { MsgAtt::ModSeq(m) }
      / "BODY[]" SP() s:nstring() { MsgAtt::Body(s) }
    rule msg_att_list() -> Vec<MsgAtt<'input>> = msg_att() ** SP()

    // status-att-list = status-att SP number *(SP status-att SP number)
    rule status_att() -> StatusAtt<'input>
      = name:$("MESSAGES" / "RECENT" / "UIDNEXT" / "UIDVALIDITY" / "UNSEEN" / "HIGHESTMODSEQ")
        SP() value:number()
      { StatusAtt { name, value } }
    rule status_att_list() -> Vec<StatusAtt<'input>> = status_att() ** SP()

    // seq-number = nz-number / "*"
    rule seq_number() -> Range = n:nz_number() { Range(n, n) } / "*" { Range(0, u64::MAX) }
    // seq-range = seq-number ":" seq-number
    rule seq_range() -> Range
      = r1:seq_number() ":" r2:seq_number()
      { if r1.0 <= r2.1 { Range(r1.0, r2.1) } else { Range(r2.0, r1.0) } }
    // sequence-set, rewritten to avoid backtracking (seq-number can match seq-range).
    rule sequence_set() -> Vec<Range> = (seq_range() / seq_number()) ** ","
    // known-uids = sequence-set
    rule known_uids() -> Vec<Range> = sequence_set()
    // append-uid = uniqueid
    rule append_uid() -> u64 = uniqueid()
    // uid-range = uniqueid ":" uniqueid
    rule uid_range() -> Range
      = u1:uniqueid() ":" u2:uniqueid()
      { if u1 <= u2 { Range(u1, u2) } else { Range(u2, u1) } }
    // uid-set = (uniqueid / uid-range) *("," uid-set)
    rule uid_set() -> Vec<Range> = (u:uniqueid() { Range(u, u) } / uid_range()) ** ","

    // resp-text-code, generalized across the extensions this engine understands.
    rule resp_text_code() -> RespCode<'input>
      = "ALERT" { RespCode::Alert }
      / "PARSE" { RespCode::Parse }
      / "TRYCREATE" { RespCode::TryCreate }
      / "READ-ONLY" { RespCode::ReadOnly }
      / "READ-WRITE" { RespCode::ReadWrite }
      / "NOMODSEQ" { RespCode::NoModSeq }
      / "CAPABILITY" cs:(SP() c:capability() { c })+ { RespCode::Capability(cs) }
      / "PERMANENTFLAGS" SP() "(" fs:(flag_perm() ** SP()) ")" { RespCode::PermanentFlags(fs) }
      / "UIDNEXT" SP() n:nz_number() { RespCode::UidNext(n) }
      / "UIDVALIDITY" SP() n:nz_number() { RespCode::UidValidity(n) }
      / "UNSEEN" SP() n:nz_number() { RespCode::Unseen(n) }
      / "HIGHESTMODSEQ" SP() n:mod_sequence_value() { RespCode::HighestModSeq(n) }
      / "APPENDUID" SP() n:nz_number() SP() u:append_uid()
        { RespCode::AppendUid(Append { uidvalidity: n, uid: u }) }
      / "COPYUID" SP() n:nz_number() SP() from:uid_set() SP() to:uid_set()
        { RespCode::CopyUid(Move { uidvalidity: n, from, to }) }
      / "MODIFIED" SP() s:sequence_set() { RespCode::Modified(s) }
      / other:$(atom()) { RespCode::Other(other) }
    // resp-text = ["[" resp-text-code "]" SP] text
    rule resp_text() -> Option<RespCode<'input>>
      = c:("[" c:resp_text_code() "]" SP() { c })? text()? { c }

    // https://www.rfc-editor.org/rfc/rfc3501#section-2.2.2 - untagged vs tagged vs continuation.
    #[no_eof]
    pub rule untagged() -> Untagged<'input>
      = "CAPABILITY" cs:(SP() c:capability() { c })+ CRLF() { Untagged::Capability(cs) }
      / "ENABLED" cs:(SP() c:capability() { c })* CRLF() { Untagged::Enabled(cs) }
      / "FLAGS" SP() "(" fs:(flag() ** SP()) ")" CRLF() { Untagged::Flags(fs) }
      / "LIST" SP() l:mailbox_list() CRLF() { Untagged::List(l) }
      / "LSUB" SP() l:mailbox_list() CRLF() { Untagged::Lsub(l) }
      / "SEARCH" us:(SP() u:nz_number() { u })* CRLF() { Untagged::Search(us) }
      / "STATUS" SP() mailbox:mailbox() SP() "(" attrs:status_att_list() ")" CRLF()
        { Untagged::Status { mailbox, attrs } }
      / "MYRIGHTS" SP() mailbox:mailbox() SP() rights:$(ATOM_CHAR()+) CRLF()
        { Untagged::MyRights { mailbox, rights } }
      / "VANISHED" earlier:(SP() "(EARLIER)" {()})? SP() uids:known_uids() CRLF()
        { Untagged::Vanished { earlier: earlier.is_some(), uids } }
      / "BYE" SP() c:resp_text() CRLF() { Untagged::Bye(c) }
      / "PREAUTH" SP() c:resp_text() CRLF() { Untagged::Preauth(c) }
      / "OK" SP() c:resp_text() CRLF() { Untagged::Ok(c) }
      / "NO" SP() c:resp_text() CRLF() { Untagged::No(c) }
      / "BAD" SP() c:resp_text() CRLF() { Untagged::Bad(c) }
      / n:nz_number() SP() r:(
            "EXISTS" CRLF() { Untagged::Exists(n) }
          / "RECENT" CRLF() { Untagged::Recent(n) }
          / "EXPUNGE" CRLF() { Untagged::Expunge(n) }
          / "FETCH" SP() "(" attrs:msg_att_list() ")" CRLF() { Untagged::Fetch { msn: n, attrs } }
        ) { r }
      // Catch-all: an unrecognized keyword is still a well-formed
      // untagged response and must not abort the parse.
      / keyword:$(atom()) (SP() text())? CRLF() { Untagged::Other(keyword) }

    #[no_eof]
    pub rule tagged() -> (&'input [u8], bool, Option<RespCode<'input>>)
      = t:tag() SP() ok:("OK" { true } / "NO" { false } / "BAD" { false }) SP() c:resp_text() CRLF()
      { (t, ok, c) }

    #[no_eof]
    pub rule continuation() -> ()
      = "+" (SP() text())? CRLF() { () }

    /// Entry point: any single server line, dispatched on its leading token.
    #[no_eof]
    pub rule line() -> Line<'input>
      = "*" SP() u:untagged() { Line::Untagged(u) }
      / t:tagged() { Line::Tagged { tag: t.0, ok: t.1, code: t.2 } }
      / continuation() { Line::Continuation }
  }
}
