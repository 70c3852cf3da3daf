//! Mailbox-name codec: modified UTF-7 (RFC 3501 §5.1.3) in one direction,
//! UTF-8 passthrough in the other once the server has `ENABLE`d UTF8=ACCEPT.
//!
//! This is named as an external collaborator in the interface contract (a
//! host may swap in its own codec, e.g. a server known to already speak
//! raw UTF-8) but a default implementation ships so the engine works out
//! of the box.

use base64::Engine as _;

/// `encode`/`decode` a mailbox name between its display form and its wire
/// form. Implementors decide, per call, which representation the wire
/// currently expects (driven by whether UTF8=ACCEPT has been enabled).
pub trait MailboxCodec {
  fn encode(&self, name: &str) -> String;
  fn decode(&self, wire: &[u8]) -> Option<String>;
}

/// Modified UTF-7, the IMAP4rev1 default.
#[derive(Debug, Default, Clone, Copy)]
pub struct Utf7Codec;

impl MailboxCodec for Utf7Codec {
  fn encode(&self, name: &str) -> String {
    utf8_to_utf7(name)
  }

  fn decode(&self, wire: &[u8]) -> Option<String> {
    utf7_to_utf8(wire)
  }
}

/// Raw UTF-8, valid once UTF8=ACCEPT is in effect for the connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8Codec;

impl MailboxCodec for Utf8Codec {
  fn encode(&self, name: &str) -> String {
    name.to_owned()
  }

  fn decode(&self, wire: &[u8]) -> Option<String> {
    std::str::from_utf8(wire).ok().map(str::to_owned)
  }
}

fn mutf7_engine() -> base64::engine::GeneralPurpose {
  base64::engine::GeneralPurpose::new(&base64::alphabet::IMAP_MUTF7, base64::engine::general_purpose::NO_PAD)
}

pub fn utf7_to_utf8(input: &[u8]) -> Option<String> {
  let engine = mutf7_engine();
  let mut buffer = Vec::new();
  let mut output = String::new();
  let mut i = 0;
  while i < input.len() {
    match input[i] {
      // https://www.rfc-editor.org/rfc/rfc3501#section-5.1.3
      // "&" shifts to modified BASE64, "-" shifts back to US-ASCII.
      b'&' => {
        let start = i;
        loop {
          i += 1;
          if i == input.len() {
            return None;
          }
          if input[i] == b'-' {
            break;
          }
        }
        if start + 1 == i {
          // "&-" represents a literal "&".
          output.push('&');
        } else {
          buffer.truncate(0);
          buffer.try_reserve(base64::decoded_len_estimate(i - (start + 1))).ok()?;
          engine.decode_vec(&input[start + 1..i], &mut buffer).ok()?;

          let mut decoder = encoding_rs::UTF_16BE.new_decoder_without_bom_handling();
          output
            .try_reserve(decoder.max_utf8_buffer_length_without_replacement(buffer.len())?)
            .ok()?;
          let (result, _) = decoder.decode_to_string_without_replacement(&buffer, &mut output, true);
          match result {
            encoding_rs::DecoderResult::InputEmpty => (),
            _ => return None,
          }
        }
      }
      // Printable US-ASCII except "&" represents itself.
      c @ 0x20..=0x25 | c @ 0x27..=0x7e => output.push(c as char),
      _ => return None,
    }
    i += 1;
  }
  Some(output)
}

pub fn utf8_to_utf7(input: &str) -> String {
  let engine = mutf7_engine();
  let mut output = String::new();
  let mut run: Vec<u16> = Vec::new();

  let flush = |run: &mut Vec<u16>, output: &mut String| {
    if run.is_empty() {
      return;
    }
    let mut bytes = Vec::with_capacity(run.len() * 2);
    for unit in run.drain(..) {
      bytes.extend_from_slice(&unit.to_be_bytes());
    }
    output.push('&');
    output.push_str(&engine.encode(bytes));
    output.push('-');
  };

  for c in input.chars() {
    match c {
      '&' => {
        flush(&mut run, &mut output);
        output.push_str("&-");
      }
      '\u{20}'..='\u{25}' | '\u{27}'..='\u{7e}' => {
        flush(&mut run, &mut output);
        output.push(c);
      }
      _ => {
        let mut units = [0u16; 2];
        run.extend_from_slice(c.encode_utf16(&mut units));
      }
    }
  }
  flush(&mut run, &mut output);
  output
}

/// SASL PLAIN payload, base64 encoded: `\0user\0password`.
pub fn plain(user: &str, password: &str) -> String {
  let engine = base64::engine::GeneralPurpose::new(&base64::alphabet::STANDARD, base64::engine::general_purpose::PAD);
  // https://www.rfc-editor.org/rfc/rfc2595#section-6
  engine.encode(format!("\0{user}\0{password}"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn utf7_to_utf8_examples() {
    assert_eq!("", utf7_to_utf8(b"").unwrap());
    assert_eq!("&", utf7_to_utf8(b"&-").unwrap());
    assert_eq!("~peter/mail/台北/日本語", utf7_to_utf8(b"~peter/mail/&U,BTFw-/&ZeVnLIqe-").unwrap());
    assert_eq!(None, utf7_to_utf8(b"&Jjo!"));
    assert_eq!("☺!", utf7_to_utf8(b"&Jjo-!").unwrap());
  }

  #[test]
  fn round_trip() {
    for name in ["INBOX", "Sent Items", "~peter/mail/台北/日本語", "a&b"] {
      let wire = utf8_to_utf7(name);
      assert_eq!(name, utf7_to_utf8(wire.as_bytes()).unwrap(), "round trip of {name:?} via {wire:?}");
    }
  }
}
