//! Command tagger & queue: generates monotonic tags, tracks in-flight
//! commands, and matches tagged completions back to their originator.

use crate::error::{Error, Result};
use crate::wire::{OwnedRespCode, Stream};
use std::{collections::VecDeque, io};

/// Submission-time behavior for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
  /// Append to the pipeline buffer without flushing.
  Queue,
  /// Must not be pipelined: drain the queue first, then send alone.
  Single,
  /// Probe the socket readable/writable before writing.
  Poll,
  /// Contains password material; never logged verbatim.
  Pass,
  None,
}

/// Final disposition of a completed command.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  Success(Option<OwnedRespCode>),
  Error { qualifier: Option<OwnedRespCode> },
  Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
  New,
  Sent,
}

struct Slot {
  tag: String,
  completion: Completion,
}

/// Generates tags of the form `<letter><NNNN>`, wrapping the letter once
/// the counter rolls over and giving well over a quarter million tags
/// before a pair repeats.
pub struct Tagger {
  letter: u8,
  counter: u32,
}

impl Default for Tagger {
  fn default() -> Self {
    Self { letter: b'a', counter: 0 }
  }
}

impl Tagger {
  pub fn next(&mut self) -> String {
    let tag = format!("{}{:04}", self.letter as char, self.counter);
    self.counter += 1;
    if self.counter >= 9999 {
      self.counter = 0;
      self.letter = if self.letter == b'z' { b'a' } else { self.letter + 1 };
    }
    tag
  }
}

/// Tracks outstanding tagged commands for one connection and the pipeline
/// buffer of bytes not yet flushed to the socket.
pub struct Queue {
  tagger: Tagger,
  slots: VecDeque<Slot>,
  pipeline: Vec<u8>,
  loggable: usize,
}

impl Default for Queue {
  fn default() -> Self {
    Self { tagger: Tagger::default(), slots: VecDeque::new(), pipeline: Vec::new(), loggable: 0 }
  }
}

impl Queue {
  pub fn new() -> Self {
    Self::default()
  }

  /// Enqueues a command's wire bytes (already tagged by the caller via
  /// [`Queue::tag`]) and submits it per `flag`.
  pub fn submit<RW>(&mut self, stream: &mut Stream<RW>, tag: String, bytes: &[u8], flag: Flag) -> Result<()>
  where
    RW: io::Read + io::Write,
  {
    match flag {
      Flag::Pass => {
        self.pipeline.extend_from_slice(bytes);
      }
      _ => {
        self.loggable += bytes.len();
        self.pipeline.extend_from_slice(bytes);
      }
    }
    self.slots.push_back(Slot { tag, completion: Completion::New });
    match flag {
      Flag::Queue => Ok(()),
      Flag::Single | Flag::Poll | Flag::Pass | Flag::None => self.flush(stream),
    }
  }

  pub fn tag(&mut self) -> String {
    self.tagger.next()
  }

  /// Flushes the pipeline buffer to the wire.
  pub fn flush<RW>(&mut self, stream: &mut Stream<RW>) -> Result<()>
  where
    RW: io::Read + io::Write,
  {
    if self.pipeline.is_empty() {
      return Ok(());
    }
    let loggable = self.loggable;
    stream.write_command(&self.pipeline, loggable)?;
    self.pipeline.clear();
    self.loggable = 0;
    for slot in self.slots.iter_mut() {
      if slot.completion == Completion::New {
        slot.completion = Completion::Sent;
      }
    }
    Ok(())
  }

  /// Resolves the oldest outstanding slot matching `tag`. IMAP guarantees
  /// in-order tagged replies so this is always the front slot once sent
  /// commands are considered; out-of-order tags are a protocol violation.
  pub fn resolve(&mut self, tag: &str) -> Result<()> {
    match self.slots.front() {
      Some(slot) if slot.tag == tag => {
        self.slots.pop_front();
        Ok(())
      }
      Some(slot) => Err(Error::fatal(format!("tag mismatch: expected completion for {}, got {tag}", slot.tag))),
      None => Err(Error::fatal(format!("unexpected tagged completion {tag}"))),
    }
  }

  /// Drains every outstanding slot as fatal, e.g. after a dead socket.
  pub fn drain_fatal(&mut self) {
    self.slots.clear();
    self.pipeline.clear();
    self.loggable = 0;
  }

  pub fn is_idle(&self) -> bool {
    self.slots.is_empty() && self.pipeline.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tags_are_monotonic_and_wrap() {
    let mut tagger = Tagger::default();
    assert_eq!(tagger.next(), "a0000");
    assert_eq!(tagger.next(), "a0001");
    for _ in 0..9997 {
      tagger.next();
    }
    assert_eq!(tagger.next(), "b0000");
  }

  #[test]
  fn resolve_mismatch_is_fatal() {
    let mut queue = Queue::new();
    queue.slots.push_back(Slot { tag: "a0000".to_owned(), completion: Completion::Sent });
    assert!(queue.resolve("a0001").is_err());
  }

  #[test]
  fn resolve_matches_front() {
    let mut queue = Queue::new();
    queue.slots.push_back(Slot { tag: "a0000".to_owned(), completion: Completion::Sent });
    queue.resolve("a0000").unwrap();
    assert!(queue.is_idle());
  }
}
