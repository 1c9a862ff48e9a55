// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jesof

//! Sentence model and word assembly
//!
//! A sentence is an ordered list of words terminated by the empty word. It
//! carries one reply-type word (`!re`, `!done`, `!trap`, `!fatal`), an
//! optional `.tag=` word, and attribute words.

use std::collections::HashMap;

/// A single data row as returned by the router: attribute map of string
/// values.
pub type Row = HashMap<String, String>;

/// Client-generated tags start with this prefix.
pub const TAG_PREFIX: &str = "t";

/// Reply taxonomy of the binary API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyType {
    /// `!re` data row
    Data,
    /// `!done` terminal success
    Done,
    /// `!trap` terminal error carrying `message`
    Trap,
    /// `!fatal` connection-terminating error
    Fatal,
}

impl ReplyType {
    #[must_use]
    pub fn from_word(word: &str) -> Option<Self> {
        match word {
            "!re" => Some(Self::Data),
            "!done" => Some(Self::Done),
            "!trap" => Some(Self::Trap),
            "!fatal" => Some(Self::Fatal),
            _ => None,
        }
    }
}

/// One fully assembled inbound sentence.
#[derive(Debug, Clone, Default)]
pub struct Sentence {
    pub reply: Option<ReplyType>,
    pub tag: Option<String>,
    pub attributes: Row,
}

impl Sentence {
    /// The `!trap` message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.attributes.get("message").map(String::as_str)
    }
}

/// Accumulates decoded words into sentences.
///
/// Feed every word from the frame decoder; the empty word completes the
/// current sentence and resets the accumulator.
#[derive(Default)]
pub struct SentenceAssembler {
    current: Sentence,
    saw_word: bool,
}

impl SentenceAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb one decoded word. Returns the completed sentence when `word`
    /// is the empty terminator.
    pub fn push_word(&mut self, word: &str) -> Option<Sentence> {
        if word.is_empty() {
            if !self.saw_word {
                return None;
            }
            self.saw_word = false;
            return Some(std::mem::take(&mut self.current));
        }
        self.saw_word = true;

        if word.starts_with('!') {
            self.current.reply = ReplyType::from_word(word);
            return None;
        }
        if let Some(tag) = word.strip_prefix(".tag=") {
            self.current.tag = Some(tag.to_string());
            return None;
        }
        if let Some(stripped) = word.strip_prefix('=') {
            if let Some((k, v)) = stripped.split_once('=') {
                self.current.attributes.insert(k.to_string(), v.to_string());
            } else {
                self.current.attributes.insert(stripped.to_string(), String::new());
            }
            return None;
        }
        if let Some(ret) = word.strip_prefix("ret=") {
            self.current.attributes.insert("ret".to_string(), ret.to_string());
            return None;
        }
        // bare flag word
        self.current
            .attributes
            .insert(word.to_string(), "true".to_string());
        None
    }
}

/// Build the outbound word list for one tagged operation:
/// `[command, key-prefixed words.., .tag=<tag>]`.
///
/// Keys starting with `?` are query predicates and pass through verbatim;
/// every other key becomes an attribute word with a leading `=`.
#[must_use]
pub fn build_sentence_words(command: &str, params: &[(String, String)], tag: &str) -> Vec<String> {
    let mut words = Vec::with_capacity(2 + params.len());
    words.push(command.to_string());
    for (key, value) in params {
        if key.starts_with('?') {
            words.push(format!("{key}={value}"));
        } else {
            words.push(format!("={key}={value}"));
        }
    }
    words.push(format!(".tag={tag}"));
    words
}
