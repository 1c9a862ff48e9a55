// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jesof

//! RouterOS wire protocol: length-prefixed framing and sentence assembly

mod codec;
mod sentence;

pub use codec::{decode_length, encode_length, encode_word, FrameDecoder};
pub use sentence::{
    build_sentence_words, ReplyType, Row, Sentence, SentenceAssembler, TAG_PREFIX,
};
