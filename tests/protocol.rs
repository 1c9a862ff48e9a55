//! Wire-format invariants for the RouterOS length-prefix codec

use mikrotik_admin::protocol::{decode_length, encode_length, encode_word, FrameDecoder};

#[test]
fn test_known_prefixes() {
    // 17-byte command word: single prefix byte 0x11, 18 bytes total
    let encoded = encode_word("/ip/address/print");
    assert_eq!(encoded[0], 0x11);
    assert_eq!(encoded.len(), 18);

    // 200-byte word: two-byte prefix 0x80 0xC8
    let word = "x".repeat(200);
    let encoded = encode_word(&word);
    assert_eq!(&encoded[..2], &[0x80, 0xC8]);
    assert_eq!(encoded.len(), 202);
}

#[test]
fn test_encode_decode_roundtrip_across_widths() {
    // One representative length per prefix width boundary
    for len in [
        0usize,
        1,
        0x7F,
        0x80,
        0x3FFF,
        0x4000,
        0x1F_FFFF,
        0x0020_0000,
        0x0FFF_FFFF,
        0x1000_0000,
    ] {
        let prefix = encode_length(len);
        let (decoded, width) = decode_length(&prefix)
            .expect("valid prefix")
            .expect("complete prefix");
        assert_eq!(decoded, len);
        assert_eq!(width, prefix.len());
    }
}

#[test]
fn test_word_roundtrip_preserves_bytes() {
    let words = [
        "",
        "/login",
        "=comment=with spaces and = signs",
        "?address=10.0.0.0/24",
        &"long".repeat(5000),
    ];
    for word in words {
        let encoded = encode_word(word);
        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded);
        let decoded = decoder.next_word().unwrap().unwrap();
        assert_eq!(decoded, *word);
        assert_eq!(decoder.pending(), 0);
    }
}

#[test]
fn test_chunked_stream_emits_words_in_order() {
    let words: Vec<String> = (0..50)
        .map(|i| format!("=key{i}={}", "v".repeat(i * 7 % 300)))
        .collect();
    let mut stream = Vec::new();
    for word in &words {
        stream.extend_from_slice(&encode_word(word));
    }

    // Regardless of chunking, the word sequence is identical
    for chunk_size in [1, 2, 3, 7, 64, stream.len()] {
        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for chunk in stream.chunks(chunk_size) {
            decoder.push(chunk);
            while let Some(word) = decoder.next_word().unwrap() {
                decoded.push(word);
            }
        }
        assert_eq!(decoded, words, "chunk size {chunk_size}");
    }
}

#[test]
fn test_all_ones_marker_is_rejected() {
    for first in 0xF8u8..=0xFF {
        assert!(
            decode_length(&[first, 0, 0, 0, 0]).is_err(),
            "0x{first:02X} must be a framing error"
        );
    }
}
