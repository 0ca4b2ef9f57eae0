//! Tests for the reference byte tokenizer and its special-token handling.

use llama_tokenizer::{
    ByteTokenizer, StreamAssembler, StreamError, Tokenizer, TokenizerError, BOS_TOKEN,
};

// ===== Encoding =====

#[test]
fn encode_with_bos() {
    let tok = ByteTokenizer::new();
    let ids = tok.encode("ab", true, false).unwrap();
    assert_eq!(ids, vec![BOS_TOKEN, 97, 98]);
}

#[test]
fn encode_chatml_markup_parsed() {
    let tok = ByteTokenizer::new();
    let start = tok.special_id("<|im_start|>").unwrap();
    let end = tok.special_id("<|im_end|>").unwrap();

    let ids = tok
        .encode("<|im_start|>user\nhi<|im_end|>", false, true)
        .unwrap();

    let mut expected = vec![start];
    expected.extend("user\nhi".bytes().map(i32::from));
    expected.push(end);
    assert_eq!(ids, expected);
}

#[test]
fn encode_partial_marker_is_plain_bytes() {
    let tok = ByteTokenizer::new();
    let ids = tok.encode("<|im_sta", false, true).unwrap();
    assert_eq!(ids.len(), "<|im_sta".len());
    assert!(ids.iter().all(|&id| (0..256).contains(&id)));
}

#[test]
fn encode_markup_next_to_multibyte_text() {
    let tok = ByteTokenizer::new();
    let end = tok.special_id("<|im_end|>").unwrap();
    let ids = tok.encode("é<|im_end|>ü", false, true).unwrap();
    assert_eq!(ids, vec![0xC3, 0xA9, end, 0xC3, 0xBC]);
}

#[test]
fn longest_marker_wins() {
    let tok = ByteTokenizer::new().with_special("<|im_end|>x");
    let long = tok.special_id("<|im_end|>x").unwrap();
    assert_eq!(tok.encode("<|im_end|>x", false, true).unwrap(), vec![long]);
}

// ===== Decoding =====

#[test]
fn special_tokens_detokenize_to_markup() {
    let tok = ByteTokenizer::new();
    let ids = tok.encode("<|im_start|>assistant", false, true).unwrap();
    assert_eq!(tok.decode(&ids).unwrap(), "<|im_start|>assistant");
}

#[test]
fn decode_split_character_alone_errors() {
    let tok = ByteTokenizer::new();
    let err = tok.decode(&[0xE2, 0x82]).unwrap_err();
    assert!(matches!(err, TokenizerError::DecodingError(_)));
}

#[test]
fn decode_token_surfaces_stream_errors() {
    let tok = ByteTokenizer::new();
    let mut stream = StreamAssembler::new();
    let err = tok.decode_token(0xFF, &mut stream).unwrap_err();
    assert_eq!(
        err,
        TokenizerError::Stream(StreamError::Malformed {
            text: String::new(),
            invalid: vec![0xFF],
        })
    );
}

#[test]
fn vocab_size_counts_specials() {
    let tok = ByteTokenizer::new();
    assert_eq!(tok.vocab_size(), 256 + 4);
    assert!(tok.is_special(BOS_TOKEN));
    assert!(!tok.is_special(255));
    assert!(!tok.is_special(260));
}
