//! # llama-runtime
//!
//! Reference runtime for llama-chat. [`MockBackend`] and [`MockEngine`] implement
//! the llama-engine traits with a byte-level tokenizer, a ChatML template and a
//! scripted "model" that replies with canned text.
//!
//! The mock is strict where real engines are: positions must continue the cache,
//! the window cannot be overrun, and sampling needs logits from the last decode.
//! Bookkeeping mistakes in the session layer therefore show up as engine errors.

mod mock;

pub use mock::{DecodeRecord, MockBackend, MockEngine, DEFAULT_REPLY};
