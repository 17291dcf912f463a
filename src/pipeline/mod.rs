//! Pipeline stages for exam-PDF-to-JSON extraction.
//!
//! Each submodule implements one transformation step and is testable on its
//! own. Only `input`, `extract` and the LLM-backed adapter in `structure`
//! touch the outside world; every other stage is a pure function.
//!
//! ## Data Flow
//!
//! ```text
//! input ─▶ extract ─▶ normalize ─▶ segment ──────────────┐
//!             │                                          ▼
//!             └──────▶ images ───▶ associate ─▶ structure ─▶ validate ─▶ assemble
//!                                                   ▲          ▲
//! answer key ─▶ extract ─▶ normalize ─▶ answer_key ─┴──────────┘
//! ```
//!
//! 1. [`input`]      resolve a path or URL to a local PDF
//! 2. [`extract`]    per-page text, positioned spans and embedded images;
//!    runs in `spawn_blocking` because pdfium is not async-safe
//! 3. [`normalize`]  one clean line stream with page provenance
//! 4. [`segment`]    cut the stream at question markers
//! 5. [`images`]     drop logos, rules, watermarks and duplicates
//! 6. [`associate`]  bind each kept image to at most one question
//! 7. [`answer_key`] identifier → official option
//! 8. [`structure`]  adapter calls with timeout, retry and cancellation
//! 9. [`validate`]   repair or reject the adapter's fields
//! 10. [`assemble`]  order entries and fill identifier gaps
//!
//! [`encode`] turns images into JPEG files and adapter attachments.

pub mod answer_key;
pub mod assemble;
pub mod associate;
pub mod encode;
pub mod extract;
pub mod images;
pub mod input;
pub mod normalize;
pub mod segment;
pub mod structure;
pub mod validate;
