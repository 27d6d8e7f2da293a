//! AI-driven grading core for handwritten dictation worksheets.
//!
//! This crate has one job: fuse a vision-language model's reading of a
//! worksheet with an OCR engine's pixel-accurate handwriting boxes into a
//! graded, annotated result. It has no HTTP surface, no persistence schema
//! of its own, and no UI — those live in the host application that embeds
//! it; see [`grading::delegate::PersistenceDelegate`] for the seam between
//! the two.

pub mod app_error;
pub mod grading;
