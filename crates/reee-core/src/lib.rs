//! Shared types for the reee daemon (`reeed`) and client (`reee`).
//!
//! This crate holds everything both binaries must agree on:
//!
//! - [`protocol`]: the line-oriented wire codec for command and result
//!   frames exchanged over the local socket.
//! - [`log`]: the three-level logging model (`taciturn` < `normal` <
//!   `verbose`), the [`log::Printer`] capability trait, and a
//!   writer-backed printer.
//! - [`addr`]: default transport family and address resolution.
//! - [`ident`]: the identifier grammar shared by command IDs, group
//!   names, and rule names.

pub mod addr;
pub mod ident;
pub mod log;
pub mod protocol;
