//! The sitepack library.
//!
//! Core types shared by the transfer daemon and the installer tooling:
//! package lifecycle, per-storage upload tracking, component filters
//! and installer table decisions.

#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

pub mod error;
pub mod filter;
pub mod installer;
pub mod package;
pub mod settings;
pub mod status;
pub mod upload;

pub use error::{PackError, PackResult};
