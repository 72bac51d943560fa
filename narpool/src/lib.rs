//! The narpool common library.
//!
//! Shared building blocks of the narpool federated binary cache:
//! cache naming, the Nix object signing scheme, and the error type
//! used across the workspace.

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

pub mod cache;
pub mod error;
pub mod mime;
pub mod signing;

pub use error::{NarpoolError, NarpoolResult};
