//! Shared building blocks of the BMCL cache node.
//!
//! Everything in here is free of network and runtime policy: file
//! descriptors, digest handling, download signatures and the manifest
//! codec live here so that both the node daemon and the admin tooling
//! agree on them.

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
pub mod file;
pub mod hash;
#[cfg(feature = "stream")]
pub mod io;
pub mod manifest;
pub mod signing;
#[cfg(feature = "stream")]
pub mod stream;
#[cfg(feature = "tokio")]
pub mod util;

pub use error::{BmclError, BmclResult};
