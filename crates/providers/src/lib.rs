//! Completion engine adapters for Parley.
//!
//! All providers implement the `parley_core::Provider` trait.
//! [`build_from_config`] selects one from configuration.

pub mod openai_compat;
pub mod router;

pub use openai_compat::OpenAiCompatProvider;
pub use router::build_from_config;
