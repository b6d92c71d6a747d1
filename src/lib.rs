//! Self-hosted passkey authentication.
//!
//! A fresh instance prints a one-time registration code; whoever presents
//! it registers the superadmin passkey and the instance switches to normal
//! operation: passkey login, 24 hour auth tokens in an `HttpOnly` cookie,
//! and a double-submit CSRF pair bound to that token.

pub mod auth;
pub mod cli;
pub mod custos;
pub mod store;
