//! Network side of the session lifecycle.
//!
//! The only call this crate makes is the token refresh: a `POST` that relies
//! on the HTTP-only renewal cookie and answers `{ "accessToken": "..." }`.

pub mod error;
pub mod refresh;

pub use error::RefreshError;
pub use refresh::{forget_cookies, HttpRefreshGateway, RefreshGateway};
