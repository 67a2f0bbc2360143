//! HTTP wire to the jobmon state server.
//!
//! Every non-server component talks to the server through a [`Requester`]:
//! a thin reqwest wrapper that retries transport failures and 5xx responses
//! with exponential backoff, and surfaces 4xx responses immediately.

mod requester;
mod retry;

pub use requester::{Requester, RequesterError};
pub use retry::RetryPolicy;
