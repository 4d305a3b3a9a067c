//! Timeout racing and the safe-request façade built on it.

pub mod race;
pub mod request;

pub use race::{GuardStats, TimeoutGuard};
pub use request::{HttpRequester, RequestOptions, ReqwestRequester, Response, SafeRequest};
