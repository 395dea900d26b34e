mod client;

pub use client::{ApiError, ApiResult, EtradeClient};

#[cfg(test)]
pub(crate) use client::testing;
