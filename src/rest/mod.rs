pub mod client;
pub mod types;

pub use client::{
    CursorPager, PmxRestClient, PmxRestClientBuilder, RateLimitConfig, RetryConfig,
};
