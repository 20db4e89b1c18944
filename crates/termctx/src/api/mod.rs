//! HTTP plumbing between the [`Backend`](crate::backend::Backend) adapter and
//! the OpenRouter API:
//!
//! - [`retry`] — transient error detection (429, 5xx, network timeouts) with
//!   configurable exponential backoff. Never retries 400/401 errors.
//! - [`streaming`] — SSE parser yielding [`StreamEvent`](streaming::StreamEvent)
//!   values as they arrive.

pub mod retry;
pub mod streaming;

pub use retry::{RetryConfig, retry_transient};
pub use streaming::{SseStream, StreamEvent};
