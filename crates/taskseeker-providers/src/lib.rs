pub mod api_key;
pub mod llm;
pub mod retry;
pub mod sse;

pub use llm::{ChatClient, LlmConfig, LlmError};
pub use retry::RetryPolicy;
