//! Client for the remote generation task API.
//!
//! The remote service is only observable by polling: a task is created with
//! `createTask` and its progress read back with `recordInfo`. Raw remote states
//! are normalized to [`TaskState`] and result URLs collected from wherever the
//! service reports them.
//!
//! # Example
//!
//! ```no_run
//! use genpay_client::{CreateTaskRequest, KieClient, TaskApi, TaskState};
//!
//! # async fn example() -> genpay_client::Result<()> {
//! let client = KieClient::new("https://api.kie.ai", "your-api-key")?;
//!
//! let request = CreateTaskRequest::new("z-image", serde_json::json!({"prompt": "a cat"}));
//! if let Some(task_id) = client.create_task(&request).await? {
//!     let status = client.get_status(&task_id).await?;
//!     if status.state == TaskState::Success {
//!         println!("results: {:?}", status.result_urls);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod client;
mod error;
mod types;

pub use client::{normalize_base_url, ClientOptions, KieClient, TaskApi};
pub use error::{ClientError, Result};
pub use types::*;
