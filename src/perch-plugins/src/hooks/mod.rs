//! Hooks: named interception points where plugins transform a value.
//!
//! Every hook registered under a name takes part in that name's pipeline.
//! The pipeline threads a carrier value through the hooks in priority order
//! (highest first); each hook may return a replacement carrier or `None` to
//! leave it unchanged. A hook that fails or panics never stops the pipeline.
//!
//! Hook names are free-form strings agreed upon between the host and
//! plugins, e.g. `before_agent_reply` or `agent_fast_reply`.

mod pipeline;
mod types;

pub use pipeline::{HookPipeline, sort_hooks};
pub use types::{HookCall, HookDecl, HookFn, HookFuture, HookPriority};
