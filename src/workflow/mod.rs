pub mod item_ctx;
pub mod item_flow;
pub mod retry;
pub mod state;

pub use item_ctx::ItemCtx;
pub use item_flow::ItemFlow;
pub use retry::{call_with_timeout, with_retry, Retried};
pub use state::{ItemState, ItemTracker};
