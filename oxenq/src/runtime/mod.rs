/// Queue controller: lifecycle and the enqueue surface.
pub mod controller;
/// Claim loop, shared dispatch state, and shutdown signalling.
pub mod dispatcher;
/// Stuck-job sweep.
pub(crate) mod recoverer;
/// Per-job execution and the user-facing work/hook traits.
pub mod supervisor;

pub use controller::Queue;
pub use dispatcher::{DebugSnapshot, ShutdownToken};
pub use supervisor::{JobHooks, NoopHooks, WorkHandler};
