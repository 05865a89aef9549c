// 会话事件模块

pub mod throttle;
pub mod types;

pub use throttle::{ProgressThrottler, DEFAULT_THROTTLE_INTERVAL_MS};
pub use types::{EventPriority, SessionEvent};
