// 遥测模块
//
// 服务端处理阶段的实时通知：WebSocket 推送为主，轮询兜底。
// 遥测永远只是参考信息，完成与否只认分片确认。

pub mod channel;
pub mod events;

pub use channel::{ChannelState, TelemetryChannel, TelemetryError, TelemetryHandle};
pub use events::NotificationEvent;
