// 取消控制器
//
// 每个会话一个根取消信号，所有在途分片上传与遥测任务共享；
// 已被服务端确认的分片不会被撤回。

use tokio_util::sync::CancellationToken;
use tracing::info;

/// 会话级取消控制器
///
/// 协作式取消：调度器在启动每个新分片前检查信号，
/// 在途请求通过 select 感知信号后中止。
#[derive(Debug, Clone, Default)]
pub struct CancelController {
    root: CancellationToken,
}

impl CancelController {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
        }
    }

    /// 触发取消
    pub fn cancel(&self) {
        if !self.root.is_cancelled() {
            info!("会话取消信号已触发");
            self.root.cancel();
        }
    }

    /// 是否已取消
    pub fn is_cancelled(&self) -> bool {
        self.root.is_cancelled()
    }

    /// 根令牌的克隆（给分片调度器用）
    pub fn token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// 子令牌（给遥测通道用，可在会话终态时单独收口而不影响根信号语义）
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_propagates_to_clones_and_children() {
        let controller = CancelController::new();
        let token = controller.token();
        let child = controller.child_token();

        assert!(!controller.is_cancelled());
        assert!(!token.is_cancelled());

        controller.cancel();
        assert!(controller.is_cancelled());
        assert!(token.is_cancelled());
        assert!(child.is_cancelled());

        // 重复取消是空操作
        controller.cancel();
        assert!(controller.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let controller = CancelController::new();
        let token = controller.token();

        let handle = tokio::spawn(async move {
            token.cancelled().await;
            42
        });

        controller.cancel();
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[test]
    fn test_child_cancel_does_not_cancel_root() {
        let controller = CancelController::new();
        let child = controller.child_token();

        child.cancel();
        assert!(!controller.is_cancelled());
    }
}
