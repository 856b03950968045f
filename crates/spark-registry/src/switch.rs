//! 心跳开关：决定已注册的提供方何时对外“可用”。
//!
//! # 教案式说明
//! - **意图（Why）**：提供方注册成功并不代表可以接流量，进程完成导出并打开心跳开关后，
//!   所有已注册 URL 才被统一标记为可用；关闭开关则统一摘除。
//! - **契约（What）**：
//!   - 开关由一个长生命周期实例（通常是 [`RegistryFactory`](crate::registry::RegistryFactory)）持有，
//!     不使用进程级静态变量，测试可以各自构造隔离实例；
//!   - [`HeartbeatSwitch::set`] 只有在状态真正翻转时才通知监听者，重复打开是幂等的；
//!   - 监听者以 `Weak` 形式登记，注册实例销毁后自动失效，开关不会延长其生命周期。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::info;

/// 开关翻转的回调。
pub trait SwitchListener: Send + Sync {
    fn on_switch(&self, on: bool);
}

/// 进程级心跳开关的实例化版本。
#[derive(Default)]
pub struct HeartbeatSwitch {
    on: AtomicBool,
    listeners: Mutex<Vec<Weak<dyn SwitchListener>>>,
}

impl HeartbeatSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::Acquire)
    }

    /// 打开开关，返回本次调用是否发生了翻转。
    pub fn turn_on(&self) -> bool {
        self.set(true)
    }

    /// 关闭开关，返回本次调用是否发生了翻转。
    pub fn turn_off(&self) -> bool {
        self.set(false)
    }

    pub fn set(&self, on: bool) -> bool {
        if self.on.swap(on, Ordering::AcqRel) == on {
            return false;
        }
        info!(on, "heartbeat switch flipped");
        // 回调在锁外执行，监听者可以安全地再次访问开关。
        for listener in self.live_listeners() {
            listener.on_switch(on);
        }
        true
    }

    /// 登记监听者。
    pub fn watch(&self, listener: Weak<dyn SwitchListener>) {
        self.listeners.lock().push(listener);
    }

    fn live_listeners(&self) -> Vec<Arc<dyn SwitchListener>> {
        let mut guard = self.listeners.lock();
        guard.retain(|weak| weak.strong_count() > 0);
        guard.iter().filter_map(Weak::upgrade).collect()
    }
}

impl std::fmt::Debug for HeartbeatSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatSwitch")
            .field("on", &self.is_on())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        flips: AtomicUsize,
    }

    impl SwitchListener for Counting {
        fn on_switch(&self, _on: bool) {
            self.flips.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn only_real_flips_notify() {
        let switch = HeartbeatSwitch::new();
        let listener = Arc::new(Counting::default());
        let weak: Weak<dyn SwitchListener> = Arc::downgrade(&listener) as Weak<dyn SwitchListener>;
        switch.watch(weak);

        assert!(switch.turn_on());
        assert!(!switch.turn_on(), "重复打开应为幂等");
        assert!(switch.turn_off());
        assert_eq!(listener.flips.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropped_listeners_are_pruned() {
        let switch = HeartbeatSwitch::new();
        {
            let listener = Arc::new(Counting::default());
            let weak: Weak<dyn SwitchListener> =
                Arc::downgrade(&listener) as Weak<dyn SwitchListener>;
            switch.watch(weak);
        }
        assert!(switch.turn_on());
        assert_eq!(switch.listeners.lock().len(), 0);
    }
}
