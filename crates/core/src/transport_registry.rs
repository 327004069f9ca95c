use std::collections::HashMap;
use std::sync::Arc;

use crate::{models::Channel, traits::Transport};

/// 通道到传输实现的查找表
///
/// 启动时一次性构建，之后只读，执行路径上无需加锁。
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<Channel, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按传输自身声明的通道注册，同一通道后注册的覆盖先注册的
    pub fn register(&mut self, transport: Arc<dyn Transport>) -> &mut Self {
        self.transports.insert(transport.channel(), transport);
        self
    }

    pub fn with(mut self, transport: Arc<dyn Transport>) -> Self {
        self.register(transport);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn Transport>> {
        self.transports.get(&channel).cloned()
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.transports.keys().copied().collect();
        channels.sort_by_key(|c| c.as_str());
        channels
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("channels", &self.channels())
            .finish()
    }
}
