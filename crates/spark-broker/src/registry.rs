use crate::{broker::Broker, error::BrokerError};
use dashmap::{DashMap, mapref::entry::Entry};
use std::{fmt, sync::Arc};

/// 进程级 Broker 目录。
///
/// 由宿主显式创建并通过 [`crate::broker::BrokerBuilder::registry`] 交给 Broker；
/// Broker 启动时登记、停止时注销。克隆共享同一张表。
#[derive(Clone, Default)]
pub struct BrokerRegistry {
    brokers: Arc<DashMap<String, Broker>>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记 `broker`；同名的另一个 Broker 已在册时拒绝，重复登记同一实例视为成功。
    pub fn register(&self, broker: Broker) -> Result<(), BrokerError> {
        match self.brokers.entry(broker.id().to_owned()) {
            Entry::Occupied(existing) if existing.get().ptr_eq(&broker) => Ok(()),
            Entry::Occupied(existing) => Err(BrokerError::DuplicateBroker(existing.key().clone())),
            Entry::Vacant(slot) => {
                slot.insert(broker);
                Ok(())
            }
        }
    }

    pub fn unregister(&self, id: &str) -> Option<Broker> {
        self.brokers.remove(id).map(|(_, broker)| broker)
    }

    pub fn get(&self, id: &str) -> Option<Broker> {
        self.brokers.get(id).map(|entry| entry.value().clone())
    }

    /// 在册 Broker 的标识，按字典序。
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.brokers.iter().map(|entry| entry.key().clone()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.brokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }
}

impl fmt::Debug for BrokerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}
