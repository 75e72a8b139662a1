use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use crawlgrid_broker::BrokerError;
use crawlgrid_models::{Action, Service};
use log::debug;
use serde_json::{Map, Value};

/// Executes the actions addressed to one service.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Run `action`, reading and extending the chain's shared `data`.
    /// `Ok(false)` reports a handled failure; follow-on actions are then not
    /// enqueued. An `Err` carrying the quota signal stops the whole chain.
    async fn process_action(
        &self,
        action: &Action,
        data: &mut Vec<Value>,
    ) -> Result<bool, BrokerError>;

    /// Drop any internal caches; called when the process runs short of memory.
    fn clear_caches(&self) {}
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<Service, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, service: Service, handler: Arc<dyn ActionHandler>) -> Self {
        self.handlers.insert(service, handler);
        self
    }

    pub fn get(&self, service: Service) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(&service).cloned()
    }

    pub fn services(&self) -> impl Iterator<Item = Service> + '_ {
        self.handlers.keys().copied()
    }

    pub fn clear_caches(&self) {
        for handler in self.handlers.values() {
            handler.clear_caches();
        }
    }
}

/// Records every executed action into the shared data and succeeds.
pub struct PassThroughHandler {
    service: Service,
}

impl PassThroughHandler {
    pub fn new(service: Service) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ActionHandler for PassThroughHandler {
    async fn process_action(
        &self,
        action: &Action,
        data: &mut Vec<Value>,
    ) -> Result<bool, BrokerError> {
        let mut record = Map::new();
        record.insert("service".into(), Value::from(self.service.name()));
        record.insert("queue".into(), Value::from(action.queue.clone()));
        record.insert("processed_at".into(), Value::from(Utc::now().to_rfc3339()));
        record.insert("fields".into(), Value::Object(action.fields.clone()));
        data.push(Value::Object(record));
        debug!("{} handled an action on {}", self.service, action.queue);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pass_through_appends_a_record() {
        let handler = PassThroughHandler::new(Service::Loader);
        let action = Action::new(Service::Loader, "default").with_field("url", "http://a.test/");
        let mut data = vec![Value::from("seed")];

        assert!(handler.process_action(&action, &mut data).await.unwrap());
        assert_eq!(data.len(), 2);
        assert_eq!(data[1]["service"], "loader");
        assert_eq!(data[1]["fields"]["url"], "http://a.test/");
    }

    #[test]
    fn registry_resolves_by_service() {
        let registry = HandlerRegistry::new()
            .register(Service::Parser, Arc::new(PassThroughHandler::new(Service::Parser)));
        assert!(registry.get(Service::Parser).is_some());
        assert!(registry.get(Service::Indexer).is_none());
        assert_eq!(registry.services().collect::<Vec<_>>(), vec![Service::Parser]);
    }
}
