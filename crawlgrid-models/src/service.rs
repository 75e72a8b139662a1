use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::action::ChainError;

pub const DEFAULT_QUEUE: &str = "default";

/// Services taking part in the grid. The wire name is the lowercase variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Crawler,
    Loader,
    Parser,
    Indexer,
}

impl Service {
    pub const ALL: [Service; 4] = [
        Service::Crawler,
        Service::Loader,
        Service::Parser,
        Service::Indexer,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Service::Crawler => "crawler",
            Service::Loader => "loader",
            Service::Parser => "parser",
            Service::Indexer => "indexer",
        }
    }

    pub fn default_source_queues(&self) -> Vec<String> {
        vec![DEFAULT_QUEUE.to_string()]
    }

    /// Services that receive work produced by this one. Their queue depth is
    /// the backpressure input for this service's consumers.
    pub fn target_services(&self) -> &'static [Service] {
        match self {
            Service::Crawler => &[Service::Loader],
            Service::Loader => &[Service::Parser],
            Service::Parser => &[Service::Indexer],
            Service::Indexer => &[],
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Service {
    type Err = ChainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Service::ALL
            .into_iter()
            .find(|service| service.name() == value)
            .ok_or_else(|| ChainError::UnknownService(value.to_string()))
    }
}

/// A durable queue owned by one service, named `<service>_<queue>` on every backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueIdentity {
    pub service: Service,
    pub queue: String,
}

impl QueueIdentity {
    pub fn new(service: Service, queue: impl Into<String>) -> Self {
        Self {
            service,
            queue: queue.into(),
        }
    }

    pub fn name(&self) -> String {
        format!("{}_{}", self.service.name(), self.queue)
    }

    /// Parses an external queue name. Service names carry no `_`, so the
    /// first separator splits service from queue.
    pub fn parse(name: &str) -> Result<Self, ChainError> {
        let (service, queue) = name
            .split_once('_')
            .ok_or_else(|| ChainError::MalformedQueueName(name.to_string()))?;
        if queue.is_empty() {
            return Err(ChainError::MalformedQueueName(name.to_string()));
        }
        Ok(Self::new(service.parse()?, queue))
    }
}

impl fmt::Display for QueueIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.service.name(), self.queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_name_round_trips() {
        let identity = QueueIdentity::new(Service::Indexer, "crawler_00");
        assert_eq!(identity.name(), "indexer_crawler_00");
        assert_eq!(QueueIdentity::parse(&identity.name()).unwrap(), identity);
    }

    #[test]
    fn parse_rejects_unknown_service_and_missing_queue() {
        assert!(matches!(
            QueueIdentity::parse("search_default"),
            Err(ChainError::UnknownService(name)) if name == "search"
        ));
        assert!(matches!(
            QueueIdentity::parse("parser_"),
            Err(ChainError::MalformedQueueName(_))
        ));
        assert!(matches!(
            QueueIdentity::parse("parser"),
            Err(ChainError::MalformedQueueName(_))
        ));
    }

    #[test]
    fn pipeline_targets_flow_downstream() {
        assert_eq!(Service::Crawler.target_services(), &[Service::Loader]);
        assert_eq!(Service::Parser.target_services(), &[Service::Indexer]);
        assert!(Service::Indexer.target_services().is_empty());
    }

    #[test]
    fn service_names_parse_back() {
        for service in Service::ALL {
            assert_eq!(service.name().parse::<Service>().unwrap(), service);
        }
    }
}
