use crawlgrid_models::{Action, ChainError, QueueIdentity, Service};

/// What a worker does with one action of a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Owned by another service: send it on unchanged.
    Forward(QueueIdentity),
    /// Owned by the running service: hand it to the local handler.
    Execute,
}

pub fn route(action: &Action, current: Service) -> Result<Decision, ChainError> {
    let target = action.target()?;
    if target.service == current {
        Ok(Decision::Execute)
    } else {
        Ok(Decision::Forward(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_service_executes_others_forward() {
        let local = Action::new(Service::Parser, "default");
        let remote = Action::new(Service::Indexer, "crawler");
        assert_eq!(route(&local, Service::Parser).unwrap(), Decision::Execute);
        assert_eq!(
            route(&remote, Service::Parser).unwrap(),
            Decision::Forward(QueueIdentity::new(Service::Indexer, "crawler"))
        );
    }

    #[test]
    fn missing_or_unknown_routing_is_an_error() {
        let mut action = Action::new(Service::Parser, "");
        assert!(matches!(
            route(&action, Service::Parser),
            Err(ChainError::MissingRouting("queue"))
        ));
        action.queue = "default".into();
        action.service_type = "search".into();
        assert!(matches!(
            route(&action, Service::Parser),
            Err(ChainError::UnknownService(_))
        ));
    }
}
