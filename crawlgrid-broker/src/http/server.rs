use crate::{
    http::types::{
        AvailableResponse, ErrorResponse, QueueRequest, ReceiveRequest, ReceiveResponse,
        SendRequest, StatusResponse, TagRequest,
    },
    BrokerError, DeliveryHandle, FailoverBroker, QUOTA_EXCEEDED,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use crawlgrid_models::QueueIdentity;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{net::TcpListener, time::Instant};

/// Upper bound on how long a remote receive may hold a request open.
const MAX_RECEIVE_WAIT: Duration = Duration::from_secs(60);
/// Tags left unsettled this long are forgotten; the message itself stays
/// unacknowledged in the broker until the next recover.
const DELIVERY_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Clone)]
struct AppState {
    broker: Arc<FailoverBroker>,
    deliveries: Arc<Deliveries>,
}

/// Coordinator-issued tags for the broker's own delivery handles. Tags grow
/// monotonically, so the oldest entries are always at the front of the map.
struct Deliveries {
    next_tag: AtomicU64,
    ttl: Duration,
    handles: Mutex<BTreeMap<u64, (DeliveryHandle, Instant)>>,
}

impl Deliveries {
    fn new(ttl: Duration) -> Self {
        Self {
            next_tag: AtomicU64::new(0),
            ttl,
            handles: Mutex::new(BTreeMap::new()),
        }
    }

    fn issue(&self, handle: DeliveryHandle) -> u64 {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Instant::now();
        let mut handles = self.handles.lock();
        while let Some((&oldest, (_, issued))) = handles.first_key_value() {
            if now.duration_since(*issued) < self.ttl {
                break;
            }
            handles.remove(&oldest);
            debug!("Coordinator forgot unsettled delivery tag {}", oldest);
        }
        handles.insert(tag, (handle, now));
        tag
    }

    fn take(&self, tag: u64) -> Result<DeliveryHandle, BrokerError> {
        self.handles
            .lock()
            .remove(&tag)
            .map(|(handle, _)| handle)
            .ok_or(BrokerError::UnknownDelivery(tag))
    }

    fn forget_queue(&self, queue: &str) {
        self.handles
            .lock()
            .retain(|_, (handle, _)| handle.queue != queue);
    }
}

pub fn router(broker: Arc<FailoverBroker>) -> Router {
    let state = AppState {
        broker,
        deliveries: Arc::new(Deliveries::new(DELIVERY_TTL)),
    };
    Router::new()
        .route("/status", get(status))
        .route("/send", post(send))
        .route("/receive", post(receive))
        .route("/available", post(available))
        .route("/clear", post(clear))
        .route("/recover", post(recover))
        .route("/ack", post(ack))
        .route("/reject", post(reject))
        .with_state(state)
}

pub async fn run_server(addr: SocketAddr, broker: Arc<FailoverBroker>) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    info!("Coordinator listening on {}", listener.local_addr()?);
    axum::serve(listener, router(broker)).await
}

async fn status(State(state): State<AppState>) -> Response {
    json_response(
        StatusCode::OK,
        StatusResponse {
            status: "ok".into(),
            backends: state.broker.backends(),
        },
    )
}

async fn send(State(state): State<AppState>, Json(request): Json<SendRequest>) -> Response {
    respond(send_message(&state, request).await, StatusCode::CREATED)
}

async fn send_message(
    state: &AppState,
    request: SendRequest,
) -> Result<crate::BackendKind, BrokerError> {
    let identity = QueueIdentity::parse(&request.queue)?;
    let payload = BASE64_STANDARD
        .decode(request.payload.as_bytes())
        .map_err(|err| BrokerError::Malformed(err.to_string()))?;
    state
        .broker
        .send(identity.service, &identity.queue, &payload)
        .await
}

async fn receive(State(state): State<AppState>, Json(request): Json<ReceiveRequest>) -> Response {
    let identity = match QueueIdentity::parse(&request.queue) {
        Ok(identity) => identity,
        Err(err) => return error_response(err.into()),
    };
    let timeout = Duration::from_millis(request.timeout_ms).min(MAX_RECEIVE_WAIT);
    let result = state
        .broker
        .receive(identity.service, &identity.queue, timeout, request.auto_ack)
        .await;
    match result {
        Ok(Some(delivery)) => {
            let tag = delivery
                .handle
                .map(|handle| state.deliveries.issue(handle));
            json_response(
                StatusCode::OK,
                ReceiveResponse {
                    payload: BASE64_STANDARD.encode(&delivery.payload),
                    tag,
                },
            )
        }
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

async fn available(State(state): State<AppState>, Json(request): Json<QueueRequest>) -> Response {
    let identity = match QueueIdentity::parse(&request.queue) {
        Ok(identity) => identity,
        Err(err) => return error_response(err.into()),
    };
    match state
        .broker
        .available(identity.service, &identity.queue)
        .await
    {
        Ok(snapshot) => json_response(
            StatusCode::OK,
            AvailableResponse {
                queue: request.queue,
                available: snapshot.available,
            },
        ),
        Err(err) => error_response(err),
    }
}

async fn clear(State(state): State<AppState>, Json(request): Json<QueueRequest>) -> Response {
    respond(clear_queue(&state, &request.queue).await, StatusCode::OK)
}

async fn clear_queue(state: &AppState, queue: &str) -> Result<(), BrokerError> {
    let identity = QueueIdentity::parse(queue)?;
    state
        .broker
        .clear(identity.service, &identity.queue)
        .await
        .map(|_| ())
}

async fn recover(State(state): State<AppState>, Json(request): Json<QueueRequest>) -> Response {
    respond(recover_queue(&state, &request.queue).await, StatusCode::OK)
}

/// Recovered deliveries come back with fresh tags, so the old ones are dropped.
async fn recover_queue(state: &AppState, queue: &str) -> Result<(), BrokerError> {
    let identity = QueueIdentity::parse(queue)?;
    state
        .broker
        .recover(identity.service, &identity.queue)
        .await?;
    state.deliveries.forget_queue(queue);
    Ok(())
}

async fn ack(State(state): State<AppState>, Json(request): Json<TagRequest>) -> Response {
    let result = match state.deliveries.take(request.tag) {
        Ok(handle) => state.broker.acknowledge(&handle).await,
        Err(err) => Err(err),
    };
    respond(result, StatusCode::OK)
}

async fn reject(State(state): State<AppState>, Json(request): Json<TagRequest>) -> Response {
    let result = match state.deliveries.take(request.tag) {
        Ok(handle) => state.broker.reject(&handle).await,
        Err(err) => Err(err),
    };
    respond(result, StatusCode::OK)
}

fn respond<T>(result: Result<T, BrokerError>, success: StatusCode) -> Response {
    match result {
        Ok(_) => success.into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: BrokerError) -> Response {
    let (status, code) = match &err {
        BrokerError::QuotaExceeded(_) => (StatusCode::TOO_MANY_REQUESTS, QUOTA_EXCEEDED),
        BrokerError::Malformed(_) => (StatusCode::BAD_REQUEST, "malformed_queue"),
        BrokerError::Exhausted { .. } => (StatusCode::SERVICE_UNAVAILABLE, "exhausted"),
        BrokerError::UnknownDelivery(_) => (StatusCode::NOT_FOUND, "unknown_delivery"),
        BrokerError::StaleDelivery { .. } => (StatusCode::NOT_FOUND, "stale_delivery"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    if status.is_server_error() {
        warn!("Coordinator request failed: {}", err);
    }
    json_response(status, ErrorResponse::new(code, err.to_string()))
}

fn json_response<T>(status: StatusCode, payload: T) -> Response
where
    T: Serialize,
{
    (status, Json(payload)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BackendKind;
    use uuid::Uuid;

    fn handle(queue: &str) -> DeliveryHandle {
        DeliveryHandle {
            backend: BackendKind::Peer,
            instance: Uuid::new_v4(),
            queue: queue.into(),
            tag: 1,
        }
    }

    #[tokio::test]
    async fn unsettled_tags_expire() {
        let deliveries = Deliveries::new(Duration::from_millis(30));
        let abandoned = deliveries.issue(handle("parser_default"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        let fresh = deliveries.issue(handle("parser_default"));

        assert_eq!(deliveries.handles.lock().len(), 1);
        assert!(matches!(
            deliveries.take(abandoned),
            Err(BrokerError::UnknownDelivery(tag)) if tag == abandoned
        ));
        assert_eq!(deliveries.take(fresh).unwrap().queue, "parser_default");
    }

    #[test]
    fn recover_forgets_only_that_queue() {
        let deliveries = Deliveries::new(DELIVERY_TTL);
        let parser = deliveries.issue(handle("parser_default"));
        let loader = deliveries.issue(handle("loader_default"));
        deliveries.forget_queue("parser_default");
        assert!(deliveries.take(parser).is_err());
        assert!(deliveries.take(loader).is_ok());
    }
}
