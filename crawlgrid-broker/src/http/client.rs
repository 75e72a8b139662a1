use crate::{
    http::types::{
        AvailableResponse, ErrorResponse, QueueRequest, ReceiveRequest, ReceiveResponse,
        SendRequest, StatusResponse, TagRequest,
    },
    BackendKind, BrokerError, Connector, Queue, QueueFactory, RawDelivery,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use log::{debug, info};
use parking_lot::Mutex;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use uuid::Uuid;

const DEFAULT_PORT: u16 = 8100;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Added to a receive's own wait so the coordinator answers before the client gives up.
const RECEIVE_SLACK: Duration = Duration::from_secs(5);

/// Accepts `host`, `host:port` or a full `http(s)://` base URL.
fn parse_address(address: &str) -> Result<Url, BrokerError> {
    let trimmed = address.trim();
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else if trimmed.contains(':') {
        format!("http://{trimmed}")
    } else {
        format!("http://{trimmed}:{DEFAULT_PORT}")
    };
    let mut url = Url::parse(&candidate)
        .map_err(|err| BrokerError::Malformed(format!("coordinator address {address}: {err}")))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn transport_error(err: reqwest::Error) -> BrokerError {
    if err.is_connect() {
        BrokerError::Fatal(err.to_string())
    } else if err.is_timeout() {
        BrokerError::Transient(err.to_string())
    } else {
        BrokerError::classify(err.to_string())
    }
}

#[derive(Clone)]
struct Endpoint {
    client: Client,
    base_url: Url,
}

impl Endpoint {
    fn url(&self, path: &str) -> Result<Url, BrokerError> {
        self.base_url
            .join(path)
            .map_err(|err| BrokerError::Internal(err.to_string()))
    }

    async fn post<T: Serialize>(
        &self,
        path: &str,
        body: &T,
        timeout: Duration,
    ) -> Result<Response, BrokerError> {
        let response = self
            .client
            .post(self.url(path)?)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await
    }

    async fn status(&self) -> Result<StatusResponse, BrokerError> {
        let response = self
            .client
            .get(self.url("status")?)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response)
            .await?
            .json::<StatusResponse>()
            .await
            .map_err(transport_error)
    }
}

/// Maps the coordinator's error replies back onto the broker taxonomy.
async fn check_status(response: Response) -> Result<Response, BrokerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let (code, message) = match response.json::<ErrorResponse>().await {
        Ok(error) => (error.code, error.message),
        Err(_) => (String::new(), status.to_string()),
    };
    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => BrokerError::QuotaExceeded(message),
        StatusCode::BAD_REQUEST => BrokerError::Malformed(message),
        // Only a settle reply names a delivery; any other 404 is a missing route.
        StatusCode::NOT_FOUND if code == "unknown_delivery" || code == "stale_delivery" => {
            debug!("Broker/Client: coordinator does not know the delivery: {}", message);
            BrokerError::UnknownDelivery(0)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            BrokerError::Transient(message)
        }
        StatusCode::SERVICE_UNAVAILABLE => BrokerError::Fatal(message),
        _ => BrokerError::classify(message),
    })
}

/// One queue on a remote coordinator, addressed by its full name.
pub struct CoordinatorQueue {
    endpoint: Endpoint,
    name: String,
}

impl CoordinatorQueue {
    fn queue_request(&self) -> QueueRequest {
        QueueRequest {
            queue: self.name.clone(),
        }
    }

    async fn settle(&self, path: &str, tag: u64) -> Result<(), BrokerError> {
        match self
            .endpoint
            .post(path, &TagRequest { tag }, REQUEST_TIMEOUT)
            .await
        {
            Ok(_) => Ok(()),
            Err(BrokerError::UnknownDelivery(_)) => Err(BrokerError::UnknownDelivery(tag)),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl Queue for CoordinatorQueue {
    async fn send(&self, message: &[u8]) -> Result<(), BrokerError> {
        let request = SendRequest {
            queue: self.name.clone(),
            payload: BASE64_STANDARD.encode(message),
        };
        self.endpoint
            .post("send", &request, REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn receive(
        &self,
        timeout: Duration,
        auto_ack: bool,
    ) -> Result<Option<RawDelivery>, BrokerError> {
        let request = ReceiveRequest {
            queue: self.name.clone(),
            timeout_ms: timeout.as_millis() as u64,
            auto_ack,
        };
        let response = self
            .endpoint
            .post("receive", &request, timeout + RECEIVE_SLACK)
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = response
            .json::<ReceiveResponse>()
            .await
            .map_err(transport_error)?;
        let payload = BASE64_STANDARD
            .decode(body.payload.as_bytes())
            .map_err(|err| BrokerError::Internal(format!("undecodable payload: {err}")))?;
        Ok(Some(RawDelivery {
            payload,
            tag: body.tag,
        }))
    }

    async fn acknowledge(&self, tag: u64) -> Result<(), BrokerError> {
        self.settle("ack", tag).await
    }

    async fn reject(&self, tag: u64) -> Result<(), BrokerError> {
        self.settle("reject", tag).await
    }

    async fn recover(&self) -> Result<(), BrokerError> {
        self.endpoint
            .post("recover", &self.queue_request(), REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn available(&self) -> Result<u64, BrokerError> {
        let response = self
            .endpoint
            .post("available", &self.queue_request(), REQUEST_TIMEOUT)
            .await?;
        response
            .json::<AvailableResponse>()
            .await
            .map(|body| body.available)
            .map_err(transport_error)
    }

    async fn clear(&self) -> Result<(), BrokerError> {
        self.endpoint
            .post("clear", &self.queue_request(), REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }
}

/// Second-tier backend delegating every queue to a remote coordinator node.
pub struct CoordinatorProxyFactory {
    instance: Uuid,
    endpoint: Endpoint,
    queues: Mutex<HashMap<String, Arc<CoordinatorQueue>>>,
}

impl CoordinatorProxyFactory {
    /// Connects to the coordinator at `address` and checks that it answers.
    pub async fn connect(address: &str) -> Result<Self, BrokerError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| BrokerError::Internal(err.to_string()))?;
        Self::with_client(client, parse_address(address)?).await
    }

    pub async fn with_client(client: Client, base_url: Url) -> Result<Self, BrokerError> {
        let endpoint = Endpoint { client, base_url };
        let status = endpoint.status().await?;
        debug!(
            "Broker/Client: coordinator {} reports {} backend(s)",
            endpoint.base_url,
            status.backends.len()
        );
        Ok(Self {
            instance: Uuid::new_v4(),
            endpoint,
            queues: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl QueueFactory for CoordinatorProxyFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::Coordinator
    }

    fn instance_id(&self) -> Uuid {
        self.instance
    }

    fn host(&self) -> String {
        self.endpoint
            .base_url
            .host_str()
            .unwrap_or_default()
            .to_string()
    }

    fn port(&self) -> u16 {
        self.endpoint
            .base_url
            .port_or_known_default()
            .unwrap_or(DEFAULT_PORT)
    }

    fn connection_url(&self) -> String {
        self.endpoint.base_url.to_string()
    }

    async fn queue(&self, name: &str) -> Result<Arc<dyn Queue>, BrokerError> {
        let queue = Arc::clone(
            self.queues
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| {
                    Arc::new(CoordinatorQueue {
                        endpoint: self.endpoint.clone(),
                        name: name.to_string(),
                    })
                }),
        );
        Ok(queue)
    }

    async fn close(&self) {
        self.queues.lock().clear();
    }
}

/// Ordered coordinator addresses; the first one answering `/status` wins.
pub struct CoordinatorConnection {
    addresses: Vec<String>,
}

impl CoordinatorConnection {
    pub fn new(addresses: Vec<String>) -> Result<Self, BrokerError> {
        for address in &addresses {
            parse_address(address)?;
        }
        Ok(Self { addresses })
    }
}

#[async_trait]
impl Connector for CoordinatorConnection {
    fn kind(&self) -> BackendKind {
        BackendKind::Coordinator
    }

    fn address(&self) -> String {
        self.addresses.join(",")
    }

    async fn connect(&self) -> Result<Arc<dyn QueueFactory>, BrokerError> {
        let mut last_error = None;
        for address in &self.addresses {
            match CoordinatorProxyFactory::connect(address).await {
                Ok(factory) => {
                    info!("Broker/Client: connected to the coordinator at {}", address);
                    return Ok(Arc::new(factory));
                }
                Err(err) => {
                    debug!("Broker/Client: coordinator {} unavailable: {}", address, err);
                    last_error = Some(err);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| BrokerError::Fatal("no coordinator address configured".into())))
    }
}
