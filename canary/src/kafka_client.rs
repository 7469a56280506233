//! Kafka Client Implementation
//!
//! This module provides a low-level Kafka client that communicates directly with Kafka brokers
//! using the Kafka protocol. It handles bootstrap connection, API version negotiation,
//! topic metadata with per-partition leader routing, and synchronous (acks=all) produce
//! requests. It implements the `BrokerClient` contract used by the canary producer.

use crate::broker::{BrokerClient, DeliveryReport};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use kafka_protocol::{
    messages::{
        api_versions_request::ApiVersionsRequest,
        api_versions_response::ApiVersionsResponse,
        metadata_request::{MetadataRequest, MetadataRequestTopic},
        metadata_response::MetadataResponse,
        produce_request::{PartitionProduceData, ProduceRequest, TopicProduceData},
        produce_response::ProduceResponse,
        ApiKey, RequestHeader, ResponseHeader, TopicName,
    },
    protocol::{Decodable, Encodable, StrBytes},
    records::{Compression, Record, RecordBatchEncoder, RecordEncodeOptions, TimestampType},
};
use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    io::ErrorKind,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{Mutex, RwLock},
    time::{sleep, timeout, Duration},
};
use tracing::{debug, info, warn};

/// Number of rounds over the bootstrap list before giving up at startup
const CONNECT_ATTEMPTS: u32 = 10;

/// Upper bound on a single response frame
const MAX_RESPONSE_SIZE: usize = 100 * 1024 * 1024;

/// Settings for the Kafka client
#[derive(Debug, Clone)]
pub struct KafkaClientConfig {
    /// Bootstrap broker addresses in "host:port" format
    pub bootstrap_servers: Vec<String>,
    /// Client id sent in every request header
    pub client_id: String,
    /// Maximum time to wait for any single request, including produce acknowledgement
    pub request_timeout: Duration,
}

/// A single TCP connection to one broker
///
/// Requests on a connection are strictly sequential: the stream lock is held
/// from writing the request until the full response has been read.
struct BrokerConnection {
    /// Broker address in "host:port" format
    address: String,
    stream: Mutex<TcpStream>,
    /// Set after an I/O error, timeout or correlation mismatch; the connection
    /// is replaced on next use
    broken: AtomicBool,
}

impl BrokerConnection {
    /// Connects to `address`, giving up once `connect_timeout` elapses
    async fn open(address: &str, connect_timeout: Duration) -> Result<Self> {
        let stream = within(
            connect_timeout,
            || format!("Connecting to Kafka broker at {}", address),
            async {
                TcpStream::connect(address)
                    .await
                    .map_err(|e| anyhow!("Failed to connect to Kafka broker at {}: {}", address, e))
            },
        )
        .await?;
        stream.set_nodelay(true)?;
        debug!("Connected to Kafka broker at {}", address);
        Ok(Self {
            address: address.to_string(),
            stream: Mutex::new(stream),
            broken: AtomicBool::new(false),
        })
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    /// Writes a framed request and reads the framed response body
    async fn round_trip(&self, frame: &[u8]) -> Result<Bytes> {
        let mut stream = self.stream.lock().await;
        stream
            .write_all(frame)
            .await
            .map_err(|e| anyhow!("Failed to write request to {}: {}", self.address, e))?;

        let mut size_buf = [0u8; 4];
        stream.read_exact(&mut size_buf).await.map_err(|e| {
            anyhow!(
                "Failed to read response size from {}: {} (the broker may have closed the connection)",
                self.address,
                e
            )
        })?;

        let response_size = i32::from_be_bytes(size_buf);
        if response_size < 0 || response_size as usize > MAX_RESPONSE_SIZE {
            return Err(anyhow!("Invalid response size: {} bytes", response_size));
        }

        let mut response_buf = vec![0u8; response_size as usize];
        stream
            .read_exact(&mut response_buf)
            .await
            .map_err(|e| anyhow!("Failed to read response body from {}: {}", self.address, e))?;
        Ok(Bytes::from(response_buf))
    }

    async fn shutdown(&self) -> Result<()> {
        if self.is_broken() {
            return Ok(());
        }
        let mut stream = self.stream.lock().await;
        match stream.shutdown().await {
            Ok(()) => Ok(()),
            // The broker already dropped the connection, nothing is left to flush
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(anyhow!("Failed to close connection to {}: {}", self.address, e)),
        }
    }
}

/// Low-level Kafka client for direct broker communication
///
/// This client keeps a bootstrap connection for cluster-wide requests and one
/// connection per partition leader for produce requests. Leadership comes from
/// the last metadata refresh.
pub struct KafkaClient {
    config: KafkaClientConfig,

    /// Monotonically increasing correlation ID shared by all connections
    correlation_id: AtomicU64,

    /// Supported API versions discovered from the bootstrap broker
    /// Maps API key (i16) to (min_version, max_version) tuple
    pub api_versions: HashMap<i16, (i16, i16)>,

    /// Connection used for ApiVersions and Metadata requests
    bootstrap: Mutex<Arc<BrokerConnection>>,

    /// Broker node id to "host:port", from the last metadata response
    brokers: RwLock<HashMap<i32, String>>,

    /// Topic name to partition index to leader node id (-1 when leaderless)
    leaders: RwLock<HashMap<String, BTreeMap<i32, i32>>>,

    /// Open connections to partition leaders, by node id
    connections: Mutex<HashMap<i32, Arc<BrokerConnection>>>,

    closed: AtomicBool,
}

impl KafkaClient {
    /// Connects to the first reachable bootstrap broker and discovers supported API versions
    ///
    /// # Arguments
    /// * `config` - Bootstrap servers, client id and request timeout
    ///
    /// # Returns
    /// * `Ok(KafkaClient)` - Client ready for metadata and produce requests
    /// * `Err(anyhow::Error)` - If no bootstrap broker is reachable or version discovery fails
    pub async fn connect(config: KafkaClientConfig) -> Result<Self> {
        if config.bootstrap_servers.is_empty() {
            return Err(anyhow!("No bootstrap servers configured"));
        }
        info!(
            "Connecting to Kafka cluster at {}",
            config.bootstrap_servers.join(",")
        );

        let bootstrap = Self::connect_with_retry(
            &config.bootstrap_servers,
            CONNECT_ATTEMPTS,
            config.request_timeout,
        )
        .await?;
        info!("Successfully connected to Kafka broker at {}", bootstrap.address);

        let mut client = KafkaClient {
            config,
            correlation_id: AtomicU64::new(1),
            api_versions: HashMap::new(),
            bootstrap: Mutex::new(Arc::new(bootstrap)),
            brokers: RwLock::new(HashMap::new()),
            leaders: RwLock::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        };

        client.discover_api_versions().await?;

        Ok(client)
    }

    /// Tries every bootstrap server in turn, retrying the whole list every second
    async fn connect_with_retry(
        servers: &[String],
        max_attempts: u32,
        connect_timeout: Duration,
    ) -> Result<BrokerConnection> {
        let retry_interval = Duration::from_secs(1);
        let mut last_error = anyhow!("No bootstrap servers configured");

        for attempt in 1..=max_attempts {
            for server in servers {
                match BrokerConnection::open(server, connect_timeout).await {
                    Ok(connection) => {
                        if attempt > 1 {
                            info!("Successfully connected to {} on attempt {}", server, attempt);
                        }
                        return Ok(connection);
                    }
                    Err(e) => last_error = e,
                }
            }

            if attempt < max_attempts {
                warn!(
                    "Connection attempt {} failed, retrying in 1 second: {}",
                    attempt, last_error
                );
                sleep(retry_interval).await;
            }
        }

        Err(anyhow!(
            "Failed to connect to any bootstrap server after {} attempts: {}",
            max_attempts,
            last_error
        ))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("Kafka client is closed"));
        }
        Ok(())
    }

    /// Returns the bootstrap connection, reconnecting once if it broke
    async fn bootstrap_connection(&self) -> Result<Arc<BrokerConnection>> {
        self.ensure_open()?;
        let mut bootstrap = self.bootstrap.lock().await;
        if bootstrap.is_broken() {
            debug!("Bootstrap connection to {} is broken, reconnecting", bootstrap.address);
            *bootstrap = Arc::new(
                Self::connect_with_retry(&self.config.bootstrap_servers, 1, self.config.request_timeout).await?,
            );
        }
        Ok(bootstrap.clone())
    }

    /// Returns a healthy connection to broker `node_id`, opening one if needed
    async fn leader_connection(&self, node_id: i32) -> Result<Arc<BrokerConnection>> {
        self.ensure_open()?;
        let mut connections = self.connections.lock().await;
        if let Some(connection) = connections.get(&node_id) {
            if !connection.is_broken() {
                return Ok(connection.clone());
            }
        }

        let address = self
            .brokers
            .read()
            .await
            .get(&node_id)
            .cloned()
            .ok_or_else(|| anyhow!("Broker {} is not present in cluster metadata", node_id))?;
        let connection = Arc::new(BrokerConnection::open(&address, self.config.request_timeout).await?);
        connections.insert(node_id, connection.clone());
        Ok(connection)
    }

    /// Sends a request on `connection` and decodes the matching response
    ///
    /// The round trip is bounded by the configured request timeout. On timeout,
    /// I/O error or correlation mismatch the connection is marked broken.
    async fn call<Req, Resp>(
        &self,
        connection: &BrokerConnection,
        api_key: ApiKey,
        request: &Req,
        version: i16,
    ) -> Result<Resp>
    where
        Req: Encodable + Sync,
        Resp: Decodable,
    {
        let correlation_id = self.correlation_id.fetch_add(1, Ordering::SeqCst) as i32;
        debug!(
            "Sending {:?} request to {} (correlation_id: {}, version: {})",
            api_key, connection.address, correlation_id, version
        );

        let frame = encode_request(api_key, request, version, correlation_id, &self.config.client_id)?;

        let response_bytes = match within(
            self.config.request_timeout,
            || format!("{:?} request to {}", api_key, connection.address),
            connection.round_trip(&frame),
        )
        .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                connection.mark_broken();
                return Err(e);
            }
        };

        let mut cursor = std::io::Cursor::new(response_bytes.as_ref());
        let header = ResponseHeader::decode(&mut cursor, api_key.response_header_version(version))
            .map_err(|e| anyhow!("Failed to decode {:?} response header: {}", api_key, e))?;
        if header.correlation_id != correlation_id {
            connection.mark_broken();
            return Err(anyhow!(
                "Correlation id mismatch from {}: expected {}, got {}",
                connection.address,
                correlation_id,
                header.correlation_id
            ));
        }

        Resp::decode(&mut cursor, version)
            .map_err(|e| anyhow!("Failed to decode {:?} response: {}", api_key, e))
    }

    /// Discovers and caches the broker's supported API versions
    async fn discover_api_versions(&mut self) -> Result<()> {
        debug!("Discovering supported API versions...");

        // Version 0 is universally supported
        let connection = self.bootstrap_connection().await?;
        let response: ApiVersionsResponse = self
            .call(&connection, ApiKey::ApiVersions, &ApiVersionsRequest::default(), 0)
            .await?;
        if response.error_code != 0 {
            return Err(anyhow!(
                "ApiVersions request failed: {}",
                describe_error_code(response.error_code)
            ));
        }

        for api_version in response.api_keys {
            self.api_versions.insert(
                api_version.api_key,
                (api_version.min_version, api_version.max_version),
            );
        }

        debug!("Discovered {} supported APIs", self.api_versions.len());
        Ok(())
    }

    /// Selects a compatible protocol version for the given API
    ///
    /// Uses the preferred version when the broker supports it, otherwise the broker's
    /// maximum. Falls back to the preferred version if the API wasn't discovered.
    pub fn get_supported_version(&self, api_key: ApiKey, preferred_version: i16) -> i16 {
        if let Some((min_version, max_version)) = self.api_versions.get(&(api_key as i16)) {
            if preferred_version >= *min_version && preferred_version <= *max_version {
                preferred_version
            } else {
                debug!(
                    "Preferred version {} for {:?} not supported (range: {}-{}), using {}",
                    preferred_version, api_key, min_version, max_version, max_version
                );
                *max_version
            }
        } else {
            warn!(
                "API {:?} not found in version discovery, using version {}",
                api_key, preferred_version
            );
            preferred_version
        }
    }

    /// Leader node id of `topic`/`partition` from the last metadata refresh
    async fn leader_for(&self, topic: &str, partition: i32) -> Result<i32> {
        let leaders = self.leaders.read().await;
        let partitions = leaders
            .get(topic)
            .ok_or_else(|| anyhow!("No metadata for topic '{}'", topic))?;
        match partitions.get(&partition) {
            Some(leader) if *leader >= 0 => Ok(*leader),
            Some(_) => Err(anyhow!(
                "LEADER_NOT_AVAILABLE: partition {} of '{}' has no leader",
                partition,
                topic
            )),
            None => Err(anyhow!(
                "UNKNOWN_TOPIC_OR_PARTITION: partition {} not found in metadata for '{}'",
                partition,
                topic
            )),
        }
    }
}

#[async_trait]
impl BrokerClient for KafkaClient {
    async fn send_sync(&self, topic: &str, partition: i32, payload: Bytes) -> Result<DeliveryReport> {
        let leader = self.leader_for(topic, partition).await?;
        let connection = self.leader_connection(leader).await?;

        let timestamp = chrono::Utc::now().timestamp_millis();
        let request = build_produce_request(
            topic,
            partition,
            payload,
            timestamp,
            produce_timeout_ms(self.config.request_timeout),
        )?;
        let version = self.get_supported_version(ApiKey::Produce, 3);

        let response: ProduceResponse = self
            .call(&connection, ApiKey::Produce, &request, version)
            .await
            .with_context(|| format!("Produce to partition {} of '{}' failed", partition, topic))?;
        parse_produce_response(&response, topic, partition)
    }

    async fn refresh_metadata(&self, topic: &str) -> Result<()> {
        let mut request = MetadataRequest::default();
        let mut requested_topic = MetadataRequestTopic::default();
        requested_topic.name = Some(TopicName(StrBytes::from_string(topic.to_string())));
        request.topics = Some(vec![requested_topic]);

        let version = self.get_supported_version(ApiKey::Metadata, 1);
        let connection = self.bootstrap_connection().await?;
        let response: MetadataResponse = self
            .call(&connection, ApiKey::Metadata, &request, version)
            .await
            .with_context(|| format!("Metadata request for '{}' failed", topic))?;

        let (brokers, partitions) = parse_metadata_response(&response, topic)?;
        debug!(
            "Metadata for '{}': {} partitions, {} brokers",
            topic,
            partitions.len(),
            brokers.len()
        );

        // Drop leader connections whose broker left or moved
        self.connections
            .lock()
            .await
            .retain(|node_id, connection| brokers.get(node_id) == Some(&connection.address));

        *self.brokers.write().await = brokers;
        self.leaders.write().await.insert(topic.to_string(), partitions);
        Ok(())
    }

    async fn partition_count(&self, topic: &str) -> Option<i32> {
        self.leaders
            .read()
            .await
            .get(topic)
            .map(|partitions| partitions.len() as i32)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Kafka client already closed");
            return Ok(());
        }

        let mut connections: Vec<Arc<BrokerConnection>> =
            self.connections.lock().await.drain().map(|(_, c)| c).collect();
        connections.push(self.bootstrap.lock().await.clone());

        let mut first_error = None;
        for connection in connections {
            if let Err(e) = connection.shutdown().await {
                warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Awaits `fut`, failing with "<what> timed out after N ms" once `limit` elapses
async fn within<T, F>(limit: Duration, what: impl FnOnce() -> String, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("{} timed out after {} ms", what(), limit.as_millis())),
    }
}

/// Broker-side produce timeout, saturating at the protocol's `i32` range
pub fn produce_timeout_ms(request_timeout: Duration) -> i32 {
    i32::try_from(request_timeout.as_millis()).unwrap_or(i32::MAX)
}

/// Encodes header and body into a length-prefixed request frame
pub fn encode_request<T: Encodable>(
    api_key: ApiKey,
    request: &T,
    version: i16,
    correlation_id: i32,
    client_id: &str,
) -> Result<Vec<u8>> {
    let mut header = RequestHeader::default();
    header.request_api_key = api_key as i16;
    header.request_api_version = version;
    header.correlation_id = correlation_id;
    header.client_id = Some(StrBytes::from_string(client_id.to_string()));

    let mut buf = Vec::new();
    header
        .encode(&mut buf, api_key.request_header_version(version))
        .map_err(|e| anyhow!("Failed to encode request header: {}", e))?;
    request
        .encode(&mut buf, version)
        .map_err(|e| anyhow!("Failed to encode request body: {}", e))?;

    // Kafka protocol uses 4-byte big-endian length prefix
    let mut frame = Vec::with_capacity(4 + buf.len());
    frame.extend_from_slice(&(buf.len() as i32).to_be_bytes());
    frame.extend_from_slice(&buf);
    Ok(frame)
}

/// Builds an acks=all produce request carrying one record for one partition
pub fn build_produce_request(
    topic: &str,
    partition: i32,
    payload: Bytes,
    timestamp: i64,
    timeout_ms: i32,
) -> Result<ProduceRequest> {
    // NOTE: offset is always 0 in PRODUCE requests, the broker assigns the actual offset
    let record = Record {
        transactional: false,
        control: false,
        partition_leader_epoch: 0,
        producer_id: -1,
        producer_epoch: -1,
        timestamp_type: TimestampType::Creation,
        offset: 0,
        sequence: -1,
        timestamp,
        key: None,
        value: Some(payload),
        headers: indexmap::IndexMap::new(),
    };

    let options = RecordEncodeOptions {
        version: 2,
        compression: Compression::None,
    };
    let mut batch_buf = bytes::BytesMut::new();
    RecordBatchEncoder::encode(&mut batch_buf, [&record], &options)
        .map_err(|e| anyhow!("Failed to encode record batch: {}", e))?;

    let mut partition_data = PartitionProduceData::default();
    partition_data.index = partition;
    partition_data.records = Some(batch_buf.freeze());

    let mut topic_data = TopicProduceData::default();
    topic_data.name = TopicName(StrBytes::from_string(topic.to_string()));
    topic_data.partition_data.push(partition_data);

    let mut request = ProduceRequest::default();
    request.acks = -1;
    request.timeout_ms = timeout_ms;
    request.topic_data.push(topic_data);
    Ok(request)
}

/// Extracts the delivery report for `partition` from a produce response
pub fn parse_produce_response(
    response: &ProduceResponse,
    topic: &str,
    partition: i32,
) -> Result<DeliveryReport> {
    let partition_response = response
        .responses
        .iter()
        .filter(|t| t.name.0.as_str() == topic)
        .flat_map(|t| t.partition_responses.iter())
        .find(|p| p.index == partition)
        .ok_or_else(|| {
            anyhow!(
                "Produce response has no result for partition {} of '{}'",
                partition,
                topic
            )
        })?;

    if partition_response.error_code != 0 {
        return Err(anyhow!(
            "{} on partition {} of '{}'",
            describe_error_code(partition_response.error_code),
            partition,
            topic
        ));
    }

    Ok(DeliveryReport {
        partition: partition_response.index,
        offset: partition_response.base_offset,
    })
}

/// Extracts broker addresses and partition leaders for `topic` from a metadata response
pub fn parse_metadata_response(
    response: &MetadataResponse,
    topic: &str,
) -> Result<(HashMap<i32, String>, BTreeMap<i32, i32>)> {
    let brokers = response
        .brokers
        .iter()
        .map(|b| (b.node_id.0, format!("{}:{}", b.host.as_str(), b.port)))
        .collect();

    let topic_metadata = response
        .topics
        .iter()
        .find(|t| t.name.as_ref().map(|n| n.0.as_str()) == Some(topic))
        .ok_or_else(|| anyhow!("Topic '{}' not found in metadata response", topic))?;

    if topic_metadata.error_code != 0 {
        return Err(anyhow!(
            "Metadata for '{}' returned {}",
            topic,
            describe_error_code(topic_metadata.error_code)
        ));
    }

    let mut partitions = BTreeMap::new();
    for partition in &topic_metadata.partitions {
        if partition.error_code != 0 {
            debug!(
                "Partition {} of '{}' reported {}",
                partition.partition_index,
                topic,
                describe_error_code(partition.error_code)
            );
        }
        partitions.insert(partition.partition_index, partition.leader_id.0);
    }

    Ok((brokers, partitions))
}

/// Maps a Kafka error code to its protocol name
pub fn describe_error_code(code: i16) -> String {
    let name = match code {
        -1 => "UNKNOWN_SERVER_ERROR",
        0 => "NONE",
        1 => "OFFSET_OUT_OF_RANGE",
        2 => "CORRUPT_MESSAGE",
        3 => "UNKNOWN_TOPIC_OR_PARTITION",
        5 => "LEADER_NOT_AVAILABLE",
        6 => "NOT_LEADER_OR_FOLLOWER",
        7 => "REQUEST_TIMED_OUT",
        8 => "BROKER_NOT_AVAILABLE",
        9 => "REPLICA_NOT_AVAILABLE",
        10 => "MESSAGE_TOO_LARGE",
        13 => "NETWORK_EXCEPTION",
        17 => "INVALID_TOPIC_EXCEPTION",
        19 => "NOT_ENOUGH_REPLICAS",
        20 => "NOT_ENOUGH_REPLICAS_AFTER_APPEND",
        21 => "INVALID_REQUIRED_ACKS",
        29 => "TOPIC_AUTHORIZATION_FAILED",
        35 => "UNSUPPORTED_VERSION",
        74 => "FENCED_LEADER_EPOCH",
        87 => "INVALID_RECORD",
        _ => return format!("Unknown Kafka error code: {}", code),
    };
    name.to_string()
}
