//! Native transport protocol.
//!
//! Every message is one frame: a 4-byte big-endian payload length followed by
//! the postcard-encoded payload. A connection starts with
//! [`TransportRequest::Handshake`]; a node answers requests only after a
//! handshake that names its own cluster.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Mutex;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use quarry_types::{
    ClusterHealth, ClusterStateSnapshot, DeleteResponse, GetResponse, IndexResponse, Query,
    SearchRequest, SearchResponse, Settings,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{Client, EngineError, EngineResult};

/// Size of the length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest accepted frame payload.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Request sent over the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportRequest {
    Handshake {
        cluster_name: String,
    },
    CreateIndex {
        index: String,
        settings: Settings,
    },
    PutMapping {
        index: String,
        doc_type: String,
        mapping: String,
    },
    IndexExists {
        index: String,
    },
    DeleteIndex {
        index: String,
    },
    Index {
        index: String,
        doc_type: String,
        id: Option<String>,
        source: String,
    },
    Get {
        index: String,
        doc_type: String,
        id: String,
    },
    Delete {
        index: String,
        doc_type: String,
        id: String,
    },
    Search(SearchRequest),
    Count {
        index: Option<String>,
        doc_type: Option<String>,
        query: Query,
    },
    Refresh {
        index: Option<String>,
    },
    Flush {
        index: Option<String>,
    },
    Optimize {
        index: Option<String>,
        only_expunge_deletes: bool,
    },
    ClusterHealth {
        index: Option<String>,
    },
    ClusterState,
}

impl TransportRequest {
    fn op(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::CreateIndex { .. } => "create_index",
            Self::PutMapping { .. } => "put_mapping",
            Self::IndexExists { .. } => "index_exists",
            Self::DeleteIndex { .. } => "delete_index",
            Self::Index { .. } => "index",
            Self::Get { .. } => "get",
            Self::Delete { .. } => "delete",
            Self::Search(_) => "search",
            Self::Count { .. } => "count",
            Self::Refresh { .. } => "refresh",
            Self::Flush { .. } => "flush",
            Self::Optimize { .. } => "optimize",
            Self::ClusterHealth { .. } => "cluster_health",
            Self::ClusterState => "cluster_state",
        }
    }
}

/// Response sent over the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportResponse {
    HandshakeAck { node_name: String },
    Ack,
    Exists(bool),
    Indexed(IndexResponse),
    Got(GetResponse),
    Deleted(DeleteResponse),
    Search(SearchResponse),
    Count(u64),
    Health(ClusterHealth),
    State(ClusterStateSnapshot),
    Error(RemoteError),
}

/// Error carried across the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteError {
    IndexAlreadyExists(String),
    IndexNotFound(String),
    NodeClosed(String),
    NoMaster,
    InvalidDocument(String),
    ClusterNameMismatch { expected: String, actual: String },
    Protocol(String),
    Other(String),
}

impl From<&EngineError> for RemoteError {
    fn from(error: &EngineError) -> Self {
        match error {
            EngineError::IndexAlreadyExists(index) => Self::IndexAlreadyExists(index.clone()),
            EngineError::IndexNotFound(index) => Self::IndexNotFound(index.clone()),
            EngineError::NodeClosed(node) => Self::NodeClosed(node.clone()),
            EngineError::NoMaster => Self::NoMaster,
            EngineError::InvalidDocument(reason) => Self::InvalidDocument(reason.clone()),
            EngineError::ClusterNameMismatch { expected, actual } => Self::ClusterNameMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            EngineError::Protocol(reason) => Self::Protocol(reason.clone()),
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<RemoteError> for EngineError {
    fn from(error: RemoteError) -> Self {
        match error {
            RemoteError::IndexAlreadyExists(index) => Self::IndexAlreadyExists(index),
            RemoteError::IndexNotFound(index) => Self::IndexNotFound(index),
            RemoteError::NodeClosed(node) => Self::NodeClosed(node),
            RemoteError::NoMaster => Self::NoMaster,
            RemoteError::InvalidDocument(reason) => Self::InvalidDocument(reason),
            RemoteError::ClusterNameMismatch { expected, actual } => {
                Self::ClusterNameMismatch { expected, actual }
            }
            RemoteError::Protocol(reason) => Self::Protocol(reason),
            RemoteError::Other(message) => Self::Remote(message),
        }
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Appends one frame holding `message` to `dst`.
pub fn encode_frame<T: Serialize>(message: &T, dst: &mut BytesMut) -> EngineResult<()> {
    let payload = postcard::to_allocvec(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(EngineError::Protocol(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            payload.len()
        )));
    }
    dst.reserve(FRAME_HEADER_SIZE + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(&payload);
    Ok(())
}

/// Takes one complete frame off the front of `src`, if there is one.
pub fn decode_frame<T: DeserializeOwned>(src: &mut BytesMut) -> EngineResult<Option<T>> {
    if src.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(EngineError::Protocol(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }
    if src.len() < FRAME_HEADER_SIZE + len {
        return Ok(None);
    }
    src.advance(FRAME_HEADER_SIZE);
    let payload = src.split_to(len);
    Ok(Some(postcard::from_bytes(&payload)?))
}

fn write_frame<T: Serialize>(stream: &mut TcpStream, message: &T) -> EngineResult<()> {
    let mut buf = BytesMut::new();
    encode_frame(message, &mut buf)?;
    stream.write_all(&buf)?;
    Ok(())
}

fn read_frame<T: DeserializeOwned>(stream: &mut TcpStream) -> EngineResult<T> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    stream.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(EngineError::Protocol(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(postcard::from_bytes(&payload)?)
}

// ============================================================================
// Server side
// ============================================================================

/// Checks a connection's first request.
///
/// Returns the response to send and whether the connection may proceed.
pub(crate) fn accept_handshake(
    request: &TransportRequest,
    cluster_name: &str,
    node_name: &str,
) -> (TransportResponse, bool) {
    match request {
        TransportRequest::Handshake {
            cluster_name: actual,
        } if actual == cluster_name => (
            TransportResponse::HandshakeAck {
                node_name: node_name.to_string(),
            },
            true,
        ),
        TransportRequest::Handshake {
            cluster_name: actual,
        } => (
            TransportResponse::Error(RemoteError::ClusterNameMismatch {
                expected: cluster_name.to_string(),
                actual: actual.clone(),
            }),
            false,
        ),
        other => (
            TransportResponse::Error(RemoteError::Protocol(format!(
                "expected handshake, got {}",
                other.op()
            ))),
            false,
        ),
    }
}

/// Serves one request through `client`.
#[instrument(skip_all, fields(op = request.op()))]
pub(crate) fn dispatch(client: &dyn Client, request: TransportRequest) -> TransportResponse {
    match dispatch_inner(client, request) {
        Ok(response) => response,
        Err(e) => {
            debug!(error = %e, "transport request failed");
            TransportResponse::Error(RemoteError::from(&e))
        }
    }
}

fn dispatch_inner(client: &dyn Client, request: TransportRequest) -> EngineResult<TransportResponse> {
    Ok(match request {
        TransportRequest::Handshake { .. } => {
            return Err(EngineError::Protocol("duplicate handshake".to_string()));
        }
        TransportRequest::CreateIndex { index, settings } => {
            client.create_index(&index, &settings)?;
            TransportResponse::Ack
        }
        TransportRequest::PutMapping {
            index,
            doc_type,
            mapping,
        } => {
            client.put_mapping(&index, &doc_type, &mapping)?;
            TransportResponse::Ack
        }
        TransportRequest::IndexExists { index } => {
            TransportResponse::Exists(client.index_exists(&index)?)
        }
        TransportRequest::DeleteIndex { index } => {
            client.delete_index(&index)?;
            TransportResponse::Ack
        }
        TransportRequest::Index {
            index,
            doc_type,
            id,
            source,
        } => TransportResponse::Indexed(client.index(&index, &doc_type, id.as_deref(), &source)?),
        TransportRequest::Get {
            index,
            doc_type,
            id,
        } => TransportResponse::Got(client.get(&index, &doc_type, &id)?),
        TransportRequest::Delete {
            index,
            doc_type,
            id,
        } => TransportResponse::Deleted(client.delete(&index, &doc_type, &id)?),
        TransportRequest::Search(search) => TransportResponse::Search(client.search(&search)?),
        TransportRequest::Count {
            index,
            doc_type,
            query,
        } => TransportResponse::Count(client.count(index.as_deref(), doc_type.as_deref(), &query)?),
        TransportRequest::Refresh { index } => {
            client.refresh(index.as_deref())?;
            TransportResponse::Ack
        }
        TransportRequest::Flush { index } => {
            client.flush(index.as_deref())?;
            TransportResponse::Ack
        }
        TransportRequest::Optimize {
            index,
            only_expunge_deletes,
        } => {
            client.optimize(index.as_deref(), only_expunge_deletes)?;
            TransportResponse::Ack
        }
        TransportRequest::ClusterHealth { index } => {
            TransportResponse::Health(client.cluster_health(index.as_deref())?)
        }
        TransportRequest::ClusterState => TransportResponse::State(client.cluster_state()?),
    })
}

// ============================================================================
// Client side
// ============================================================================

/// Client that talks to a node over the native transport.
///
/// The connection is owned by the client; dropping it closes the socket.
#[derive(Debug)]
pub struct TransportClient {
    stream: Mutex<TcpStream>,
    peer: SocketAddr,
    node_name: String,
}

impl TransportClient {
    /// Connects to `addr` and performs the handshake for `cluster_name`.
    pub fn connect(addr: SocketAddr, cluster_name: &str) -> EngineResult<Self> {
        Self::connect_timeout(addr, cluster_name, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn connect_timeout(
        addr: SocketAddr,
        cluster_name: &str,
        timeout: Duration,
    ) -> EngineResult<Self> {
        let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        write_frame(
            &mut stream,
            &TransportRequest::Handshake {
                cluster_name: cluster_name.to_string(),
            },
        )?;
        let node_name = match read_frame(&mut stream)? {
            TransportResponse::HandshakeAck { node_name } => node_name,
            TransportResponse::Error(e) => return Err(e.into()),
            other => {
                return Err(EngineError::Protocol(format!(
                    "unexpected handshake response: {other:?}"
                )));
            }
        };
        debug!(%addr, node = %node_name, "transport client connected");

        Ok(Self {
            stream: Mutex::new(stream),
            peer: addr,
            node_name,
        })
    }

    /// Name of the node that accepted the handshake.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn call(&self, request: &TransportRequest) -> EngineResult<TransportResponse> {
        let mut stream = self
            .stream
            .lock()
            .map_err(|_| EngineError::internal("transport stream lock poisoned"))?;
        write_frame(&mut stream, request)?;
        match read_frame(&mut stream)? {
            TransportResponse::Error(e) => Err(e.into()),
            response => Ok(response),
        }
    }

    fn ack(&self, request: &TransportRequest) -> EngineResult<()> {
        match self.call(request)? {
            TransportResponse::Ack => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &TransportResponse) -> EngineError {
    EngineError::Protocol(format!("unexpected response: {response:?}"))
}

impl Client for TransportClient {
    fn create_index(&self, index: &str, settings: &Settings) -> EngineResult<()> {
        self.ack(&TransportRequest::CreateIndex {
            index: index.to_string(),
            settings: settings.clone(),
        })
    }

    fn put_mapping(&self, index: &str, doc_type: &str, mapping: &str) -> EngineResult<()> {
        self.ack(&TransportRequest::PutMapping {
            index: index.to_string(),
            doc_type: doc_type.to_string(),
            mapping: mapping.to_string(),
        })
    }

    fn index_exists(&self, index: &str) -> EngineResult<bool> {
        match self.call(&TransportRequest::IndexExists {
            index: index.to_string(),
        })? {
            TransportResponse::Exists(exists) => Ok(exists),
            other => Err(unexpected(&other)),
        }
    }

    fn delete_index(&self, index: &str) -> EngineResult<()> {
        self.ack(&TransportRequest::DeleteIndex {
            index: index.to_string(),
        })
    }

    fn index(
        &self,
        index: &str,
        doc_type: &str,
        id: Option<&str>,
        source: &str,
    ) -> EngineResult<IndexResponse> {
        match self.call(&TransportRequest::Index {
            index: index.to_string(),
            doc_type: doc_type.to_string(),
            id: id.map(str::to_string),
            source: source.to_string(),
        })? {
            TransportResponse::Indexed(response) => Ok(response),
            other => Err(unexpected(&other)),
        }
    }

    fn get(&self, index: &str, doc_type: &str, id: &str) -> EngineResult<GetResponse> {
        match self.call(&TransportRequest::Get {
            index: index.to_string(),
            doc_type: doc_type.to_string(),
            id: id.to_string(),
        })? {
            TransportResponse::Got(response) => Ok(response),
            other => Err(unexpected(&other)),
        }
    }

    fn delete(&self, index: &str, doc_type: &str, id: &str) -> EngineResult<DeleteResponse> {
        match self.call(&TransportRequest::Delete {
            index: index.to_string(),
            doc_type: doc_type.to_string(),
            id: id.to_string(),
        })? {
            TransportResponse::Deleted(response) => Ok(response),
            other => Err(unexpected(&other)),
        }
    }

    fn search(&self, request: &SearchRequest) -> EngineResult<SearchResponse> {
        match self.call(&TransportRequest::Search(request.clone()))? {
            TransportResponse::Search(response) => Ok(response),
            other => Err(unexpected(&other)),
        }
    }

    fn count(
        &self,
        index: Option<&str>,
        doc_type: Option<&str>,
        query: &Query,
    ) -> EngineResult<u64> {
        match self.call(&TransportRequest::Count {
            index: index.map(str::to_string),
            doc_type: doc_type.map(str::to_string),
            query: query.clone(),
        })? {
            TransportResponse::Count(count) => Ok(count),
            other => Err(unexpected(&other)),
        }
    }

    fn refresh(&self, index: Option<&str>) -> EngineResult<()> {
        self.ack(&TransportRequest::Refresh {
            index: index.map(str::to_string),
        })
    }

    fn flush(&self, index: Option<&str>) -> EngineResult<()> {
        self.ack(&TransportRequest::Flush {
            index: index.map(str::to_string),
        })
    }

    fn optimize(&self, index: Option<&str>, only_expunge_deletes: bool) -> EngineResult<()> {
        self.ack(&TransportRequest::Optimize {
            index: index.map(str::to_string),
            only_expunge_deletes,
        })
    }

    fn cluster_health(&self, index: Option<&str>) -> EngineResult<ClusterHealth> {
        match self.call(&TransportRequest::ClusterHealth {
            index: index.map(str::to_string),
        })? {
            TransportResponse::Health(health) => Ok(health),
            other => Err(unexpected(&other)),
        }
    }

    fn cluster_state(&self) -> EngineResult<ClusterStateSnapshot> {
        match self.call(&TransportRequest::ClusterState)? {
            TransportResponse::State(state) => Ok(state),
            other => Err(unexpected(&other)),
        }
    }
}
