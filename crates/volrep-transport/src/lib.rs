#![warn(missing_docs)]

//! volrep transport subsystem: framed TCP RPC to storage-driver sidecars, pooled channels, backoff

pub mod backoff;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod rpc;
pub mod tcp;

pub use backoff::{BackoffConfig, BackoffHint, BackoffPolicy};
pub use error::{Result, TransportError};
pub use protocol::{Frame, FrameFlags, FrameHeader, Opcode};
pub use registry::{
    ChannelEntry, ChannelLease, ChannelRegistry, Connector, EndpointId, RegistryConfig,
    RegistryStats, RpcConnector,
};
pub use rpc::{RpcClient, RpcClientConfig, RpcHandler, RpcServer};
pub use tcp::{TcpConnection, TcpTransport, TcpTransportConfig};
