//! RPC endpoint routing

pub mod router;
pub mod stats;
pub mod transport;

pub use router::{RoutedResponse, RouterSnapshot, RpcRouter};
pub use stats::{select_order, EndpointStats};
pub use transport::{HttpTransport, JsonRpcRequest, RpcTransport, TransportFailure};
