//! Protocol layer: JSON-RPC envelopes, MCP message types, and the
//! handshake state machine driven by the validation session.

pub mod jsonrpc;
pub mod mcp;
pub mod state;

pub use jsonrpc::{
    IdSequence, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId,
};
pub use mcp::{Implementation, InitializeParams, InitializeResult, ServerCapabilities};
pub use state::{HandshakeContext, HandshakeState, HandshakeTransitionError};
