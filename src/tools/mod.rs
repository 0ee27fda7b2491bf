//! 工具层：描述符、注册表、传输与调用客户端

pub mod client;
pub mod descriptor;
pub mod invocation;
pub mod registry;
pub mod transport;

pub use client::ToolClient;
pub use descriptor::{FallbackPolicy, ParamKind, ParamSpec, ToolDescriptor};
pub use invocation::{FailureReason, InvocationState, ToolInvocation};
pub use registry::{OverwritePolicy, RegistrySnapshot, ToolRegistry};
pub use transport::{
    HttpTransport, MockBehavior, MockTransport, ResponseStatus, ToolRequest, ToolResponse,
    ToolTransport, TransportError,
};
