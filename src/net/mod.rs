//! Transport layer: the named socket registry, TLS setup and literal HTTP/1.1.

pub mod http;
pub mod registry;
pub mod tls;

pub use http::{HttpRequest, HttpResponse};
pub use registry::{
    AddressFamily, SocketId, SocketKind, SocketRef, SocketRegistry, SocketStatus, ACCEPTED_CONNECTION,
    DEFAULT_CAPACITY,
};
