//! adminbase - client access layer for schema-driven admin backends
//!
//! This library is the data-fetching core of an admin frontend: it turns a
//! declarative "call this remote method" descriptor into a deduplicated,
//! cached, authenticated HTTP round trip against a backend that addresses
//! operations as `POST /api/{package}/{class}/{method}[/{recordId}]`.
//!
//! ## Layering
//!
//! - [`session`] - process-wide token/claims state, toast and error slots
//! - [`lock`] - keyed mutual exclusion with timeout-based forced release
//! - [`api`] - the HTTP client: JSON calls, uploads, deduplicated downloads
//! - [`backend`] - descriptor resolution, TTL caching, subscribing queries
//!
//! Everything above this layer (tables, forms, field renderers) is
//! presentation logic and lives elsewhere.

pub mod api;
pub mod backend;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod lock;
pub mod session;

// Re-export commonly used types
pub use api::{ApiClient, ApiClientOptions, ApiResponse, CallOptions, Download, FilePart,
    HttpTransport, RawResponse, RequestSpec, Transport, UploadRequest};
pub use backend::{Backend, BackendCallOptions, BackendQuery, QueryState};
pub use config::{Config, ClientArgs};
pub use descriptor::MethodDescriptor;
pub use error::ApiError;
pub use lock::{KeyedLock, LockGuard};
pub use session::SessionStore;
