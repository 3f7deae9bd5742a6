//! User-service host: the per-session admin channel and the factory table
//! microservices are instantiated from.
//!
//! Every connected session starts an admin fiber on a well-known port. Over
//! it, the client asks the server to start or stop microservices by numeric
//! id. Factories register explicitly in a [`ServiceRegistry`] owned by the
//! host; nothing registers itself at construction time.

pub mod admin;
pub mod registry;

pub use admin::{run_admin_server, AdminClient};
pub use registry::{Parameters, RunningService, ServiceRegistry};

use network::datagram::MICROSERVICE_PORT_MIN;

/// Well-known fiber port of the admin channel.
pub const ADMIN_PORT: u32 = MICROSERVICE_PORT_MIN + 1;

/// Numeric microservice ids. Only the admin channel and the copy server
/// ship implementations here; the remaining ids are reserved for the
/// external forwarding, process and SOCKS microservices.
pub mod service_id {
    pub const ADMIN: u32 = 1;
    pub const COPY_SERVER: u32 = 2;
    pub const DATAGRAMS_TO_FIBERS: u32 = 3;
    pub const FIBERS_TO_DATAGRAMS: u32 = 4;
    pub const SOCKETS_TO_FIBERS: u32 = 5;
    pub const FIBERS_TO_SOCKETS: u32 = 6;
    pub const PROCESS_SERVER: u32 = 7;
    pub const SOCKS_SERVER: u32 = 8;
}
