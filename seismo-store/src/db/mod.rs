//! Connection parameters and the blocking PostgreSQL session wrapper shared
//! by the registry, writer, and reader (§4.C).

pub mod connection;
pub mod credentials;
pub mod pool;

pub use connection::{Connection, ConnectionError};
pub use credentials::{Credentials, CredentialsError};
pub use pool::Pool;
