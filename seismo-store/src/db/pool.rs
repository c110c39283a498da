//! `r2d2` pool over our own [`Connection`] (§5: "HTTP read-side handlers are
//! served from a thread pool; each handler obtains a pooled reader
//! client"). A custom [`r2d2::ManageConnection`] rather than
//! `r2d2_postgres::PostgresConnectionManager` directly, so pooled
//! connections go through the same reconnect/schema-search-path machinery
//! the writer and registry already use.

use r2d2::ManageConnection;

use super::connection::{Connection, ConnectionError};
use super::credentials::Credentials;

pub struct ConnectionManager {
    credentials: Credentials,
}

impl ConnectionManager {
    pub fn new(credentials: Credentials) -> Self {
        ConnectionManager { credentials }
    }
}

impl ManageConnection for ConnectionManager {
    type Connection = Connection;
    type Error = ConnectionError;

    fn connect(&self) -> Result<Connection, ConnectionError> {
        Connection::connect(self.credentials.clone())
    }

    fn is_valid(&self, conn: &mut Connection) -> Result<(), ConnectionError> {
        let client = conn.client_mut().ok_or(ConnectionError::NotConnected)?;
        client.simple_query("SELECT 1").map(|_| ())?;
        Ok(())
    }

    fn has_broken(&self, conn: &mut Connection) -> bool {
        !conn.is_connected()
    }
}

pub type Pool = r2d2::Pool<ConnectionManager>;

pub fn build_pool(credentials: Credentials, max_size: u32) -> Result<Pool, r2d2::Error> {
    r2d2::Pool::builder()
        .max_size(max_size)
        .build(ConnectionManager::new(credentials))
}
