//! A single blocking PostgreSQL session with the escalating reconnect
//! schedule used throughout the writer threads.

use std::time::Duration;

use postgres::{Client, NoTls};
use tracing::{info, warn};

use super::credentials::Credentials;

/// `{0s, 15s, 60s}`: the delay before each successive reconnect attempt.
/// Once exhausted, the schedule repeats at the last (longest) delay.
const RECONNECT_SCHEDULE: &[Duration] = &[
    Duration::from_secs(0),
    Duration::from_secs(15),
    Duration::from_secs(60),
];

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Credentials(#[from] super::credentials::CredentialsError),
    #[error("postgres: {0}")]
    Postgres(#[from] postgres::Error),
    #[error("reconnect aborted: shutdown requested")]
    ShuttingDown,
    #[error("connection is closed")]
    NotConnected,
}

pub struct Connection {
    client: Option<Client>,
    credentials: Credentials,
}

impl Connection {
    /// Connects once, with no retry. Callers that want the reconnect
    /// schedule should use [`Connection::reconnect`].
    pub fn connect(credentials: Credentials) -> Result<Self, ConnectionError> {
        let client = open(&credentials)?;
        Ok(Connection {
            client: Some(client),
            credentials,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.client.as_ref().is_some_and(|c| !c.is_closed())
    }

    pub fn client_mut(&mut self) -> Option<&mut Client> {
        self.client.as_mut().filter(|c| !c.is_closed())
    }

    pub fn disconnect(&mut self) {
        self.client = None;
    }

    /// Retries [`Connection::connect`] following the fixed `{0s, 15s, 60s}`
    /// schedule, sleeping between attempts. Returns
    /// [`ConnectionError::ShuttingDown`] early if `running` goes false, and
    /// the last attempt's error if the whole schedule is exhausted without a
    /// successful connection — callers treat that as fatal (§7).
    pub fn reconnect(
        &mut self,
        running: &std::sync::atomic::AtomicBool,
    ) -> Result<(), ConnectionError> {
        self.disconnect();
        let mut last_err = None;
        for (attempt, &delay) in RECONNECT_SCHEDULE.iter().enumerate() {
            if !delay.is_zero() {
                info!(delay_s = delay.as_secs(), "waiting before reconnect attempt");
                std::thread::sleep(delay);
            }
            if !running.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(ConnectionError::ShuttingDown);
            }
            match open(&self.credentials) {
                Ok(client) => {
                    info!("reconnected to database");
                    self.client = Some(client);
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, attempt, "reconnect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("RECONNECT_SCHEDULE is non-empty"))
    }
}

fn open(credentials: &Credentials) -> Result<Client, ConnectionError> {
    let conn_string = credentials.connection_string()?;
    let mut client = Client::connect(&conn_string, NoTls)?;
    if let Some(schema) = credentials.schema.as_ref().filter(|s| !s.is_empty()) {
        client.batch_execute(&format!("SET search_path TO {schema}"))?;
    }
    Ok(client)
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicBool;

    use super::*;

    /// A database that never exists at `127.0.0.1:1` exercises the full
    /// schedule and surfaces the last connect error without hanging the test
    /// suite on the real `{0s, 15s, 60s}` delays (port 1 fails instantly).
    #[test]
    fn reconnect_stops_when_running_goes_false() {
        let running = AtomicBool::new(false);
        let credentials = Credentials {
            user: Some("x".into()),
            password: Some("x".into()),
            database_name: Some("x".into()),
            host: "127.0.0.1".into(),
            port: 1,
            ..Default::default()
        };
        let err = Connection::connect(credentials.clone()).unwrap_err();
        assert!(matches!(err, ConnectionError::Postgres(_)));

        // Build a disconnected connection to drive reconnect() directly.
        let mut conn = Connection {
            client: None,
            credentials,
        };
        let err = conn.reconnect(&running).unwrap_err();
        assert!(matches!(err, ConnectionError::ShuttingDown));
    }
}
