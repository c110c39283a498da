//! PostgreSQL connection parameters and connection-string assembly.

use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CredentialsError {
    #[error("{0} is required to build a connection string")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    pub database_name: Option<String>,
    pub schema: Option<String>,
    pub application_name: String,
    pub connect_timeout: Duration,
    pub read_only: bool,
}

impl Default for Credentials {
    fn default() -> Self {
        Credentials {
            user: None,
            password: None,
            host: "127.0.0.1".to_string(),
            port: 5432,
            database_name: None,
            schema: None,
            application_name: "uWaveServer".to_string(),
            connect_timeout: Duration::from_secs(5),
            read_only: false,
        }
    }
}

impl Credentials {
    /// Builds a libpq-style `key=value` connection string.
    pub fn connection_string(&self) -> Result<String, CredentialsError> {
        let user = self.user.as_ref().ok_or(CredentialsError::Missing("user"))?;
        let password = self
            .password
            .as_ref()
            .ok_or(CredentialsError::Missing("password"))?;
        let database_name = self
            .database_name
            .as_ref()
            .ok_or(CredentialsError::Missing("database name"))?;

        let mut s = format!(
            "user={user} password={password} host={} dbname={database_name} port={}",
            self.host, self.port
        );
        let timeout_secs = self.connect_timeout.as_secs();
        if timeout_secs > 0 {
            s.push_str(&format!(" connect_timeout={timeout_secs}"));
        }
        if !self.application_name.is_empty() {
            s.push_str(&format!(" application_name={}", self.application_name));
        }
        Ok(s)
    }

    pub fn driver() -> &'static str {
        "postgresql"
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn connection_string_includes_optional_fields() {
        let creds = Credentials {
            user: Some("seismo".into()),
            password: Some("hunter2".into()),
            database_name: Some("waveforms".into()),
            ..Default::default()
        };
        let s = creds.connection_string().unwrap();
        assert!(s.contains("user=seismo"));
        assert!(s.contains("dbname=waveforms"));
        assert!(s.contains("connect_timeout=5"));
        assert!(s.contains("application_name=uWaveServer"));
    }

    #[test]
    fn missing_user_is_rejected() {
        let creds = Credentials {
            password: Some("x".into()),
            database_name: Some("x".into()),
            ..Default::default()
        };
        assert!(matches!(
            creds.connection_string(),
            Err(CredentialsError::Missing("user"))
        ));
    }
}
