//! Runtime configuration from CLI flags and environment.

use std::str::FromStr;

use clap::Parser;
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::Error;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "evently-api",
    about = "REST and streaming front end for an append-only event-sourcing ledger store",
    version
)]
pub struct Config {
    /// Port to listen on
    #[arg(long, default_value = "4802", env = "PORT")]
    pub port: u16,

    /// Bind address
    #[arg(long, default_value = "0.0.0.0", env = "BIND_ADDRESS")]
    pub bind: String,

    /// Postgres connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Prefix for split connection variables:
    /// <PREFIX>_DATABASE, _USER, _PASSWORD, _HOST, _PORT
    #[arg(long, env = "DB_PREFIX")]
    pub db_prefix: Option<String>,

    /// Any truthy value connects to the database over TLS without
    /// certificate verification
    #[arg(long, default_value = "", env = "PGSSL")]
    pub pgssl: String,

    /// Log level filter
    #[arg(long, default_value = "trace", env = "LOG_LEVEL")]
    pub log_level: String,

    /// Runtime environment; "production" switches to JSON log output
    #[arg(long, default_value = "development", env = "SERVICE_ENV")]
    pub service_env: String,
}

impl Config {
    pub fn production(&self) -> bool {
        self.service_env == "production"
    }

    /// Resolve connection options from `DATABASE_URL` or the `DB_PREFIX`
    /// variable family.
    pub fn connect_options(&self) -> Result<PgConnectOptions, Error> {
        let mut options = if let Some(url) = &self.database_url {
            PgConnectOptions::from_str(url)
                .map_err(|e| Error::BadInput(format!("invalid DATABASE_URL: {e}")))?
        } else if let Some(prefix) = &self.db_prefix {
            options_from_prefix(prefix)?
        } else {
            return Err(Error::BadInput(
                "either DATABASE_URL or DB_PREFIX must be set".to_string(),
            ));
        };
        if truthy(&self.pgssl) {
            options = options.ssl_mode(PgSslMode::Require);
        }
        Ok(options)
    }
}

fn options_from_prefix(prefix: &str) -> Result<PgConnectOptions, Error> {
    let var = |suffix: &str| -> Result<String, Error> {
        std::env::var(format!("{prefix}_{suffix}"))
            .map_err(|_| Error::BadInput(format!("{prefix}_{suffix} must be set")))
    };
    let mut options = PgConnectOptions::new()
        .host(&var("HOST")?)
        .username(&var("USER")?)
        .password(&var("PASSWORD")?)
        .database(&var("DATABASE")?);
    if let Ok(port) = std::env::var(format!("{prefix}_PORT")) {
        let port: u16 = port
            .parse()
            .map_err(|_| Error::BadInput(format!("invalid {prefix}_PORT: {port}")))?;
        options = options.port(port);
    }
    Ok(options)
}

/// Environment-variable truthiness: set, and not an explicit "0"/"false".
pub fn truthy(value: &str) -> bool {
    let v = value.trim();
    !(v.is_empty() || v == "0" || v.eq_ignore_ascii_case("false"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthy() {
        assert!(truthy("1"));
        assert!(truthy("true"));
        assert!(truthy("yes"));
        assert!(!truthy(""));
        assert!(!truthy("0"));
        assert!(!truthy("false"));
        assert!(!truthy("FALSE"));
    }
}
