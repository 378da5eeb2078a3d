use std::env;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mongo_uri: String,
    pub database_name: String,
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    pub refresh_expiry_days: i64,
    pub reset_token_ttl_minutes: i64,
    pub bcrypt_cost: u32,
    pub frontend_origin: String,
    pub bind_addr: String,
    /// Return password-reset tokens in the API response. There is no mailer,
    /// so this is the only way to deliver them outside of a database lookup.
    pub expose_reset_token: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        Ok(Self {
            mongo_uri: required("MONGO_URI")?,
            database_name: env::var("DATABASE_NAME").unwrap_or_else(|_| "collab_db".to_string()),
            jwt_secret: required("JWT_SECRET")?,
            jwt_expiry_hours: parsed("JWT_EXPIRY_HOURS", 24)?,
            refresh_expiry_days: parsed("REFRESH_EXPIRY_DAYS", 30)?,
            reset_token_ttl_minutes: parsed("RESET_TOKEN_TTL_MINUTES", 60)?,
            bcrypt_cost: parsed("BCRYPT_COST", bcrypt::DEFAULT_COST)?,
            frontend_origin: env::var("FRONTEND_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            expose_reset_token: parsed("EXPOSE_RESET_TOKEN", false)?,
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            mongo_uri: "mongodb://127.0.0.1:27017".to_string(),
            database_name: "collab_test".to_string(),
            jwt_secret: "test-secret".to_string(),
            jwt_expiry_hours: 1,
            refresh_expiry_days: 1,
            reset_token_ttl_minutes: 10,
            bcrypt_cost: 4,
            frontend_origin: "http://localhost:3000".to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            expose_reset_token: true,
        }
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn parsed<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        Err(_) => Ok(default),
    }
}
