use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub mod cors;
pub mod security;

pub use cors::create_cors_layer;
pub use security::create_security_headers_layer;

const DEFAULT_PORT: &str = "3001";
const DEFAULT_DATABASE_URL: &str = "postgres://localhost/matchday";
const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:5173";

const DARAJA_SANDBOX_URL: &str = "https://sandbox.safaricom.co.ke";
const DARAJA_SANDBOX_SHORTCODE: &str = "174379";
const DARAJA_SANDBOX_PASSKEY: &str =
    "bfb279f9aa9bdbcf158e97dd71a467cd2e0c893059b10f78e6b72ada1ed2c919";
const DEFAULT_CALLBACK_URL: &str = "http://localhost:3001/api/mpesa/callback";

const SMS_SANDBOX_URL: &str = "https://api.sandbox.africastalking.com";
const SMS_SANDBOX_USERNAME: &str = "sandbox";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(format!("expected 'postgres' or 'memory', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub storage: StorageBackend,
    pub production: bool,
    pub cors_allowed_origins: Option<String>,
    /// Base URL of the web app, used to build ticket links in SMS.
    pub public_base_url: String,
    /// Identities that receive the admin role when first seen.
    pub admin_user_ids: Vec<String>,
    pub booking: BookingConfig,
    pub mpesa: MpesaConfig,
    pub sms: SmsConfig,
}

#[derive(Debug, Clone)]
pub struct BookingConfig {
    pub max_seats_per_booking: usize,
    /// Age after which a pending payment is checked against the gateway.
    pub payment_timeout: Duration,
    /// Age after which an unanswered payment is failed and its seats released.
    pub payment_expiry: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub shortcode: String,
    pub passkey: String,
    pub callback_url: String,
    /// Shared token expected as `?token=` on callbacks, when set.
    pub callback_token: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub base_url: String,
    pub username: String,
    pub api_key: Option<String>,
    pub sender_id: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let get_or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let production = get("RUST_ENV")
            .map(|v| v.to_lowercase() == "production")
            .unwrap_or(false);

        let booking = BookingConfig {
            max_seats_per_booking: parse(&get, "MAX_SEATS_PER_BOOKING", "10")?,
            payment_timeout: Duration::from_secs(parse(&get, "PAYMENT_TIMEOUT_SECS", "180")?),
            payment_expiry: Duration::from_secs(parse(&get, "PAYMENT_EXPIRY_SECS", "600")?),
            sweep_interval: Duration::from_secs(parse(&get, "SWEEP_INTERVAL_SECS", "30")?),
        };
        if booking.max_seats_per_booking == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_SEATS_PER_BOOKING",
                reason: "must be at least 1".to_string(),
            });
        }
        if booking.payment_expiry < booking.payment_timeout {
            return Err(ConfigError::Invalid {
                key: "PAYMENT_EXPIRY_SECS",
                reason: "must not be shorter than PAYMENT_TIMEOUT_SECS".to_string(),
            });
        }

        let mpesa = MpesaConfig {
            base_url: get_or("MPESA_BASE_URL", DARAJA_SANDBOX_URL),
            consumer_key: get_or("MPESA_CONSUMER_KEY", ""),
            consumer_secret: get_or("MPESA_CONSUMER_SECRET", ""),
            shortcode: get_or("MPESA_SHORTCODE", DARAJA_SANDBOX_SHORTCODE),
            passkey: get_or("MPESA_PASSKEY", DARAJA_SANDBOX_PASSKEY),
            callback_url: get_or("MPESA_CALLBACK_URL", DEFAULT_CALLBACK_URL),
            callback_token: get("MPESA_CALLBACK_TOKEN"),
            request_timeout: Duration::from_secs(parse(&get, "MPESA_TIMEOUT_SECS", "30")?),
        };

        if production && mpesa.callback_token.is_none() {
            return Err(ConfigError::Invalid {
                key: "MPESA_CALLBACK_TOKEN",
                reason: "must be set when RUST_ENV=production".to_string(),
            });
        }

        let sms = SmsConfig {
            base_url: get_or("SMS_BASE_URL", SMS_SANDBOX_URL),
            username: get_or("SMS_USERNAME", SMS_SANDBOX_USERNAME),
            api_key: get("SMS_API_KEY"),
            sender_id: get("SMS_SENDER_ID"),
        };

        Ok(Self {
            port: parse(&get, "PORT", DEFAULT_PORT)?,
            database_url: get_or("DATABASE_URL", DEFAULT_DATABASE_URL),
            storage: parse(&get, "STORAGE_BACKEND", "postgres")?,
            production,
            cors_allowed_origins: get("CORS_ALLOWED_ORIGINS"),
            public_base_url: get_or("PUBLIC_BASE_URL", DEFAULT_PUBLIC_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            admin_user_ids: get("ADMIN_USER_IDS")
                .map(|ids| {
                    ids.split(',')
                        .map(str::trim)
                        .filter(|id| !id.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            booking,
            mpesa,
            sms,
        })
    }

    pub fn is_admin_id(&self, user_id: &str) -> bool {
        self.admin_user_ids.iter().any(|id| id == user_id)
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    let raw = get(key).unwrap_or_else(|| default.to_string());
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })
}
