use std::time::Duration;

use axum::http::{header, HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

use super::Config;
use crate::auth::{USER_ID_HEADER, USER_NAME_HEADER};

/// Vite and CRA dev servers.
const DEV_ORIGINS: &str = "http://localhost:3000,http://localhost:5173";

const PREFLIGHT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Browser access for the ticketing SPA. The M-Pesa callback is server to
/// server and unaffected.
pub fn create_cors_layer(config: &Config) -> CorsLayer {
    let configured = config.cors_allowed_origins.as_deref().unwrap_or(DEV_ORIGINS);

    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            header::ACCEPT,
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(USER_ID_HEADER),
            HeaderName::from_static(USER_NAME_HEADER),
        ])
        .expose_headers([header::CONTENT_TYPE, header::CACHE_CONTROL])
        .max_age(PREFLIGHT_MAX_AGE);

    let origins = trusted_origins(configured);
    if origins.is_empty() {
        tracing::warn!("CORS: no usable origin configured, allowing any origin without credentials");
        return layer.allow_origin(AllowOrigin::any());
    }
    tracing::info!(count = origins.len(), "CORS: origin allow-list configured");
    // Credentials cannot be combined with a wildcard origin.
    layer
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
}

/// Comma-separated origins; malformed entries are skipped with a warning.
fn trusted_origins(list: &str) -> Vec<HeaderValue> {
    list.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(origin, error = %e, "CORS: ignoring invalid origin");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_origins_parse() {
        assert_eq!(trusted_origins(DEV_ORIGINS).len(), 2);
    }

    #[test]
    fn test_blank_and_invalid_entries_are_dropped() {
        assert!(trusted_origins(" , ").is_empty());
        assert_eq!(
            trusted_origins("https://tickets.example, bad\norigin ,").len(),
            1
        );
    }
}
