use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response};
use pin_project::pin_project;
use tower::{Layer, Service};

use super::Config;

/// Headers stamped on every API response. The API serves JSON only, so the
/// content policy forbids everything.
const API_HEADERS: [(&str, &str); 5] = [
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    (
        "content-security-policy",
        "default-src 'none'; frame-ancestors 'none'",
    ),
    // Ticket links carry the guest secret in the query string.
    ("referrer-policy", "no-referrer"),
    (
        "permissions-policy",
        "geolocation=(), microphone=(), camera=(), payment=()",
    ),
];

const HSTS: (&str, &str) = (
    "strict-transport-security",
    "max-age=31536000; includeSubDomains",
);

fn stamp(headers: &mut HeaderMap, include_hsts: bool) {
    let hsts = include_hsts.then_some(HSTS);
    for (name, value) in API_HEADERS.into_iter().chain(hsts) {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
}

#[derive(Clone)]
pub struct SecurityHeadersLayer {
    include_hsts: bool,
}

impl SecurityHeadersLayer {
    pub fn new(include_hsts: bool) -> Self {
        Self { include_hsts }
    }
}

impl<S> Layer<S> for SecurityHeadersLayer {
    type Service = SecurityHeaders<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SecurityHeaders {
            inner,
            include_hsts: self.include_hsts,
        }
    }
}

#[derive(Clone)]
pub struct SecurityHeaders<S> {
    inner: S,
    include_hsts: bool,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for SecurityHeaders<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = StampHeaders<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        StampHeaders {
            inner: self.inner.call(request),
            include_hsts: self.include_hsts,
        }
    }
}

#[pin_project]
pub struct StampHeaders<F> {
    #[pin]
    inner: F,
    include_hsts: bool,
}

impl<F, ResBody, E> Future for StampHeaders<F>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let mut result = std::task::ready!(this.inner.poll(cx));
        if let Ok(response) = result.as_mut() {
            stamp(response.headers_mut(), *this.include_hsts);
        }
        Poll::Ready(result)
    }
}

/// HSTS is only sent in production, where the service sits behind TLS.
pub fn create_security_headers_layer(config: &Config) -> SecurityHeadersLayer {
    tracing::info!(hsts = config.production, "Security headers enabled");
    SecurityHeadersLayer::new(config.production)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use std::convert::Infallible;
    use tower::{service_fn, ServiceExt};

    async fn headers_with(include_hsts: bool) -> HeaderMap {
        let service = SecurityHeadersLayer::new(include_hsts).layer(service_fn(
            |_req: Request<Body>| async { Ok::<_, Infallible>(Response::new(Body::empty())) },
        ));
        let response = service
            .oneshot(Request::new(Body::empty()))
            .await
            .unwrap();
        response.headers().clone()
    }

    #[tokio::test]
    async fn test_headers_are_added() {
        let headers = headers_with(false).await;
        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
        assert_eq!(headers.get("referrer-policy").unwrap(), "no-referrer");
        assert!(headers.get("strict-transport-security").is_none());
    }

    #[tokio::test]
    async fn test_hsts_only_in_production() {
        let headers = headers_with(true).await;
        assert!(headers.get("strict-transport-security").is_some());
    }
}
