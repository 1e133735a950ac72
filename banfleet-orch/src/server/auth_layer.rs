//! mTLS authentication as a tower layer.
//!
//! Auth is skipped for requests arriving over loopback (the HTTP
//! bridge dials us locally) and for the per-service public method
//! allowlist (`Init` runs before the agent has a certificate).
//! Everything else must present a verified client certificate; the
//! peer's common name is injected into request extensions.

use std::collections::HashSet;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tonic::body::Body;
use tonic::codegen::http;
use tonic::transport::server::{TcpConnectInfo, TlsConnectInfo};
use tonic::Status;
use tower::{Layer, Service};
use x509_parser::prelude::FromDer;

/// Authenticated peer identity, the certificate common name (or
/// `localhost` for bridge traffic).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerName(pub String);

#[derive(Clone)]
pub struct MtlsAuthLayer {
    public_methods: Arc<HashSet<String>>,
}

impl MtlsAuthLayer {
    pub fn new(public_methods: impl IntoIterator<Item = String>) -> Self {
        Self { public_methods: Arc::new(public_methods.into_iter().collect()) }
    }
}

impl<S> Layer<S> for MtlsAuthLayer {
    type Service = MtlsAuth<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MtlsAuth { inner, public_methods: self.public_methods.clone() }
    }
}

#[derive(Clone)]
pub struct MtlsAuth<S> {
    inner: S,
    public_methods: Arc<HashSet<String>>,
}

impl<S> Service<http::Request<Body>> for MtlsAuth<S>
where
    S: Service<http::Request<Body>, Response = http::Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: http::Request<Body>) -> Self::Future {
        match authorize(&request, &self.public_methods) {
            Ok(Some(peer)) => {
                request.extensions_mut().insert(peer);
            }
            Ok(None) => {}
            Err(status) => {
                return Box::pin(async move { Ok(deny(status)) });
            }
        }

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move { inner.call(request).await })
    }
}

fn authorize(
    request: &http::Request<Body>,
    public_methods: &HashSet<String>,
) -> Result<Option<PeerName>, Status> {
    if public_methods.contains(request.uri().path()) {
        return Ok(None);
    }

    let tls_info = request.extensions().get::<TlsConnectInfo<TcpConnectInfo>>();

    let remote_addr = tls_info
        .and_then(|info| info.get_ref().remote_addr())
        .or_else(|| {
            request
                .extensions()
                .get::<TcpConnectInfo>()
                .and_then(|info| info.remote_addr())
        });
    if let Some(addr) = remote_addr {
        if addr.ip().is_loopback() {
            return Ok(Some(PeerName("localhost".to_string())));
        }
    }

    let certs = tls_info
        .and_then(|info| info.peer_certs())
        .ok_or_else(|| Status::unauthenticated("you must use mTLS to access this method"))?;
    let leaf = certs
        .first()
        .ok_or_else(|| Status::unauthenticated("client certificate verification failed"))?;

    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(leaf.as_ref())
        .map_err(|_| Status::unauthenticated("client certificate is not valid DER"))?;
    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| Status::unauthenticated("client certificate has no common name"))?;

    Ok(Some(PeerName(common_name.to_string())))
}

/// A gRPC error response built by hand, since the rejection happens
/// below the tonic service.
fn deny(status: Status) -> http::Response<Body> {
    let mut response = http::Response::new(Body::empty());
    response
        .headers_mut()
        .insert("content-type", http::HeaderValue::from_static("application/grpc"));
    response.headers_mut().insert(
        "grpc-status",
        http::HeaderValue::from_str(&(status.code() as i32).to_string())
            .unwrap_or(http::HeaderValue::from_static("2")),
    );
    if let Ok(message) = http::HeaderValue::from_str(status.message()) {
        response.headers_mut().insert("grpc-message", message);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str) -> http::Request<Body> {
        http::Request::builder()
            .uri(format!("https://orch{path}"))
            .body(Body::empty())
            .expect("request")
    }

    #[test]
    fn public_methods_bypass_auth() {
        let public: HashSet<String> = ["/orch.v1.control.ControlService/Init".to_string()].into();
        let result = authorize(&request("/orch.v1.control.ControlService/Init"), &public);
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn non_public_without_tls_is_rejected() {
        let public = HashSet::new();
        let err = authorize(&request("/orch.v1.rule.RuleService/AddRule"), &public).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }
}
