//! Cross-cutting request admission checks.

use std::sync::Arc;

use tonic::service::Interceptor;
use tonic::{Request, Status};

use crate::auth::Authenticator;
use crate::health::HealthChecker;

/// Interceptor applied to every proxied service.
///
/// Runs at unary dispatch and at stream-open time: authentication
/// first, then the draining check. A rejection short-circuits before
/// any proxy code sees the call. Message payloads are never inspected
/// or mutated.
#[derive(Clone)]
pub struct RequestGuard {
    authenticator: Arc<dyn Authenticator>,
    health: Arc<HealthChecker>,
}

impl RequestGuard {
    pub fn new(authenticator: Arc<dyn Authenticator>, health: Arc<HealthChecker>) -> Self {
        Self {
            authenticator,
            health,
        }
    }
}

impl Interceptor for RequestGuard {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        self.authenticator.authenticate(request.metadata())?;
        if self.health.is_draining() {
            return Err(Status::unavailable(
                "sidecar is draining and not accepting new calls",
            ));
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NoopAuthenticator;
    use tonic::metadata::MetadataMap;
    use tonic::Code;

    struct DenyAll;

    impl Authenticator for DenyAll {
        fn authenticate(&self, _metadata: &MetadataMap) -> Result<(), Status> {
            Err(Status::unauthenticated("credentials required"))
        }
    }

    #[test]
    fn allows_while_serving() {
        let health = Arc::new(HealthChecker::new("sidecar"));
        let mut guard = RequestGuard::new(Arc::new(NoopAuthenticator), health);
        assert!(guard.call(Request::new(())).is_ok());
    }

    #[test]
    fn rejects_once_draining() {
        let health = Arc::new(HealthChecker::new("sidecar"));
        let mut guard = RequestGuard::new(Arc::new(NoopAuthenticator), health.clone());
        health.begin_drain();

        let status = guard.call(Request::new(())).unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
    }

    #[test]
    fn auth_runs_before_draining_check() {
        let health = Arc::new(HealthChecker::new("sidecar"));
        health.begin_drain();
        let mut guard = RequestGuard::new(Arc::new(DenyAll), health);

        let status = guard.call(Request::new(())).unwrap_err();
        assert_eq!(status.code(), Code::Unauthenticated);
    }
}
