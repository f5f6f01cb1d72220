//! Pluggable request authentication.

use tonic::metadata::MetadataMap;
use tonic::Status;

/// Capability interface for admitting requests.
///
/// Invoked once per unary call and once per stream at open time,
/// before dispatch. Implementations see only request metadata; message
/// payloads are never exposed here.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, metadata: &MetadataMap) -> Result<(), Status>;
}

/// Always-allow authenticator used when no auth policy is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuthenticator;

impl Authenticator for NoopAuthenticator {
    fn authenticate(&self, _metadata: &MetadataMap) -> Result<(), Status> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_allows_everything() {
        let auth = NoopAuthenticator;
        assert!(auth.authenticate(&MetadataMap::new()).is_ok());
    }
}
