use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::Interceptor;
use tonic::{Request, Status};

use crate::error::{MasterError, Result};

/// Metadata key carrying the cluster shared secret.
pub const SECRET_HEADER: &str = "x-masternode-secret";

fn parse_secret(secret: Option<&str>) -> Result<Option<MetadataValue<Ascii>>> {
    secret
        .map(|s| {
            s.parse::<MetadataValue<Ascii>>()
                .map_err(|_| MasterError::Internal("shared secret must be ASCII".to_string()))
        })
        .transpose()
}

/// Client side: attaches the shared secret to every outgoing call.
#[derive(Debug, Clone, Default)]
pub struct SecretInjector {
    secret: Option<MetadataValue<Ascii>>,
}

impl SecretInjector {
    pub fn new(secret: Option<&str>) -> Result<Self> {
        Ok(Self {
            secret: parse_secret(secret)?,
        })
    }
}

impl Interceptor for SecretInjector {
    fn call(&mut self, mut request: Request<()>) -> std::result::Result<Request<()>, Status> {
        if let Some(secret) = &self.secret {
            request.metadata_mut().insert(SECRET_HEADER, secret.clone());
        }
        Ok(request)
    }
}

/// Server side: rejects calls that do not carry the expected secret.
/// Accepts everything when no secret is configured.
#[derive(Debug, Clone, Default)]
pub struct SecretCheck {
    secret: Option<MetadataValue<Ascii>>,
}

impl SecretCheck {
    pub fn new(secret: Option<&str>) -> Result<Self> {
        Ok(Self {
            secret: parse_secret(secret)?,
        })
    }
}

impl Interceptor for SecretCheck {
    fn call(&mut self, request: Request<()>) -> std::result::Result<Request<()>, Status> {
        match &self.secret {
            None => Ok(request),
            Some(expected) if request.metadata().get(SECRET_HEADER) == Some(expected) => {
                Ok(request)
            }
            Some(_) => {
                tracing::warn!("Rejected RPC with missing or invalid shared secret");
                Err(Status::unauthenticated("invalid shared secret"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_secret_passes_check() {
        let mut inject = SecretInjector::new(Some("hunter2")).unwrap();
        let mut check = SecretCheck::new(Some("hunter2")).unwrap();
        let request = inject.call(Request::new(())).unwrap();
        assert!(check.call(request).is_ok());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let mut inject = SecretInjector::new(Some("guess")).unwrap();
        let mut check = SecretCheck::new(Some("hunter2")).unwrap();
        let request = inject.call(Request::new(())).unwrap();
        let err = check.call(request).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }

    #[test]
    fn missing_secret_is_rejected() {
        let mut check = SecretCheck::new(Some("hunter2")).unwrap();
        assert!(check.call(Request::new(())).is_err());
    }

    #[test]
    fn open_server_accepts_anything() {
        let mut check = SecretCheck::new(None).unwrap();
        assert!(check.call(Request::new(())).is_ok());
    }

    #[test]
    fn non_ascii_secret_is_refused() {
        assert!(SecretInjector::new(Some("sécret\n")).is_err());
    }
}
