//! Identity verification port.

use crate::domain::Identity;
use crate::error::AccessError;

/// Turns a bearer token into a verified identity.
///
/// Implemented by the HTTP adapter against the external identity provider.
pub trait IdentityVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> Result<Identity, AccessError>;
}
