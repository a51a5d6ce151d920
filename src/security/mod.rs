pub mod certs;
pub mod secure_channel;
pub mod trust;

pub use certs::LocalCertificate;
pub use secure_channel::{
    AuthSummary, Channel, PlaintextChannel, SecureChannel, SecurityBackend, TlsMaterial,
    TlsSecureChannel,
};
pub use trust::{EffectiveTrustPolicy, TrustManager, TrustMode};
