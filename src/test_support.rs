//! Fixtures shared by unit and integration tests.

use kube::api::ObjectMeta;
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::crd::{DistributionType, LlamaStackDistribution, LlamaStackDistributionSpec, ServerSpec};

/// Self-signed P-256 CA certificate, `CN=llama-stack-test-ca`, valid until 2126
pub const TEST_CERTIFICATE: &str = "\
-----BEGIN CERTIFICATE-----\n\
MIIBlDCCATmgAwIBAgIUTR2XxVzpNAxb+GdM1Gy661se/KowCgYIKoZIzj0EAwIw\n\
HjEcMBoGA1UEAwwTbGxhbWEtc3RhY2stdGVzdC1jYTAgFw0yNjEwMTkxOTU4MDFa\n\
GA8yMTI2MDkyNTE5NTgwMVowHjEcMBoGA1UEAwwTbGxhbWEtc3RhY2stdGVzdC1j\n\
YTBZMBMGByqGSM49AgEGCCqGSM49AwEHA0IABGboa4x6l8zsFaR3ap1OjBfqMM6Z\n\
kIU5QpZSI9qKi01lXsxxWrHpC58nh/be80lit0CWq9PW2H62HQPx4sxqa6ajUzBR\n\
MB0GA1UdDgQWBBRJAeEvAExWyeAV6X5hNnCzYY6NiTAfBgNVHSMEGDAWgBRJAeEv\n\
AExWyeAV6X5hNnCzYY6NiTAPBgNVHRMBAf8EBTADAQH/MAoGCCqGSM49BAMCA0kA\n\
MEYCIQCswAawNGJCYoQdJMhBF8zRPhZntZV0emYstQa/Mo//IAIhAOk5IHHUlhoh\n\
kMcyOOBlH/rLqgaRsSXmq8l8uzSAVCTL\n\
-----END CERTIFICATE-----";

/// A minimal distribution running the `starter` catalog entry.
///
/// The UID is derived from namespace and name, so two calls with the same
/// identity describe the same object.
#[must_use]
pub fn distribution(name: &str, namespace: &str) -> LlamaStackDistribution {
    let mut dist = LlamaStackDistribution::new(
        name,
        LlamaStackDistributionSpec {
            replicas: 1,
            server: ServerSpec {
                distribution: DistributionType {
                    name: Some("starter".to_string()),
                    image: None,
                },
                ..ServerSpec::default()
            },
            network: None,
        },
    );
    dist.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        uid: Some(uid_for(namespace, name)),
        generation: Some(1),
        ..ObjectMeta::default()
    };
    dist
}

fn uid_for(namespace: &str, name: &str) -> String {
    let digest = Sha256::digest(format!("{namespace}/{name}").as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    uuid::Uuid::from_bytes(bytes).to_string()
}

/// The bundled kustomize templates
#[must_use]
pub fn manifests_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("manifests")
}
