//! Shared test helpers.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use rcgen::{CertificateParams, DnType, KeyPair};

/// Unique scratch directory under the system temp dir.
pub fn temp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!("marathon-acme-{name}-{nanos}"))
}

/// Self-signed key + certificate bundle for `domain`, expiring in
/// `valid_days`, shaped like a stored certificate file.
pub fn self_signed_pem(domain: &str, valid_days: i64) -> Vec<u8> {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec![domain.to_string()]).unwrap();
    params.distinguished_name.push(DnType::CommonName, domain);

    let not_before = Utc::now() - chrono::Duration::hours(1);
    let not_after = Utc::now() + chrono::Duration::days(valid_days);
    params.not_before = time::OffsetDateTime::from_unix_timestamp(not_before.timestamp())
        .unwrap_or(time::OffsetDateTime::now_utc());
    params.not_after = time::OffsetDateTime::from_unix_timestamp(not_after.timestamp())
        .unwrap_or(time::OffsetDateTime::now_utc());

    let cert = params.self_signed(&key).unwrap();
    let mut pem = key.serialize_pem().into_bytes();
    pem.extend_from_slice(cert.pem().as_bytes());
    pem
}
