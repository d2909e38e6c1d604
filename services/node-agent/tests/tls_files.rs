//! Serving keypair on disk.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use vnode_agent::tls::{ensure_key_pair, generate_self_signed, write_key_pair};
use vnode_agent::Error;

#[test]
fn test_generates_once_then_reuses() {
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("vn-1.crt");
    let key_path = dir.path().join("vn-1.key");
    let sans = vec!["vn-1".to_string(), "10.0.0.7".to_string()];

    let generated = ensure_key_pair(&cert_path, &key_path, "vn-1", &sans).unwrap();
    assert_eq!(fs::read(&cert_path).unwrap(), generated.cert_pem);
    assert_eq!(fs::read(&key_path).unwrap(), generated.key_pem);

    let mode = fs::metadata(&key_path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
    let mode = fs::metadata(&cert_path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o644);

    let reused = ensure_key_pair(&cert_path, &key_path, "vn-1", &sans).unwrap();
    assert_eq!(reused.cert_pem, generated.cert_pem);
    assert_eq!(reused.key_pem, generated.key_pem);
}

#[test]
fn test_mismatched_pair_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("vn-1.crt");
    let key_path = dir.path().join("vn-1.key");

    let first = generate_self_signed("vn-1", &[]).unwrap();
    let second = generate_self_signed("vn-1", &[]).unwrap();
    write_key_pair(&first, &cert_path, &key_path).unwrap();
    fs::write(&key_path, &second.key_pem).unwrap();

    let err = ensure_key_pair(&cert_path, &key_path, "vn-1", &[]).unwrap_err();
    assert!(matches!(err, Error::Config(_)), "{err:?}");
}

#[test]
fn test_garbage_certificate_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("vn-1.crt");
    let key_path = dir.path().join("vn-1.key");
    fs::write(&cert_path, b"not a certificate").unwrap();
    fs::write(&key_path, b"not a key").unwrap();

    let err = ensure_key_pair(&cert_path, &key_path, "vn-1", &[]).unwrap_err();
    assert!(matches!(err, Error::Config(_)), "{err:?}");
    assert_eq!(fs::read(&cert_path).unwrap(), b"not a certificate");
}
