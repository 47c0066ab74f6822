use super::*;

use crate::error::BmclError;

const NOW: u64 = 1_700_000_000_000;

fn signing_error(r: BmclResult<()>) -> Error {
    match r {
        Err(BmclError::SigningError(e)) => e,
        other => panic!("expected a signing error, got {:?}", other),
    }
}

#[test]
fn test_base36() {
    assert_eq!("0", to_base36(0));
    assert_eq!("z", to_base36(35));
    assert_eq!("10", to_base36(36));
    assert_eq!(Some(NOW), from_base36(&to_base36(NOW)));
    assert_eq!(Some(35), from_base36("Z"));
    assert_eq!(None, from_base36(""));
    assert_eq!(None, from_base36("-1"));
    assert_eq!(None, from_base36("zzzzzzzzzzzzzzzzzzzzzzzz"));
}

#[test]
fn test_sign_verify() {
    let sig = sign("k", "ff", NOW + 60_000);

    assert!(verify("k", "ff", &sig.s, &sig.e, NOW).is_ok());
    assert!(verify("k", "ff", &sig.s, &sig.e, NOW + 59_000).is_ok());

    assert_eq!(
        Error::Expired,
        signing_error(verify("k", "ff", &sig.s, &sig.e, NOW + 61_000))
    );
    assert_eq!(
        Error::Expired,
        signing_error(verify("k", "ff", &sig.s, &sig.e, NOW + 60_000))
    );
}

#[test]
fn test_wrong_subject_or_secret() {
    let sig = sign("k", "ff", NOW + 60_000);

    assert_eq!(
        Error::SignatureMismatch,
        signing_error(verify("k", "fe", &sig.s, &sig.e, NOW))
    );
    assert_eq!(
        Error::SignatureMismatch,
        signing_error(verify("other", "ff", &sig.s, &sig.e, NOW))
    );

    // Extending the expiry invalidates the signature
    let later = to_base36(NOW + 3_600_000);
    assert_eq!(
        Error::SignatureMismatch,
        signing_error(verify("k", "ff", &sig.s, &later, NOW))
    );
}

#[test]
fn test_malformed() {
    assert_eq!(
        Error::InvalidExpiry("!!".to_string()),
        signing_error(verify("k", "ff", "abc", "!!", NOW))
    );
    assert_eq!(
        Error::MalformedSignature,
        signing_error(verify("k", "ff", "not base64 !", "zz", NOW))
    );
}

#[test]
fn test_query() {
    let sig = sign("k", "/measure/1", NOW);
    let query = sig.to_query();

    assert!(query.starts_with("s="));
    assert!(query.ends_with(&format!("&e={}", sig.e)));
    assert!(!sig.s.contains('+') && !sig.s.contains('/') && !sig.s.contains('='));
}
