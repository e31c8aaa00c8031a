//! Property-based tests across randomly generated inputs.
//!
//! Properties covered:
//! - signatures verify for any message and fail for any tampered body
//! - secret key parsing rejects any corrupted checksum window
//! - manifest serialize/load recovers the key/value data exactly
//! - the body parser never panics on arbitrary input
//! - hash verification accepts exactly the file's own digest

#![cfg(test)]

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use proptest::prelude::*;

use crate::error::UpdateError;
use crate::manifest::{parse_data, Manifest};
use crate::signify::{self, generate_keypair, SecretKey};

/// Messages with arbitrary unicode content.
fn arb_message() -> impl Strategy<Value = String> {
    ".{0,200}"
}

/// Manifest keys that survive the line format: lowercase words and dashes,
/// no colons, no surrounding whitespace.
fn arb_manifest_key() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,18}[a-z0-9]"
}

/// Manifest values: printable, no newlines, no surrounding whitespace.
fn arb_manifest_value() -> impl Strategy<Value = String> {
    "[ -~]{0,40}".prop_map(|s| s.trim().to_string())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn signatures_verify_for_any_message(message in arb_message()) {
        let (public, secret) = generate_keypair();
        let signature = signify::sign(&secret, &message).unwrap();
        prop_assert!(signify::verify(&[public], &signature, &message).is_ok());
    }

    #[test]
    fn any_flipped_body_byte_breaks_verification(
        message in "[ -~]{1,100}",
        flip in 0usize..100,
        bit in 0u8..7,
    ) {
        let (public, secret) = generate_keypair();
        let signature = signify::sign(&secret, &message).unwrap();

        let mut bytes = message.clone().into_bytes();
        let idx = flip % bytes.len();
        // The message is printable ASCII and the low seven bits are
        // flipped, so the result is still valid UTF-8 and always differs.
        bytes[idx] ^= 1 << bit;
        let tampered = String::from_utf8(bytes).unwrap();

        prop_assert!(signify::verify(&[public], &signature, &tampered).is_err());
    }

    #[test]
    fn any_corrupted_checksum_window_is_rejected(offset in 24usize..32, bit in 0u8..8) {
        let (_, secret) = generate_keypair();
        let mut bytes = BASE64.decode(secret.to_base64()).unwrap();
        bytes[offset] ^= 1 << bit;

        let err = SecretKey::from_base64(&BASE64.encode(&bytes)).unwrap_err();
        prop_assert!(matches!(err, UpdateError::ChecksumMismatch));
    }

    #[test]
    fn manifest_roundtrip_recovers_data_exactly(
        entries in prop::collection::btree_map(arb_manifest_key(), arb_manifest_value(), 0..8),
        major in 0u64..50,
        minor in 0u64..50,
        patch in 0u64..50,
    ) {
        let (public, secret) = generate_keypair();

        let mut data: BTreeMap<String, String> = entries;
        data.insert("version".to_string(), format!("{major}.{minor}.{patch}"));
        // "urgency" from the generator could collide with an invalid value;
        // pin it to something well-formed.
        data.remove("urgency");

        let manifest = Manifest::from_data(data.clone()).unwrap();
        let text = manifest.serialize(&secret).unwrap();
        let loaded = Manifest::load_from_string(&[public], &text).unwrap();

        prop_assert_eq!(loaded.data(), &data);
    }

    #[test]
    fn body_parser_never_panics(input in ".{0,500}") {
        let _ = parse_data(&input);
    }

    #[test]
    fn hash_verification_accepts_exactly_the_own_digest(content in prop::collection::vec(any::<u8>(), 0..4096)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            use std::io::Write;
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(&content).unwrap();
            file.flush().unwrap();

            let digest = crate::artifact::compute_sha512(file.path()).await.unwrap();
            assert!(crate::artifact::verify_hash(&digest, file.path()).await.is_ok());

            let mut wrong = digest.into_bytes();
            wrong[0] = if wrong[0] == b'0' { b'1' } else { b'0' };
            let wrong = String::from_utf8(wrong).unwrap();
            assert!(matches!(
                crate::artifact::verify_hash(&wrong, file.path()).await,
                Err(UpdateError::HashMismatch { .. })
            ));
        });
    }
}
