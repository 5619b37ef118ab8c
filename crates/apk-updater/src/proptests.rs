//! Property-based tests for apk-updater.
//!
//! # Properties Tested
//!
//! - Property 1: Version precedence (base ordering, reflexivity, build metadata)
//! - Property 2: Strict and lenient comparison agree on strict SemVer input
//! - Property 3: Release validation never yields an update without digest or trusted origin
//! - Property 4: Artifact hash verification
//! - Property 5: Download file names stay inside the download directory

#![cfg(test)]

use std::cmp::Ordering;

use proptest::prelude::*;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::checker::evaluate_release;
use crate::download::safe_file_name;
use crate::origin::TrustedOrigins;
use crate::release::{parse_sha256_digest, ReleaseDescriptor};
use crate::verify::{compute_hash, verify_digest};
use crate::version::{compare_lenient, compare_versions, is_newer_version};

// =============================================================================
// Generators
// =============================================================================

/// Numeric base with 1 to 4 segments.
fn arb_base() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..1000, 1..=4)
}

/// Dot-separated prerelease identifiers, mixing numeric and alphanumeric.
fn arb_prerelease() -> impl Strategy<Value = String> {
    let ident = prop_oneof![
        (0u64..50).prop_map(|n| n.to_string()),
        "[a-z][a-z0-9]{0,6}",
    ];
    prop::collection::vec(ident, 1..=3).prop_map(|ids| ids.join("."))
}

fn arb_build() -> impl Strategy<Value = String> {
    "[A-Za-z0-9]{1,8}(\\.[A-Za-z0-9]{1,8}){0,2}"
}

fn arb_strict_semver() -> impl Strategy<Value = String> {
    (0u64..30, 0u64..30, 0u64..30, prop::option::of(arb_prerelease())).prop_map(
        |(major, minor, patch, pre)| match pre {
            Some(pre) => format!("{major}.{minor}.{patch}-{pre}"),
            None => format!("{major}.{minor}.{patch}"),
        },
    )
}

fn join_base(base: &[u64]) -> String {
    base.iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

fn release_json(tag: &str, url: &str, digest: Option<&str>) -> Vec<u8> {
    let mut asset = serde_json::json!({
        "name": "app-release.apk",
        "browser_download_url": url,
        "size": 1024,
    });
    if let Some(digest) = digest {
        asset["digest"] = serde_json::Value::String(digest.to_string());
    }
    serde_json::json!({
        "tag_name": tag,
        "html_url": "https://github.com/o/r/releases/latest",
        "body": "notes",
        "assets": [asset],
    })
    .to_string()
    .into_bytes()
}

// =============================================================================
// Property 1: Version precedence
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// A strictly greater numeric base is newer, never the other way round.
    #[test]
    fn prop_greater_base_is_newer(
        base in arb_base(),
        index in 0usize..4,
        bump in 1u64..100,
        pre_a in prop::option::of(arb_prerelease()),
        pre_b in prop::option::of(arb_prerelease()),
    ) {
        let mut higher = base.clone();
        let index = index % higher.len();
        higher[index] += bump;
        for seg in higher.iter_mut().skip(index + 1) {
            *seg = 0;
        }

        let with_pre = |b: &[u64], pre: &Option<String>| match pre {
            Some(p) => format!("{}-{}", join_base(b), p),
            None => join_base(b),
        };
        let a = with_pre(&higher, &pre_a);
        let b = with_pre(&base, &pre_b);

        prop_assert!(is_newer_version(&a, &b), "{a} should be newer than {b}");
        prop_assert!(!is_newer_version(&b, &a), "{b} should not be newer than {a}");
    }

    /// Nothing is newer than itself.
    #[test]
    fn prop_not_newer_than_self(
        v in arb_strict_semver(),
        build in prop::option::of(arb_build()),
    ) {
        let v = match build {
            Some(b) => format!("{v}+{b}"),
            None => v,
        };
        prop_assert!(!is_newer_version(&v, &v));
        prop_assert_eq!(compare_versions(&v, &v), Some(Ordering::Equal));
    }

    /// Build metadata never changes the outcome.
    #[test]
    fn prop_build_metadata_ignored(
        a in arb_strict_semver(),
        b in arb_strict_semver(),
        build_a in arb_build(),
        build_b in arb_build(),
    ) {
        prop_assert_eq!(
            is_newer_version(&format!("{a}+{build_a}"), &format!("{b}+{build_b}")),
            is_newer_version(&a, &b)
        );
        let same_a = format!("{a}+{build_a}");
        let same_b = format!("{a}+{build_b}");
        prop_assert!(!is_newer_version(&same_a, &same_b));
    }

    /// Precedence is antisymmetric.
    #[test]
    fn prop_comparison_antisymmetric(a in arb_strict_semver(), b in arb_strict_semver()) {
        let forward = compare_versions(&a, &b);
        let backward = compare_versions(&b, &a);
        prop_assert_eq!(forward.map(Ordering::reverse), backward);
    }
}

// =============================================================================
// Property 2: Strict and lenient tiers agree
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn prop_lenient_matches_semver(a in arb_strict_semver(), b in arb_strict_semver()) {
        let strict = semver::Version::parse(&a)
            .and_then(|va| semver::Version::parse(&b).map(|vb| va.cmp(&vb)));
        prop_assume!(strict.is_ok());

        prop_assert_eq!(compare_lenient(&a, &b), strict.ok());
    }
}

// =============================================================================
// Property 3: Release validation
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Anything other than `sha256:<64 hex>` is refused.
    #[test]
    fn prop_malformed_digest_rejected(digest in "[a-z0-9:]{0,80}") {
        prop_assume!(!(digest.starts_with("sha256:") && digest.len() == 71
            && digest[7..].bytes().all(|c| c.is_ascii_hexdigit())));
        prop_assert!(parse_sha256_digest(&digest).is_none());
    }

    /// Valid digests come back as lowercase hex.
    #[test]
    fn prop_valid_digest_lowercased(bytes in prop::array::uniform32(any::<u8>()), upper in any::<bool>()) {
        let hex = hex::encode(bytes);
        let shown = if upper { hex.to_uppercase() } else { hex.clone() };
        prop_assert_eq!(parse_sha256_digest(&format!("sha256:{shown}")), Some(hex));
    }

    /// A release from an unlisted host is never an update, whatever its version.
    #[test]
    fn prop_untrusted_host_never_available(
        host in "[a-z]{3,10}\\.(com|net|io)",
        major in 3u64..100,
    ) {
        prop_assume!(host != "github.com");
        let json = release_json(
            &format!("v{major}.0.0"),
            &format!("https://{host}/app-release.apk"),
            Some(&format!("sha256:{}", "a".repeat(64))),
        );
        let release = ReleaseDescriptor::from_json(&json).unwrap();
        prop_assert!(evaluate_release(&release, "1.0.0", &TrustedOrigins::default()).is_err());
    }

    /// A release without a digest is never an update.
    #[test]
    fn prop_missing_digest_never_available(major in 3u64..100) {
        let json = release_json(
            &format!("v{major}.0.0"),
            "https://github.com/o/r/releases/download/v1/app-release.apk",
            None,
        );
        let release = ReleaseDescriptor::from_json(&json).unwrap();
        prop_assert!(evaluate_release(&release, "1.0.0", &TrustedOrigins::default()).is_err());
    }
}

// =============================================================================
// Property 4: Artifact hash verification
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(30))]

    #[test]
    fn prop_hash_matches_sha256(content in prop::collection::vec(any::<u8>(), 0..20_000)) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifact.apk");
        std::fs::write(&path, &content).unwrap();

        let expected: [u8; 32] = Sha256::digest(&content).into();
        prop_assert_eq!(compute_hash(&path).unwrap(), expected);
    }

    #[test]
    fn prop_modified_content_fails_digest(
        content in prop::collection::vec(any::<u8>(), 1..4096),
        flip in any::<prop::sample::Index>(),
    ) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifact.apk");
        let expected = hex::encode(Sha256::digest(&content));

        let mut tampered = content.clone();
        let i = flip.index(tampered.len());
        tampered[i] ^= 0x01;
        std::fs::write(&path, &tampered).unwrap();

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        prop_assert!(rt.block_on(verify_digest(&path, &expected)).is_err());
    }
}

// =============================================================================
// Property 5: Download file names
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_safe_file_name_charset(name in any::<String>()) {
        let safe = safe_file_name(&name);
        prop_assert!(!safe.is_empty());
        prop_assert!(safe
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')));
        prop_assert!(safe != "." && safe != "..");
        prop_assert!(!safe.contains('/'));
    }

    #[test]
    fn prop_safe_file_name_keeps_clean_names(name in "[A-Za-z0-9_-][A-Za-z0-9._-]{0,30}") {
        prop_assert_eq!(safe_file_name(&name), name);
    }
}
