//! Manifest round trips and version resolution over scanned extensions.

mod common;

use capstan_crypto::DigestAlgorithm;
use capstan_runtime::{Manifest, RuntimeError, validate};
use capstan_test::{ExtensionFixture, pinger_fixture, word_count_fixture};
use common::{Harness, id, v};

const FULL_MANIFEST: &str = r#"
schema = 1
id = "word-count"
name = "Word Count"
version = "1.2.0"
description = "Counts words"
entry_point = "builtin:word-count"
default_enabled = false
tags = ["text", "analysis"]

[dependencies]
tokenizer = ">=1.0, <2.0"
stemmer = "^0.4"

[[actions]]
name = "count"
description = "Count the words in a text"

[[actions.parameters]]
name = "text"
type = "string"
min = 1
max = 10000

[[actions.parameters]]
name = "mode"
type = "string"
required = false
choices = ["fast", "exact"]

[[actions]]
name = "watch"
streaming = true

[checksum]
algorithm = "sha256"
digest = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"

[configuration_schema]
language = { type = "string", default = "en" }
"#;

#[test]
fn manifest_reserialization_is_idempotent() {
    let parsed = Manifest::parse(FULL_MANIFEST).unwrap();

    let reparsed = Manifest::parse(&parsed.to_toml_string()).unwrap();
    assert_eq!(parsed, reparsed);

    let revalidated = validate(&reparsed.to_document()).unwrap();
    assert_eq!(parsed, revalidated);
    assert_eq!(revalidated.to_toml_string(), parsed.to_toml_string());
}

#[tokio::test]
async fn scanned_manifests_round_trip() {
    let h = Harness::new();
    word_count_fixture("1.0.0")
        .depends_on("tokenizer", "~1.2")
        .checksum(DigestAlgorithm::Blake3)
        .write(h.roots.root());
    ExtensionFixture::new("tagged", "0.1.0-rc.1")
        .manifest_key("description", "with extras")
        .manifest_key("tags", vec!["a", "b"])
        .streaming_action("tail")
        .write(h.roots.root());

    h.runtime.scan().await;

    for entry in h.runtime.registered().await {
        let text = entry.manifest.to_toml_string();
        assert_eq!(Manifest::parse(&text).unwrap(), entry.manifest, "{text}");
    }
}

async fn three_versions() -> Harness {
    let h = Harness::new();
    for version in ["1.0.0", "1.2.0", "2.0.0-beta"] {
        pinger_fixture("x", version).write(h.roots.root());
    }
    let report = h.runtime.scan().await;
    assert!(report.is_clean(), "{:?}", report.errors);
    h
}

#[tokio::test]
async fn unspecified_request_prefers_highest_stable() {
    let h = three_versions().await;
    assert_eq!(h.runtime.resolve(&id("x"), None).await.unwrap(), v("1.2.0"));
}

#[tokio::test]
async fn prerelease_is_eligible_when_only_it_satisfies() {
    let h = three_versions().await;
    let resolve = |spec: &'static str| h.runtime.resolve_str("x", Some(spec));

    assert_eq!(resolve(">=2.0.0").await.unwrap(), v("2.0.0-beta"));
    assert_eq!(resolve(">=1.0").await.unwrap(), v("1.2.0"));
    assert_eq!(resolve("<2").await.unwrap(), v("1.2.0"));
    assert_eq!(resolve("^1").await.unwrap(), v("1.2.0"));
    assert_eq!(resolve("~=1.0").await.unwrap(), v("1.2.0"));
    assert_eq!(resolve("~1.0").await.unwrap(), v("1.0.0"));
    assert_eq!(resolve(">=1.0.0, !=1.2.0, <2.0.0").await.unwrap(), v("1.0.0"));
    assert_eq!(resolve(">=1.0.0-alpha").await.unwrap(), v("2.0.0-beta"));
    assert_eq!(resolve("*").await.unwrap(), v("1.2.0"));
}

#[tokio::test]
async fn no_match_lists_every_registered_version() {
    let h = three_versions().await;

    match h.runtime.resolve_str("x", Some("==9.9.9")).await {
        Err(RuntimeError::NoMatchingVersion {
            id: found,
            specifier,
            available,
        }) => {
            assert_eq!(found, id("x"));
            assert_eq!(specifier, "==9.9.9");
            assert_eq!(available, vec![v("1.0.0"), v("1.2.0"), v("2.0.0-beta")]);
        },
        other => panic!("expected NoMatchingVersion, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let h = three_versions().await;

    assert!(matches!(
        h.runtime.resolve_str("x", Some(">>1")).await,
        Err(RuntimeError::InvalidSpecifier(_))
    ));
    assert!(matches!(
        h.runtime.resolve_str("Not An Id", None).await,
        Err(RuntimeError::InvalidId(_))
    ));
    assert!(matches!(
        h.runtime.resolve_str("unknown", None).await,
        Err(RuntimeError::NoMatchingVersion { available, .. }) if available.is_empty()
    ));
}
