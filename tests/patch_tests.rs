// Patch ordering through the full pipeline
// The second patch's context only exists after the first one is applied


use debrew::{DebrewError, Engine, Stage};
use serde_json::json;
use std::io::Read;
use test_helpers::*;

const CONFIG_MK: &str = "PREFIX=/usr\nCC=gcc\nCFLAGS=-O2\n";

const PATCH_A: &str = "\
--- a/config.mk
+++ b/config.mk
@@ -1,2 +1,2 @@
-PREFIX=/usr
+PREFIX=/usr/local
 CC=gcc
";

const PATCH_B: &str = "\
--- a/config.mk
+++ b/config.mk
@@ -1,3 +1,3 @@
 PREFIX=/usr/local
-CC=gcc
+CC=clang
 CFLAGS=-O2
";

fn libvirt_json(env: &TestEnvironment, patches: &[&str]) -> serde_json::Value {
    let tarball = env.tarball(
        "libvirt-1.0.2.tar.gz",
        &[
            ("libvirt-1.0.2/config.mk", CONFIG_MK),
            ("libvirt-1.0.2/README", "libvirt\n"),
        ],
    );
    env.patch_file("a.patch", PATCH_A);
    env.patch_file("b.patch", PATCH_B);

    json!({
        "name": "libvirt",
        "version": "1.0.2+github1",
        "url": file_url(&tarball),
        "sha256": sha256_hex(&tarball),
        "patches": patches,
        "install": ["mkdir -p $PREFIX/share/libvirt && cp config.mk $PREFIX/share/libvirt/"]
    })
}

#[tokio::test]
async fn test_patches_apply_in_declared_order() {
    let env = TestEnvironment::new();
    let formula = env.formula("libvirt", libvirt_json(&env, &["a.patch", "b.patch"]));

    let result = Engine::new(env.config()).unwrap().build(&formula).await.unwrap();

    let members = deb_members(&result.deb_path);
    let (_, data) = members.iter().find(|(n, _)| n == "data.tar.gz").unwrap();
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(data.as_slice()));
    let mut config = String::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.path().unwrap().ends_with("config.mk") {
            entry.read_to_string(&mut config).unwrap();
        }
    }
    assert_eq!(config, "PREFIX=/usr/local\nCC=clang\nCFLAGS=-O2\n");
}

#[tokio::test]
async fn test_reversed_patches_fail_at_first() {
    let env = TestEnvironment::new();
    let formula = env.formula("libvirt", libvirt_json(&env, &["b.patch", "a.patch"]));

    let err = Engine::new(env.config()).unwrap().build(&formula).await.unwrap_err();

    assert_eq!(err.stage, Stage::Patch);
    match &err.source {
        DebrewError::PatchFailed { index, patch, .. } => {
            assert_eq!(*index, 0);
            assert_eq!(patch, "b.patch");
        }
        other => panic!("expected patch failure, got {other}"),
    }
    assert!(env.debs().is_empty());
}

#[tokio::test]
async fn test_missing_patch_file() {
    let env = TestEnvironment::new();
    let formula = env.formula("libvirt", libvirt_json(&env, &["a.patch", "gone.patch"]));

    let err = Engine::new(env.config()).unwrap().build(&formula).await.unwrap_err();
    assert_eq!(err.stage, Stage::Patch);
    assert!(matches!(err.source, DebrewError::PatchFailed { index: 1, .. }));
}
