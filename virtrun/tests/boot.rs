//! End-to-end boot scenarios.
//!
//! These need a real kernel image, QEMU, and a guest payload, so they
//! only run when the environment provides them:
//!
//! ```console
//! VIRTRUN_KERNEL=/path/to/vmlinuz \
//! VIRTRUN_INIT=target/x86_64-unknown-linux-musl/release/virtrun-init \
//! VIRTRUN_TEST_PAYLOAD=/path/to/static-payload \
//! cargo test -p virtrun --test boot
//! ```
//!
//! Without the variables every test returns early.

use std::path::PathBuf;

use virtrun::{Error, RunSpec};

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn boot_spec() -> Option<RunSpec> {
    Some(RunSpec {
        kernel: env_path("VIRTRUN_KERNEL")?,
        executable: env_path("VIRTRUN_TEST_PAYLOAD")?,
        init: Some(env_path("VIRTRUN_INIT")?),
        rewrite_test_flags: true,
        ..RunSpec::default()
    })
}

#[tokio::test]
async fn payload_exit_code_reaches_the_host() {
    let Some(spec) = boot_spec() else { return };
    let (_tx, rx) = tokio::sync::oneshot::channel();
    let code = virtrun::run(spec, rx).await.expect("guest run failed");
    assert_eq!(code, 0);
}

#[tokio::test]
async fn cancellation_during_boot_reports_cancelled() {
    let Some(spec) = boot_spec() else { return };
    let (tx, rx) = tokio::sync::oneshot::channel();
    let _ = tx.send(());
    match virtrun::run(spec, rx).await {
        // The guest may still win the race and print its marker.
        Ok(_) | Err(Error::Cancelled) => {}
        Err(other) => panic!("unexpected error: {other}"),
    }
}
