//! Calling `leave_real_time` before `lower_privileges` is a programming
//! error and must abort the caller.
//!
//! The violating call runs in a child copy of this test binary so the
//! panic is observed from outside, the way a release build (`panic =
//! "abort"`) would surface it.

use fsk_runtime::realtime::RealtimeController;
use std::process::Command;

const CHILD_ENV: &str = "FSK_CONTRACT_VIOLATION_CHILD";
const CHILD_TEST: &str = "leave_before_lower_child";

#[test]
#[ignore = "spawned by test_leave_before_lower_aborts"]
fn leave_before_lower_child() {
    if std::env::var_os(CHILD_ENV).is_none() {
        return;
    }
    let mut controller = RealtimeController::new();
    let _ = controller.leave_real_time();
}

#[test]
fn test_leave_before_lower_aborts() {
    let exe = std::env::current_exe().expect("current test binary");
    let output = Command::new(exe)
        .args([CHILD_TEST, "--exact", "--ignored", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .output()
        .expect("spawn child test");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(
        !output.status.success(),
        "child should fail\nstdout:\n{stdout}\nstderr:\n{stderr}"
    );
    assert!(
        stderr.contains("contract violation") || stdout.contains("contract violation"),
        "missing diagnostic\nstdout:\n{stdout}\nstderr:\n{stderr}"
    );
}
