//! Worker executable contract: argument order, service registration,
//! command loop, and exit codes.

use assert_cmd::Command;
use predicates::prelude::*;

use tether_daemon::{RunnerEvent, WorkerReply};

fn worker() -> Command {
    Command::cargo_bin("tether-worker").expect("worker binary")
}

fn parse_replies(stdout: &[u8]) -> Vec<WorkerReply> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("reply line"))
        .collect()
}

#[test]
fn missing_arguments_fail_argument_parsing() {
    worker()
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn unknown_plugin_exits_with_service_failure() {
    // -2 surfaces as 254 on unix.
    let assert = worker()
        .args(["no-such-plugin", "demo", "/usr/lib/tether/no-such.so"])
        .write_stdin("")
        .assert()
        .code(254);

    // The object registration happened before the service lookup failed.
    let replies = parse_replies(&assert.get_output().stdout);
    assert_eq!(
        replies.first(),
        Some(&WorkerReply::Register {
            service: "tether.plugin.demo".to_owned()
        })
    );
}

#[test]
fn loopback_run_registers_syncs_and_exits_cleanly() {
    let assert = worker()
        .args(["loopback", "demo", "/usr/lib/tether/loopback.so"])
        .write_stdin("{\"msg\":\"start\"}\n")
        .assert()
        .success();

    let replies = parse_replies(&assert.get_output().stdout);
    assert_eq!(
        replies.first(),
        Some(&WorkerReply::Register {
            service: "tether.plugin.demo".to_owned()
        })
    );
    assert!(
        matches!(replies.get(1), Some(WorkerReply::Results { results }) if results.is_success()),
        "results precede the terminal event"
    );
    assert!(matches!(
        replies.get(2),
        Some(WorkerReply::Event {
            event: RunnerEvent::Success { .. }
        })
    ));
    assert_eq!(
        replies.last(),
        Some(&WorkerReply::Event {
            event: RunnerEvent::Done
        })
    );
}

#[test]
fn numeric_profile_names_get_the_profile_prefix() {
    let assert = worker()
        .args(["loopback", "123456", "/usr/lib/tether/loopback.so"])
        .write_stdin("")
        .assert()
        .success();

    let replies = parse_replies(&assert.get_output().stdout);
    assert_eq!(
        replies.first(),
        Some(&WorkerReply::Register {
            service: "tether.plugin.profile-123456".to_owned()
        })
    );
}

#[test]
fn eof_before_start_exits_quietly() {
    worker()
        .args(["loopback", "demo", "/usr/lib/tether/loopback.so"])
        .write_stdin("")
        .assert()
        .success();
}
