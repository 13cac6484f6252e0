//! CLI-level exercises: status without a daemon, and a full
//! start → update-profile → sync → log → stop round through a spawned
//! daemon process.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use predicates::prelude::*;
use tempfile::TempDir;

use tether_core::profile::{Profile, ProfileType, KEY_ENABLED};
use tether_core::xml;

fn tether_bin() -> PathBuf {
    assert_cmd::cargo::cargo_bin("tether")
}

fn cli(dir: &TempDir) -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("tether").expect("tether binary");
    cmd.args([
        "--primary",
        dir.path().join("primary").to_str().unwrap(),
        "--secondary",
        dir.path().join("secondary").to_str().unwrap(),
    ]);
    cmd
}

struct DaemonProcess {
    child: Child,
}

impl DaemonProcess {
    fn start(dir: &TempDir) -> Self {
        let child = Command::new(tether_bin())
            .args([
                "--primary",
                dir.path().join("primary").to_str().unwrap(),
                "--secondary",
                dir.path().join("secondary").to_str().unwrap(),
                "daemon",
                "start",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn daemon");
        Self { child }
    }

    fn wait_for_socket(dir: &TempDir) {
        let socket = dir.path().join("primary").join("run").join("tetherd.sock");
        let deadline = Instant::now() + Duration::from_secs(5);
        while !socket.exists() {
            assert!(Instant::now() < deadline, "daemon socket never appeared");
            sleep(Duration::from_millis(20));
        }
    }

    fn stop(&mut self, dir: &TempDir) {
        let _ = Command::new(tether_bin())
            .args([
                "--primary",
                dir.path().join("primary").to_str().unwrap(),
                "daemon",
                "stop",
            ])
            .status();

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            sleep(Duration::from_millis(50));
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn write_profile_file(dir: &Path, name: &str) -> PathBuf {
    let mut p = Profile::new(name, ProfileType::Sync);
    p.set_key(KEY_ENABLED, "true");
    p.sub_profiles
        .push(Profile::new("loopback", ProfileType::Client));
    let path = dir.join(format!("{name}.xml"));
    std::fs::write(&path, xml::write_profile(&p).unwrap()).unwrap();
    path
}

#[test]
fn status_reports_not_running_without_daemon() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"running\": false"));
}

#[test]
fn sync_without_daemon_points_at_daemon_start() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .args(["sync", "calendar"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("daemon is not running"));
}

#[test]
fn full_sync_round_through_a_spawned_daemon() {
    let dir = TempDir::new().unwrap();
    let mut daemon = DaemonProcess::start(&dir);
    DaemonProcess::wait_for_socket(&dir);

    let profile_file = write_profile_file(dir.path(), "addressbook");
    cli(&dir)
        .args(["profile", "update", profile_file.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("'addressbook' updated"));

    cli(&dir)
        .args(["profile", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("addressbook"));

    cli(&dir)
        .args(["transport", "usb", "true"])
        .assert()
        .success()
        .stdout(predicate::str::contains("transport event applied"));

    cli(&dir)
        .args(["sync", "addressbook"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sync requested"));

    // The loopback plugin finishes almost immediately; poll the log.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut logged = false;
    while Instant::now() < deadline {
        let output = cli(&dir)
            .args(["profile", "log", "addressbook"])
            .output()
            .expect("run log command");
        if output.status.success()
            && String::from_utf8_lossy(&output.stdout).contains("major=\"success\"")
        {
            logged = true;
            break;
        }
        sleep(Duration::from_millis(50));
    }
    assert!(logged, "sync result never reached the profile log");

    cli(&dir)
        .args(["status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"running\": true"));

    daemon.stop(&dir);
}
