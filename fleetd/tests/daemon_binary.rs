#![cfg(unix)]

use std::net::TcpListener as StdListener;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use fleetd_client::DeviceClient;
use serde_json::json;
use tempfile::tempdir;
use tokio::time::sleep;

fn fleetd_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_fleetd"))
}

fn free_port() -> u16 {
    let listener = StdListener::bind("127.0.0.1:0").expect("bind probe port");
    listener.local_addr().expect("probe addr").port()
}

#[tokio::test]
async fn binary_serves_commands_and_flushes_on_sigterm() {
    let dir = tempdir().unwrap();
    let tasks_path = dir.path().join("data/tasks.json");
    std::fs::create_dir_all(tasks_path.parent().unwrap()).unwrap();
    std::fs::write(
        &tasks_path,
        json!({
            "TaskConfig": {"reboot": {"type": "power", "body": {"RequestType": "REBOOT"}}},
            "device_task_list": {
                "dev-7": [{"task": "reboot", "CommandUUID": "r1", "interval": 0,
                           "lastExecuted": 0, "oneTime": true, "consumed": false}]
            }
        })
        .to_string(),
    )
    .unwrap();

    let port = free_port();
    let mut child = Command::new(fleetd_binary())
        .arg("--data-dir")
        .arg(dir.path())
        .arg("--port")
        .arg(port.to_string())
        .arg("--bind")
        .arg("127.0.0.1")
        .current_dir(dir.path())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn fleetd");

    let mut client = None;
    for _ in 0..50 {
        match DeviceClient::connect(("127.0.0.1", port), "dev-7").await {
            Ok(connected) => {
                client = Some(connected);
                break;
            }
            Err(_) => sleep(Duration::from_millis(100)).await,
        }
    }
    let mut client = client.expect("daemon should accept connections");

    let push = client
        .poll(Duration::from_secs(2))
        .await
        .unwrap()
        .expect("pending command");
    assert_eq!(push.command_uuid, "r1");
    assert_eq!(push.content.body["RequestType"], "REBOOT");

    let status = Command::new("kill")
        .arg("-TERM")
        .arg(child.id().to_string())
        .status()
        .expect("send SIGTERM");
    assert!(status.success());

    let mut exited = None;
    for _ in 0..50 {
        if let Some(status) = child.try_wait().unwrap() {
            exited = Some(status);
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    let exited = match exited {
        Some(status) => status,
        None => {
            let _ = child.kill();
            panic!("fleetd did not exit after SIGTERM");
        }
    };
    assert!(exited.success());

    let saved: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&tasks_path).unwrap()).unwrap();
    assert_eq!(saved["device_task_list"]["dev-7"][0]["consumed"], true);
    assert!(dir.path().join("static/device_registry_data.json").is_file());
}

#[test]
fn binary_refuses_to_start_without_task_configuration() {
    let dir = tempdir().unwrap();
    let status = Command::new(fleetd_binary())
        .arg("--data-dir")
        .arg(dir.path())
        .arg("--port")
        .arg(free_port().to_string())
        .current_dir(dir.path())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("run fleetd");
    assert!(!status.success());
}
