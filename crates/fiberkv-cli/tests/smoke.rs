use fiberkv::testing::MemoryServer;
use serde_json::Value;
use std::process::{Command, Output};

fn run_cli(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_fiberkv-cli"))
        .args(args)
        .env_remove("FIBERKV_ADDR")
        .env_remove("RUST_LOG")
        .output()
        .expect("cli process should start")
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn stdout(output: Output) -> String {
    String::from_utf8(output.stdout).expect("stdout should be utf8")
}

#[test]
fn help_lists_commands() {
    let output = run_cli(&["--help"]);
    assert_success(&output);
    let stdout = stdout(output);
    assert!(stdout.contains("fiberkv-cli"));
    assert!(stdout.contains("setnx"));
    assert!(stdout.contains("--memory"));
}

#[test]
fn memory_backend_answers_single_commands() {
    let output = run_cli(&["--memory", "set", "foo", "bar"]);
    assert_success(&output);
    assert_eq!(stdout(output).trim(), "OK");

    let output = run_cli(&["--memory", "--json", "get", "foo"]);
    assert_success(&output);
    let value: Value = serde_json::from_str(stdout(output).trim()).expect("json output");
    assert_eq!(value, Value::Null);
}

#[test]
fn commands_against_loopback_server_share_state() {
    let server = MemoryServer::start().expect("server should start");
    let addr = server.addr_string();

    let output = run_cli(&["--addr", &addr, "set", "foo", "bar"]);
    assert_success(&output);

    let output = run_cli(&["--addr", &addr, "get", "foo"]);
    assert_success(&output);
    assert_eq!(stdout(output).trim(), "bar");

    let output = run_cli(&["--addr", &addr, "setnx", "foo", "baz"]);
    assert_success(&output);
    assert_eq!(stdout(output).trim(), "(integer) 0");

    let output = run_cli(&["--addr", &addr, "--json", "mget", "foo", "missing"]);
    assert_success(&output);
    let value: Value = serde_json::from_str(stdout(output).trim()).expect("json output");
    assert_eq!(value, serde_json::json!(["bar", null]));

    let output = run_cli(&["--addr", &addr, "substr", "foo", "-2", "-1"]);
    assert_success(&output);
    assert_eq!(stdout(output).trim(), "ar");
}

#[test]
fn data_errors_exit_with_failure() {
    let server = MemoryServer::start().expect("server should start");
    let addr = server.addr_string();

    assert_success(&run_cli(&["--addr", &addr, "set", "foo", "bar"]));
    let output = run_cli(&["--addr", &addr, "incr", "foo"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not an integer"), "stderr:\n{stderr}");
}

#[test]
fn odd_mset_arguments_are_rejected() {
    let output = run_cli(&["--memory", "mset", "a", "1", "b"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("KEY VALUE pairs"));
}
