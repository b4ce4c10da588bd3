//! Integration tests: create, start, report and tear down groups through the
//! built-in handlers.

mod common;

use common::{request, run, Host};
use cvd::ErrorKind;
use serde_json::Value;

fn json(text: &str) -> Value {
    serde_json::from_str(text).expect("handler printed JSON")
}

#[test]
fn create_registers_and_starts_default_group() {
    let host = Host::new();
    let sequencer = host.sequencer();
    let host_path = format!("--host_path={}", host.artifacts_path().display());

    let (result, out, err) = run(&sequencer, &request(&["create", host_path.as_str()], &[], &[]));
    result.expect("create succeeds");

    assert!(err.contains("Executing `cvd start -group_name cvd`"), "{err}");
    assert_eq!(host.calls(), vec!["launch cvd".to_owned()]);
    let group = json(&out);
    assert_eq!(group["group_name"], "cvd");
    assert_eq!(group["instances"][0]["id"], 1);
    assert_eq!(group["instances"][0]["state"], "RUNNING");
    assert!(group["start_time"].is_string());

    let (result, out, _) = run(&sequencer, &request(&["status"], &[], &[]));
    result.expect("status succeeds");
    let status = json(&out);
    assert_eq!(status[0]["device_name"], "cvd-1");

    let (result, out, _) = run(&sequencer, &request(&["fleet"], &[], &[]));
    result.expect("fleet succeeds");
    assert_eq!(json(&out)["groups"].as_array().map(Vec::len), Some(1));
}

#[test]
fn second_create_gets_a_fresh_group_and_id() {
    let host = Host::new();
    let sequencer = host.sequencer();
    let host_path = format!("--host_path={}", host.artifacts_path().display());

    run(&sequencer, &request(&["create", host_path.as_str()], &[], &[])).0.expect("first create");
    let (result, out, _) = run(&sequencer, &request(&["create", host_path.as_str(), "--nostart"], &[], &[]));
    result.expect("second create");

    let group = json(&out);
    assert_ne!(group["group_name"], "cvd");
    assert_eq!(group["instances"][0]["id"], 2);
    assert_eq!(group["instances"][0]["state"], "UNSPECIFIED");
    assert_eq!(host.calls(), vec!["launch cvd".to_owned()]);

    // Two groups: status now needs a selector.
    let (result, _, _) = run(&sequencer, &request(&["status"], &[], &[]));
    assert_eq!(result.expect_err("ambiguous").kind(), ErrorKind::AmbiguousSelection);
}

#[test]
fn status_on_an_empty_host_is_an_empty_list() {
    let host = Host::new();
    let (result, out, _) = run(&host.sequencer(), &request(&["status"], &[], &[]));
    result.expect("status succeeds");
    assert_eq!(json(&out), Value::Array(Vec::new()));
}

#[test]
fn create_takes_ids_and_names_from_flags() {
    let host = Host::new();
    let host_path = format!("--host_path={}", host.artifacts_path().display());
    let (result, out, _) = run(
        &host.sequencer(),
        &request(
            &["create", host_path.as_str(), "--group_name=phones", "--instance_nums=7,9", "--instance_names=a,b", "--nostart"],
            &[],
            &[],
        ),
    );
    result.expect("create succeeds");
    let group = json(&out);
    assert_eq!(group["group_name"], "phones");
    assert_eq!(group["instances"][1]["device_name"], "phones-b");
    assert_eq!(group["instances"][1]["id"], 9);

    let (result, _, _) =
        run(&host.sequencer(), &request(&["create", host_path.as_str(), "--instance_nums=1,2", "--instance_names=a"], &[], &[]));
    assert_eq!(result.expect_err("mismatched lists").kind(), ErrorKind::BadRequest);
}

#[test]
fn remove_stops_an_active_group_first() {
    let host = Host::new();
    let sequencer = host.sequencer();
    let host_path = format!("--host_path={}", host.artifacts_path().display());
    run(&sequencer, &request(&["create", host_path.as_str()], &[], &[])).0.expect("create");

    let (result, _, err) = run(&sequencer, &request(&["rm"], &[], &[]));
    result.expect("remove succeeds");
    assert!(err.contains("Executing `cvd stop -group_name cvd`"), "{err}");
    assert_eq!(host.calls(), vec!["launch cvd".to_owned(), "stop cvd".to_owned()]);
    assert!(host.manager.database().is_empty().expect("read database"));
}

#[test]
fn power_actions_target_one_instance() {
    let host = Host::new();
    host.add_group("g", &[(1, "a"), (2, "b")]);
    let sequencer = host.sequencer();

    let (result, _, _) = run(&sequencer, &request(&["powerbtn"], &["-instance_name", "a"], &[]));
    assert_eq!(result.expect_err("not started").kind(), ErrorKind::BadTransition);
    run(&sequencer, &request(&["start"], &[], &[])).0.expect("start g");

    let (result, _, _) = run(&sequencer, &request(&["powerwash"], &[], &[]));
    assert_eq!(result.expect_err("two candidates").kind(), ErrorKind::AmbiguousSelection);

    run(&sequencer, &request(&["powerwash"], &["-instance_name", "b"], &[])).0.expect("powerwash b");
    run(&sequencer, &request(&["power", "restart"], &["-instance_name", "a"], &[])).0.expect("restart a");
    assert_eq!(host.calls(), vec!["launch g".to_owned(), "powerwash g-b".to_owned(), "restart g-a".to_owned()]);

    let (result, _, _) = run(&sequencer, &request(&["power", "reboot"], &["-instance_name", "a"], &[]));
    assert_eq!(result.expect_err("unknown action").kind(), ErrorKind::BadRequest);
}

#[test]
fn screen_recording_and_snapshots_cover_the_selection() {
    let host = Host::new();
    host.add_group("g", &[(1, "a"), (2, "b")]);
    let sequencer = host.sequencer();
    run(&sequencer, &request(&["start"], &[], &[])).0.expect("start g");

    run(&sequencer, &request(&["screen_recording", "start"], &[], &[])).0.expect("record");
    run(&sequencer, &request(&["suspend"], &["-instance_name", "b"], &[])).0.expect("suspend b");
    run(&sequencer, &request(&["snapshot", "take", "--snapshot_path=/snap"], &[], &[])).0.expect("snapshot");

    assert_eq!(
        host.calls(),
        vec![
            "launch g".to_owned(),
            "start_screen_recording g-a".to_owned(),
            "start_screen_recording g-b".to_owned(),
            "run snapshot_util_cvd --subcmd=suspend --instance_nums=2".to_owned(),
            "run snapshot_util_cvd --subcmd=snapshot_take --instance_nums=1,2 --snapshot_path=/snap".to_owned(),
        ]
    );
}

#[test]
fn lint_and_load_read_a_configuration_file() {
    let host = Host::new();
    let dir = tempfile::tempdir().expect("config dir");
    let path = dir.path().join("env.json");
    let config = serde_json::json!({
        "common": { "group_name": "loaded", "host_package": host.artifacts_path() },
        "instances": [ { "name": "phone" }, { "name": "watch" } ]
    });
    std::fs::write(&path, config.to_string()).expect("write config");
    let path = path.display().to_string();
    let sequencer = host.sequencer();

    let (result, out, _) = run(&sequencer, &request(&["lint", path.as_str()], &[], &[]));
    result.expect("lint succeeds");
    assert!(out.ends_with("2 instance(s), no issues found\n"), "{out}");
    assert!(host.calls().is_empty());

    let (result, _, err) = run(&sequencer, &request(&["load", path.as_str()], &[], &[]));
    result.expect("load succeeds");
    assert!(err.contains("--group_name=loaded"), "{err}");
    assert!(err.contains("--instance_names=phone,watch"), "{err}");
    assert_eq!(host.calls(), vec!["launch loaded".to_owned()]);

    std::fs::write(dir.path().join("bad.json"), "{ not json").expect("write bad config");
    let bad = dir.path().join("bad.json").display().to_string();
    let (result, _, _) = run(&sequencer, &request(&["lint", bad.as_str()], &[], &[]));
    assert_eq!(result.expect_err("bad json").kind(), ErrorKind::BadRequest);
}

#[test]
fn acloud_create_runs_the_translated_create() {
    let host = Host::new();
    let artifacts = host.artifacts_path().display().to_string();
    let (result, _, err) = run(
        &host.sequencer(),
        &request(&["acloud", "create", "--local-instance", "3"], &[], &[("ANDROID_HOST_OUT", artifacts.as_str())]),
    );
    result.expect("acloud create succeeds");
    assert!(err.contains("--instance_nums=3"), "{err}");
    let group = host.manager.group("cvd").expect("group created");
    assert_eq!(group.instance_ids(), vec![3]);
}
