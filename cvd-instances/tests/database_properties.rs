//! Integration tests: instance database invariants and persistence.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use cvd_core::Group;
use cvd_instances::{InstanceDatabase, InstancesError, Query};

fn host_artifacts() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("temp dir");
    let bin = dir.path().join("bin");
    fs::create_dir_all(&bin).expect("create bin");
    fs::write(bin.join("launch_cvd"), b"").expect("write launch_cvd");
    dir
}

fn group(host: &Path, name: &str, home: &str, instances: &[(u32, &str)]) -> Group {
    instances
        .iter()
        .fold(Group::builder(name).home_directory(home).host_artifacts_path(host), |b, (id, n)| {
            b.instance(*id, *n)
        })
        .build()
        .unwrap_or_else(|e| panic!("building {name} failed: {e}"))
}

#[test]
fn empty_database_then_one_group_is_found_by_name_and_id() {
    let host = host_artifacts();
    let db = InstanceDatabase::in_memory();
    assert_eq!(db.is_empty().ok(), Some(true));

    db.add_instance_group(group(host.path(), "meow", "/w/meow", &[(1, "ins1")]))
        .expect("add meow");

    let meow = db.find_group(&Query::by_group_name("meow")).expect("find meow");
    assert_eq!(meow.instances().len(), 1);
    assert_eq!(meow.instances()[0].id(), 1);
    assert_eq!(meow.instances()[0].name(), "ins1");

    let (instance, owner) = db.find_instance_with_group(&Query::by_instance_id(1)).expect("find id 1");
    assert_eq!(instance.name(), "ins1");
    assert_eq!(owner.name(), "meow");
}

#[test]
fn duplicate_home_is_rejected_and_database_unchanged() {
    let host = host_artifacts();
    let db = InstanceDatabase::in_memory();
    db.add_instance_group(group(host.path(), "a", "/w/h", &[(1, "x")])).expect("add a");

    let result = db.add_instance_group(group(host.path(), "b", "/w/h", &[(2, "y")]));
    assert!(matches!(result, Err(InstancesError::DuplicateHome { .. })), "got {result:?}");

    let names: Vec<String> = db
        .instance_groups()
        .expect("list groups")
        .iter()
        .map(|g| g.name().to_owned())
        .collect();
    assert_eq!(names, vec!["a"]);
}

#[test]
fn duplicate_id_across_groups_is_rejected() {
    let host = host_artifacts();
    let db = InstanceDatabase::in_memory();
    db.add_instance_group(group(host.path(), "g1", "/w/g1", &[(5, "x")])).expect("add g1");

    let result = db.add_instance_group(group(host.path(), "g2", "/w/g2", &[(5, "y")]));
    assert!(matches!(result, Err(InstancesError::DuplicateId { id: 5, .. })), "got {result:?}");
}

#[test]
fn duplicate_group_name_is_rejected() {
    let host = host_artifacts();
    let db = InstanceDatabase::in_memory();
    db.add_instance_group(group(host.path(), "g", "/w/1", &[(1, "x")])).expect("add g");
    let result = db.add_instance_group(group(host.path(), "g", "/w/2", &[(2, "x")]));
    assert!(matches!(result, Err(InstancesError::DuplicateGroupName { .. })), "got {result:?}");
}

#[test]
fn remove_is_idempotent() {
    let host = host_artifacts();
    let db = InstanceDatabase::in_memory();
    db.add_instance_group(group(host.path(), "a", "/w/a", &[(1, "x")])).expect("add a");
    db.add_instance_group(group(host.path(), "b", "/w/b", &[(2, "y")])).expect("add b");

    assert_eq!(db.remove_instance_group("a").ok(), Some(true));
    let after_first = db.instance_groups().expect("list groups");
    assert_eq!(db.remove_instance_group("a").ok(), Some(false));
    let after_second = db.instance_groups().expect("list groups");
    assert_eq!(after_first, after_second);
}

#[test]
fn find_group_reports_not_found_and_ambiguity() {
    let host = host_artifacts();
    let db = InstanceDatabase::in_memory();
    db.add_instance_group(group(host.path(), "a", "/w/a", &[(1, "x")])).expect("add a");
    db.add_instance_group(group(host.path(), "b", "/w/b", &[(2, "x")])).expect("add b");

    assert!(matches!(
        db.find_group(&Query::by_group_name("zzz")),
        Err(InstancesError::NotFound { .. })
    ));
    assert!(matches!(
        db.find_group(&Query::all().with_instance_names(["x"])),
        Err(InstancesError::Ambiguous { count: 2, .. })
    ));
    let both = db.find_groups(&Query::all().with_instance_names(["x"])).expect("find groups");
    assert_eq!(both.iter().map(Group::name).collect::<Vec<_>>(), vec!["a", "b"]);
}

#[test]
fn file_database_survives_reopen_with_equal_query_results() {
    let host = host_artifacts();
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("instance_database.json");
    let db = InstanceDatabase::open(&path, Duration::from_secs(1));
    db.add_instance_group(group(host.path(), "phone", "/w/phone", &[(1, "a"), (2, "b")]))
        .expect("add phone");
    db.add_instance_group(group(host.path(), "tablet", "/w/tablet", &[(3, "a")]))
        .expect("add tablet");
    db.update_group_with("phone", |g| {
        g.set_instance_state(1, cvd_core::InstanceState::Preparing)?;
        Ok(())
    })
    .expect("update phone");

    let text = fs::read_to_string(&path).expect("read database file");
    assert!(text.contains("\"Groups\""), "missing Groups key: {text}");

    let reopened = InstanceDatabase::open(&path, Duration::from_secs(1));
    let queries = [
        Query::all(),
        Query::by_group_name("phone"),
        Query::by_instance_id(3),
        Query::by_home("/w/tablet"),
        Query::all().with_instance_names(["a"]),
        Query::all().with_instance_names(["b"]),
    ];
    for query in &queries {
        assert_eq!(
            db.find_groups(query).expect("original"),
            reopened.find_groups(query).expect("reopened"),
            "query {query}"
        );
        assert_eq!(
            db.find_instances(query).expect("original"),
            reopened.find_instances(query).expect("reopened"),
            "query {query}"
        );
    }
}

#[test]
fn clear_returns_groups_and_leaves_an_empty_file() {
    let host = host_artifacts();
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("db.json");
    let db = InstanceDatabase::open(&path, Duration::from_secs(1));
    db.add_instance_group(group(host.path(), "a", "/w/a", &[(1, "x")])).expect("add a");
    assert!(path.exists());

    let cleared = db.clear().expect("clear");
    assert_eq!(cleared.len(), 1);
    assert!(path.exists());
    assert_eq!(db.is_empty().ok(), Some(true));
    let reopened = InstanceDatabase::open(&path, Duration::from_secs(1));
    assert_eq!(reopened.is_empty().ok(), Some(true));
}

#[test]
fn concurrent_writers_never_lose_an_acknowledged_add() {
    const ADDS: u32 = 40;
    let host = host_artifacts();
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("db.json");
    let writer = InstanceDatabase::open(&path, Duration::from_secs(10));
    let clearer = InstanceDatabase::open(&path, Duration::from_secs(10));

    let (added, cleared) = std::thread::scope(|scope| {
        let adds = scope.spawn(|| {
            let mut added = Vec::new();
            for i in 0..ADDS {
                let name = format!("g{i}");
                let g = group(host.path(), &name, &format!("/w/{name}"), &[(i + 1, "x")]);
                writer.add_instance_group(g).expect("concurrent add");
                added.push(name);
            }
            added
        });
        let clears = scope.spawn(|| {
            let mut cleared = Vec::new();
            for _ in 0..ADDS {
                let groups = clearer.clear().expect("concurrent clear");
                cleared.extend(groups.iter().map(|g| g.name().to_owned()));
            }
            cleared
        });
        (adds.join().expect("add thread"), clears.join().expect("clear thread"))
    });

    let remaining: Vec<String> = writer
        .instance_groups()
        .expect("list groups")
        .iter()
        .map(|g| g.name().to_owned())
        .collect();
    let seen: HashSet<&String> = cleared.iter().chain(remaining.iter()).collect();
    for name in &added {
        assert!(seen.contains(name), "{name} was added but neither cleared nor kept");
    }
    assert_eq!(cleared.len() + remaining.len(), added.len());
}

#[test]
fn rejected_write_leaves_file_bytes_unchanged() {
    let host = host_artifacts();
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("db.json");
    let db = InstanceDatabase::open(&path, Duration::from_secs(1));
    db.add_instance_group(group(host.path(), "a", "/w/a", &[(1, "x")])).expect("add a");
    let before = fs::read(&path).expect("read database file");

    let result = db.add_instance_group(group(host.path(), "b", "/w/b", &[(1, "y")]));
    assert!(matches!(result, Err(InstancesError::DuplicateId { id: 1, .. })), "got {result:?}");
    let result = db.update_group_with("a", |_| Err(InstancesError::Cancelled));
    assert!(matches!(result, Err(InstancesError::Cancelled)), "got {result:?}");

    assert_eq!(fs::read(&path).expect("reread database file"), before);
    let names: Vec<String> =
        db.instance_groups().expect("list groups").iter().map(|g| g.name().to_owned()).collect();
    assert_eq!(names, vec!["a"]);
}

#[derive(Debug, Clone)]
enum Op {
    Add { name: usize, home: usize, ids: Vec<u32> },
    Remove { name: usize },
    Update { name: usize, home: usize, ids: Vec<u32> },
}

fn op_strategy() -> impl proptest::strategy::Strategy<Value = Op> {
    use proptest::prelude::*;
    let ids = proptest::collection::vec(1u32..12, 1..4);
    prop_oneof![
        (0usize..4, 0usize..4, ids.clone()).prop_map(|(name, home, ids)| Op::Add { name, home, ids }),
        (0usize..4).prop_map(|name| Op::Remove { name }),
        (0usize..4, 0usize..4, ids).prop_map(|(name, home, ids)| Op::Update { name, home, ids }),
    ]
}

fn build_op_group(host: &Path, name: usize, home: usize, ids: &[u32]) -> Option<Group> {
    let builder = ids.iter().fold(
        Group::builder(format!("g{name}"))
            .home_directory(format!("/w/h{home}"))
            .host_artifacts_path(host),
        |b, id| b.instance(*id, format!("i{id}")),
    );
    // Duplicate ids inside one group are rejected by the builder.
    builder.build().ok()
}

fn assert_invariants(groups: &[Group]) -> Result<(), proptest::test_runner::TestCaseError> {
    let mut names = HashSet::new();
    let mut homes = HashSet::new();
    let mut ids = BTreeSet::new();
    for g in groups {
        proptest::prop_assert!(names.insert(g.name().to_owned()), "duplicate name {}", g.name());
        proptest::prop_assert!(homes.insert(g.home_directory().to_owned()), "duplicate home");
        let mut local_names = HashSet::new();
        for i in g.instances() {
            proptest::prop_assert!(ids.insert(i.id()), "duplicate id {}", i.id());
            proptest::prop_assert!(local_names.insert(i.name().to_owned()), "duplicate instance name");
        }
        proptest::prop_assert!(g.validate().is_ok());
    }
    Ok(())
}

proptest::proptest! {
    #[test]
    fn proptest_invariants_hold_after_any_operation_sequence(
        ops in proptest::collection::vec(op_strategy(), 1..24),
    ) {
        let host = host_artifacts();
        let db = InstanceDatabase::in_memory();
        for op in ops {
            match op {
                Op::Add { name, home, ids } => {
                    if let Some(g) = build_op_group(host.path(), name, home, &ids) {
                        let _ = db.add_instance_group(g);
                    }
                }
                Op::Remove { name } => {
                    let _ = db.remove_instance_group(&format!("g{name}"));
                }
                Op::Update { name, home, ids } => {
                    if let Some(g) = build_op_group(host.path(), name, home, &ids) {
                        let _ = db.update_instance_group(g);
                    }
                }
            }
            let groups = db.instance_groups().map_err(|e| proptest::test_runner::TestCaseError::fail(e.to_string()))?;
            assert_invariants(&groups)?;
            for g in &groups {
                for id in g.instance_ids() {
                    let (_, owner) = db
                        .find_instance_with_group(&Query::by_instance_id(id))
                        .map_err(|e| proptest::test_runner::TestCaseError::fail(e.to_string()))?;
                    proptest::prop_assert_eq!(owner.name(), g.name());
                }
                let by_home = db
                    .find_group(&Query::by_home(g.home_directory()))
                    .map_err(|e| proptest::test_runner::TestCaseError::fail(e.to_string()))?;
                proptest::prop_assert_eq!(by_home.name(), g.name());
            }
        }
    }
}
