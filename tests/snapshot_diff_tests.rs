use rlsaudit::config::{Expectation, Op};
use rlsaudit::output::render_diff;
use rlsaudit::probe::ProbeResultKind;
use rlsaudit::report::{diff_snapshots, PolicySnapshot, SNAPSHOT_FORMAT_VERSION};

mod support;

fn snapshot_of(cells: Vec<(&str, &str, Op, Expectation, ProbeResultKind)>) -> PolicySnapshot {
    let results = support::aggregate(
        cells
            .into_iter()
            .map(|(table, scenario, op, expected, actual)| {
                support::test_result(table, scenario, op, expected, actual)
            })
            .collect(),
    );
    PolicySnapshot::from_test_results(&results)
}

#[test]
fn snapshot_projects_the_full_matrix() {
    let snapshot = snapshot_of(vec![
        (
            "public.todos",
            "anonymous",
            Op::Select,
            Expectation::Deny,
            ProbeResultKind::Deny,
        ),
        (
            "public.todos",
            "owner",
            Op::Insert,
            Expectation::Allow,
            ProbeResultKind::Allow,
        ),
        (
            "storage:avatars",
            "anonymous",
            Op::Select,
            Expectation::Allow,
            ProbeResultKind::Allow,
        ),
    ]);

    assert_eq!(snapshot.format_version, SNAPSHOT_FORMAT_VERSION);
    assert_eq!(
        snapshot.results["public.todos"]["anonymous"][&Op::Select],
        ProbeResultKind::Deny
    );
    assert_eq!(
        snapshot.results["storage:avatars"]["anonymous"][&Op::Select],
        ProbeResultKind::Allow
    );
}

#[test]
fn snapshot_save_load_is_identity() {
    let dir = tempfile::tempdir().expect("temp dir should create");
    let path = dir.path().join("run.json");

    let snapshot = snapshot_of(vec![
        (
            "public.todos",
            "anonymous",
            Op::Select,
            Expectation::Deny,
            ProbeResultKind::Deny,
        ),
        (
            "public.nopk",
            "authenticated",
            Op::Update,
            Expectation::Allow,
            ProbeResultKind::Skipped,
        ),
    ]);
    snapshot.save(&path).expect("snapshot should save");
    let loaded = PolicySnapshot::load(&path).expect("snapshot should load");

    assert_eq!(loaded.results, snapshot.results);
    assert!(diff_snapshots(&snapshot, &loaded).is_identical());
}

#[test]
fn snapshot_file_is_human_diffable_json() {
    let dir = tempfile::tempdir().expect("temp dir should create");
    let path = dir.path().join("run.json");
    snapshot_of(vec![(
        "public.todos",
        "anonymous",
        Op::Select,
        Expectation::Deny,
        ProbeResultKind::Deny,
    )])
    .save(&path)
    .expect("snapshot should save");

    let text = std::fs::read_to_string(&path).expect("file should read");
    assert!(text.contains("\"format_version\": \"1\""));
    assert!(text.contains("\"public.todos\""));
    assert!(text.contains("\"select\": \"DENY\""));
}

#[test]
fn deny_to_allow_reports_a_single_leak() {
    let previous = snapshot_of(vec![(
        "public.posts",
        "anonymous",
        Op::Select,
        Expectation::Deny,
        ProbeResultKind::Deny,
    )]);
    let current = snapshot_of(vec![(
        "public.posts",
        "anonymous",
        Op::Select,
        Expectation::Deny,
        ProbeResultKind::Allow,
    )]);

    let comparison = diff_snapshots(&previous, &current);
    assert_eq!(comparison.leaks.len(), 1);
    assert_eq!(comparison.exit_code(), 1);
    assert_eq!(
        comparison.leaks[0].to_string(),
        "public.posts -> anonymous -> SELECT (changed from DENY to ALLOW)"
    );

    let rendered = render_diff(&comparison);
    assert!(rendered.contains("LEAK: public.posts -> anonymous -> SELECT"));
}

#[test]
fn leaks_one_way_are_regressions_the_other_way() {
    let denying = snapshot_of(vec![(
        "public.posts",
        "anonymous",
        Op::Select,
        Expectation::Deny,
        ProbeResultKind::Deny,
    )]);
    let allowing = snapshot_of(vec![(
        "public.posts",
        "anonymous",
        Op::Select,
        Expectation::Deny,
        ProbeResultKind::Allow,
    )]);

    let forward = diff_snapshots(&denying, &allowing);
    let backward = diff_snapshots(&allowing, &denying);

    assert_eq!(forward.leaks.len(), 1);
    assert!(forward.regressions.is_empty());
    assert_eq!(backward.regressions.len(), 1);
    assert!(backward.leaks.is_empty());

    assert_eq!(forward.leaks[0].table_key, backward.regressions[0].table_key);
    assert_eq!(forward.leaks[0].scenario, backward.regressions[0].scenario);
    assert_eq!(forward.leaks[0].op, backward.regressions[0].op);
}

#[test]
fn new_tables_are_informational_not_leaks() {
    let previous = snapshot_of(vec![]);
    let current = snapshot_of(vec![(
        "public.invoices",
        "anonymous",
        Op::Select,
        Expectation::Deny,
        ProbeResultKind::Allow,
    )]);

    let comparison = diff_snapshots(&previous, &current);
    assert!(comparison.leaks.is_empty());
    assert_eq!(comparison.newly_introduced.len(), 1);
    assert_eq!(comparison.exit_code(), 0);
}
