use std::path::Path;
use std::process::{Command, Output};

const DIFF: &str = "\
diff --git a/lib/url.c b/lib/url.c
--- a/lib/url.c
+++ b/lib/url.c
@@ -10,3 +10 @@ static CURLcode parseurl(struct Curl_easy *data)
-  a();
-  b();
-  c();
+  safe();
";

fn vfec(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_vfec"))
        .args(args)
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn stdout_json(output: &Output) -> serde_json::Value {
    assert!(
        output.status.success(),
        "vfec failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn map_reads_diff_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("fix.diff"), DIFF).unwrap();

    let json = stdout_json(&vfec(dir.path(), &["map", "--file", "fix.diff", "--format", "json"]));

    let rows = json["correspondences"].as_array().unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["vulnLine"], 10);
    assert_eq!(rows[0]["fixLine"], 10);
    assert_eq!(rows[2]["vulnLine"], 12);
    assert!(rows[2]["fixLine"].is_null());
    assert_eq!(json["hunks"][0]["file"], "lib/url.c");
}

#[test]
fn map_text_marks_absent_sides() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("fix.diff"), DIFF).unwrap();

    let output = vfec(dir.path(), &["map", "--file", "fix.diff"]);
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("lib/url.c"));
    assert!(text.contains("N/A"));
    assert!(text.contains("1 hunk(s), 3 line(s), 1 file(s)"));
}

#[test]
fn map_between_commits_defaults_to_parent() {
    let dir = tempfile::tempdir().unwrap();
    let repo = git2::Repository::init(dir.path()).unwrap();
    let sig = git2::Signature::now("vfec", "vfec@example.com").unwrap();

    let mut parent: Option<git2::Oid> = None;
    for contents in ["int a;\nint b;\n", "int a;\nint c;\nint d;\n"] {
        std::fs::write(dir.path().join("x.c"), contents).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("x.c")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let parents: Vec<git2::Commit> = parent
            .map(|oid| repo.find_commit(oid).unwrap())
            .into_iter()
            .collect();
        let refs: Vec<&git2::Commit> = parents.iter().collect();
        parent = Some(repo.commit(Some("HEAD"), &sig, &sig, "commit", &tree, &refs).unwrap());
    }

    let json = stdout_json(&vfec(
        dir.path(),
        &["map", "--repo", ".", "--fix", "HEAD", "--format", "json"],
    ));

    let hunks = json["hunks"].as_array().unwrap();
    assert_eq!(hunks.len(), 1);
    assert_eq!(hunks[0]["vulnStart"], 2);
    assert_eq!(hunks[0]["vulnLen"], 1);
    assert_eq!(hunks[0]["fixLen"], 2);
}

#[test]
fn coverage_joins_both_reports() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("fix.diff"), DIFF).unwrap();
    std::fs::write(
        dir.path().join("vuln.info"),
        "SF:/src/curl/lib/url.c\nDA:11,3\nDA:12,0\nend_of_record\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("fix.info"),
        "SF:/src/curl/lib/url.c\nDA:10,5\nend_of_record\n",
    )
    .unwrap();

    let args = [
        "coverage",
        "--diff",
        "fix.diff",
        "--vuln-lcov",
        "vuln.info",
        "--fix-lcov",
        "fix.info",
        "--root",
        "/src/curl",
        "--format",
        "json",
    ];
    let json = stdout_json(&vfec(dir.path(), &args));

    assert_eq!(json["view"], "master");
    let rows = json["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows[0]["vulnHits"].is_null());
    assert_eq!(rows[0]["fixHits"], 5);
    assert_eq!(rows[1]["vulnHits"], 3);
    assert_eq!(rows[2]["vulnHits"], 0);
    assert_eq!(rows[2]["executable"], true);
    assert_eq!(json["summary"]["vulnLines"], 2);
    assert_eq!(json["summary"]["vulnHits"], 1);
    assert_eq!(json["summary"]["fixHits"], 1);
}

#[test]
fn coverage_clean_view_drops_unexecutable_rows() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("fix.diff"), DIFF).unwrap();
    std::fs::write(dir.path().join("vuln.info"), "SF:lib/url.c\nDA:11,3\nend_of_record\n").unwrap();
    std::fs::write(dir.path().join("fix.info"), "").unwrap();

    let json = stdout_json(&vfec(
        dir.path(),
        &[
            "coverage", "--diff", "fix.diff", "--vuln-lcov", "vuln.info", "--fix-lcov",
            "fix.info", "--clean", "--format", "json",
        ],
    ));

    assert_eq!(json["view"], "clean");
    let rows = json["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["vulnLine"], 11);
}

#[test]
fn coverage_requires_existing_reports() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("fix.diff"), DIFF).unwrap();

    let output = vfec(
        dir.path(),
        &["coverage", "--diff", "fix.diff", "--vuln-lcov", "nope.info", "--fix-lcov", "nope.info"],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("nope.info"));
}

#[test]
fn calibrate_reports_loop_count() {
    let dir = tempfile::tempdir().unwrap();

    let json = stdout_json(&vfec(dir.path(), &["calibrate", "--format", "json", "--", "true"]));

    let loops = json["loopCount"].as_u64().unwrap();
    assert!((1..=2000).contains(&loops));
    assert!(json["dryRunDurationSec"].as_f64().unwrap() >= 0.0);
}

#[test]
fn calibrate_failing_command_errors() {
    let dir = tempfile::tempdir().unwrap();

    let output = vfec(dir.path(), &["calibrate", "--", "false"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("calibration"));
}

#[test]
fn measure_rejects_infinite_cool_down() {
    let dir = tempfile::tempdir().unwrap();

    let output = vfec(dir.path(), &["measure", "--cool-down", "inf", "--", "true"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--cool-down"), "{stderr}");
    assert!(!stderr.contains("panicked"), "{stderr}");
}

#[test]
fn unrepresentable_config_duration_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("vfec.toml"), "[energy]\ncool_down_secs = inf\n").unwrap();

    let output = vfec(dir.path(), &["calibrate", "--", "true"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cool_down_secs"), "{stderr}");
}

fn seed_ledger(dir: &Path) {
    use vfec_core::{UnitKey, UnitStage};

    std::fs::write(dir.join("vfec.toml"), "[state]\nledger_path = \"state/ledger.db\"\n").unwrap();
    let ledger = vfec_pipeline::StateLedger::open(&dir.join("state/ledger.db")).unwrap();
    for (project, test, stage) in [
        ("curl", "1", UnitStage::Aggregated),
        ("curl", "2", UnitStage::Failed),
        ("openssl", "t", UnitStage::Failed),
    ] {
        let key = UnitKey {
            project: project.into(),
            commit: "da0db4993f".into(),
            test: test.into(),
        };
        ledger.advance(&key, stage).unwrap();
    }
}

#[test]
fn status_lists_units_per_project() {
    let dir = tempfile::tempdir().unwrap();
    seed_ledger(dir.path());

    let json = stdout_json(&vfec(dir.path(), &["status", "--project", "curl", "--format", "json"]));
    let units = json.as_array().unwrap();
    assert_eq!(units.len(), 2);
    assert_eq!(units[0]["key"]["test"], "1");
    assert_eq!(units[0]["stage"], "aggregated");
    assert_eq!(units[1]["stage"], "failed");

    let text = vfec(dir.path(), &["status"]);
    assert!(String::from_utf8_lossy(&text.stdout).contains("openssl@da0db499:t"));
}

#[test]
fn status_retry_failed_forgets_failed_units() {
    let dir = tempfile::tempdir().unwrap();
    seed_ledger(dir.path());

    let output = vfec(dir.path(), &["status", "--retry-failed", "--format", "json"]);
    assert!(String::from_utf8_lossy(&output.stderr).contains("2 failed unit(s)"));
    let json = stdout_json(&output);
    assert_eq!(json.as_array().unwrap().len(), 1);

    let after = stdout_json(&vfec(dir.path(), &["status", "--format", "json"]));
    let units = after.as_array().unwrap();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0]["stage"], "aggregated");
}

#[test]
fn status_without_ledger_is_empty() {
    let dir = tempfile::tempdir().unwrap();

    let output = vfec(dir.path(), &["status"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("no units recorded"));
    assert!(!dir.path().join(".vfec").exists());
}
