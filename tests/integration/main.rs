//! Integration tests for Strata

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    const BUILDFILE: &str = r#"
[[stage]]
name = "builder"

[[stage.step]]
kind = "base-image"
image = "node:18-alpine"

[[stage.step]]
kind = "copy-files"
files = ["package.json"]

[[stage.step]]
kind = "run-command"
command = "npm ci"

[[stage]]
name = "app"

[[stage.step]]
kind = "base-image"
image = "node:18-alpine"

[[stage.step]]
kind = "copy-files"
from = "builder"
files = ["/app/node_modules"]
cost = 1024
"#;

    /// A build context plus an isolated config and cache
    struct Workspace {
        dir: TempDir,
    }

    impl Workspace {
        fn new(buildfile: &str) -> Self {
            let dir = TempDir::new().unwrap();
            let cache = dir.path().join("state").join("cache.json");
            fs::write(
                dir.path().join("config.toml"),
                format!(
                    "[general]\nhistory_log = false\n\n[cache]\npath = {:?}\n",
                    cache.display().to_string()
                ),
            )
            .unwrap();
            fs::write(dir.path().join("strata.toml"), buildfile).unwrap();
            fs::write(dir.path().join("package.json"), r#"{"name":"demo"}"#).unwrap();
            Self { dir }
        }

        fn path(&self) -> &Path {
            self.dir.path()
        }

        fn cache_file(&self) -> PathBuf {
            self.path().join("state").join("cache.json")
        }

        fn strata(&self) -> Command {
            let mut cmd = cargo_bin_cmd!("strata");
            cmd.env_remove("RUST_LOG")
                .env("STRATA_CONFIG", self.path().join("config.toml"));
            cmd
        }

        fn build(&self, extra: &[&str]) -> Command {
            let mut cmd = self.strata();
            cmd.arg("build").arg("--context").arg(self.path()).args(extra);
            cmd
        }

        fn build_json(&self, extra: &[&str]) -> serde_json::Value {
            let mut args = vec!["--format", "json"];
            args.extend_from_slice(extra);
            let output = self.build(&args).output().unwrap();
            serde_json::from_slice(&output.stdout).unwrap()
        }
    }

    fn statuses(report: &serde_json::Value, stage: &str) -> Vec<String> {
        report["stages"]
            .as_array()
            .unwrap()
            .iter()
            .find(|s| s["name"] == stage)
            .unwrap()["steps"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["status"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn help_displays() {
        cargo_bin_cmd!("strata")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("layer cache"));
    }

    #[test]
    fn version_displays() {
        cargo_bin_cmd!("strata")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("strata"));
    }

    #[test]
    fn config_path_honors_env() {
        let ws = Workspace::new(BUILDFILE);
        ws.strata()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let ws = Workspace::new(BUILDFILE);
        ws.strata()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]"))
            .stdout(predicate::str::contains("[cache.eviction]"));
    }

    #[test]
    fn config_set_then_show() {
        let ws = Workspace::new(BUILDFILE);
        ws.strata()
            .args(["config", "set", "build.fail_fast", "true"])
            .assert()
            .success();
        ws.strata()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("fail_fast = true"));
    }

    #[test]
    fn invalid_config_is_reported() {
        let ws = Workspace::new(BUILDFILE);
        fs::write(ws.path().join("config.toml"), "[build\n").unwrap();
        ws.strata()
            .args(["cache", "path"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
    }

    #[test]
    fn cache_path_uses_config() {
        let ws = Workspace::new(BUILDFILE);
        ws.strata()
            .args(["cache", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("cache.json"));
    }

    #[test]
    fn first_build_misses_then_hits() {
        let ws = Workspace::new(BUILDFILE);

        let first = ws.build_json(&[]);
        assert_eq!(statuses(&first, "builder"), ["miss", "miss", "miss"]);
        assert_eq!(statuses(&first, "app"), ["hit", "miss"]);
        assert!(first["image"]["fingerprint"].is_string());
        assert!(ws.cache_file().exists());

        let second = ws.build_json(&[]);
        assert_eq!(statuses(&second, "builder"), ["hit", "hit", "hit"]);
        assert_eq!(statuses(&second, "app"), ["hit", "hit"]);
        assert_eq!(first["image"]["fingerprint"], second["image"]["fingerprint"]);
    }

    #[test]
    fn changed_file_rebuilds_suffix() {
        let ws = Workspace::new(BUILDFILE);
        ws.build_json(&[]);

        fs::write(ws.path().join("package.json"), r#"{"name":"changed"}"#).unwrap();
        let report = ws.build_json(&[]);

        assert_eq!(statuses(&report, "builder"), ["hit", "miss", "miss"]);
        assert_eq!(statuses(&report, "app"), ["hit", "miss"]);
    }

    #[test]
    fn plain_format_prints_fingerprint() {
        let ws = Workspace::new(BUILDFILE);
        ws.build(&["--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::is_match(r"^[0-9a-f]{64}\n$").unwrap());
    }

    #[test]
    fn table_format_shows_steps() {
        let ws = Workspace::new(BUILDFILE);
        ws.build(&[])
            .assert()
            .success()
            .stdout(predicate::str::contains("MISS"))
            .stdout(predicate::str::contains("run-command"))
            .stdout(predicate::str::contains("Summary"));
    }

    #[test]
    fn dry_run_writes_no_cache() {
        let ws = Workspace::new(BUILDFILE);
        let report = ws.build_json(&["--dry-run"]);

        assert_eq!(report["dry_run"], true);
        assert!(!ws.cache_file().exists());
    }

    #[test]
    fn sequential_matches_parallel() {
        let ws = Workspace::new(BUILDFILE);
        let parallel = ws.build_json(&["--dry-run"]);
        let sequential = ws.build_json(&["--dry-run", "--sequential"]);

        assert_eq!(parallel["image"], sequential["image"]);
    }

    #[test]
    fn target_override() {
        let ws = Workspace::new(BUILDFILE);
        let report = ws.build_json(&["--target", "builder"]);

        assert_eq!(report["target"], "builder");
        assert_eq!(report["image"]["layers"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn missing_buildfile_fails() {
        let ws = Workspace::new(BUILDFILE);
        fs::remove_file(ws.path().join("strata.toml")).unwrap();

        ws.build(&[])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Build file not found"));
    }

    #[test]
    fn missing_input_file_fails_build() {
        let ws = Workspace::new(BUILDFILE);
        fs::remove_file(ws.path().join("package.json")).unwrap();

        ws.build(&["--format", "json"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("\"category\": \"dependency\""))
            .stderr(predicate::str::contains("Build failed"));
    }

    #[test]
    fn forward_reference_fails_build() {
        let ws = Workspace::new(
            r#"
target = "app"

[[stage]]
name = "app"

[[stage.step]]
kind = "base-image"
image = "alpine"

[[stage.step]]
kind = "copy-files"
from = "late"
files = ["/out"]

[[stage]]
name = "late"

[[stage.step]]
kind = "base-image"
image = "alpine"
"#,
        );

        ws.build(&[])
            .assert()
            .failure()
            .stderr(predicate::str::contains("forward reference"));
    }

    #[test]
    fn directory_copy_tracks_nested_files() {
        let ws = Workspace::new(
            r#"
[[stage]]
name = "app"

[[stage.step]]
kind = "base-image"
image = "node:18-alpine"

[[stage.step]]
kind = "copy-files"
files = ["src"]

[[stage.step]]
kind = "run-command"
command = "npm run build"
"#,
        );
        fs::create_dir_all(ws.path().join("src").join("lib")).unwrap();
        fs::write(ws.path().join("src").join("index.js"), "main()").unwrap();
        fs::write(ws.path().join("src").join("lib").join("util.js"), "util()").unwrap();

        let first = ws.build_json(&[]);
        assert_eq!(statuses(&first, "app"), ["miss", "miss", "miss"]);

        let second = ws.build_json(&[]);
        assert_eq!(statuses(&second, "app"), ["hit", "hit", "hit"]);

        fs::write(ws.path().join("src").join("lib").join("util.js"), "util(2)").unwrap();
        let third = ws.build_json(&[]);
        assert_eq!(statuses(&third, "app"), ["hit", "miss", "miss"]);
    }

    #[test]
    fn cache_list_and_verify_after_build() {
        let ws = Workspace::new(BUILDFILE);
        ws.build(&[]).assert().success();

        let output = ws
            .strata()
            .args(["cache", "list", "--format", "plain"])
            .output()
            .unwrap();
        let listed = String::from_utf8(output.stdout).unwrap();
        assert_eq!(listed.lines().count(), 4);

        ws.strata()
            .args(["cache", "verify"])
            .assert()
            .success()
            .stdout(predicate::str::contains("4 layer(s) verified"));
    }

    #[test]
    fn cache_inspect_shows_chain() {
        let ws = Workspace::new(BUILDFILE);
        let report = ws.build_json(&[]);
        let fingerprint = report["image"]["fingerprint"].as_str().unwrap();

        ws.strata()
            .args(["cache", "inspect", &fingerprint[..12]])
            .assert()
            .success()
            .stdout(predicate::str::contains(fingerprint))
            .stdout(predicate::str::contains("Chain (2 layer(s)"));
    }

    #[test]
    fn cache_prune_and_clear() {
        let ws = Workspace::new(BUILDFILE);
        ws.build(&[]).assert().success();

        ws.strata()
            .args(["cache", "prune", "--max-entries", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Removed 3 layer(s)"));

        ws.strata()
            .args(["cache", "clear", "--yes"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Cleared 1 layer(s)"));

        ws.strata()
            .args(["cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cached layers"));
    }

    #[test]
    fn completions_generate() {
        cargo_bin_cmd!("strata")
            .args(["completions", "bash"])
            .assert()
            .success()
            .stdout(predicate::str::contains("strata"));
    }
}
