//! Drives the real `git` binary against a throwaway origin repository.
//! Skipped when git is not installed.

use std::{path::Path, process::Command, sync::Arc};

use guvnor_deploy::{DeployError, DeploymentEngine, GitCli, VcsRef};

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str], timestamp: u64) {
    let date = format!("{timestamp} +0000");
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "guvnor")
        .env("GIT_AUTHOR_EMAIL", "guvnor@example.invalid")
        .env("GIT_COMMITTER_NAME", "guvnor")
        .env("GIT_COMMITTER_EMAIL", "guvnor@example.invalid")
        .env("GIT_AUTHOR_DATE", &date)
        .env("GIT_COMMITTER_DATE", &date)
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("HOME", dir)
        .status()
        .unwrap();
    assert!(status.success(), "git {args:?} failed");
}

/// Commits file `vN` and tags it `vN`. Tags are created oldest first.
fn release(origin: &Path, n: u64) {
    release_at(origin, n, 1_700_000_000 + n * 60);
}

fn release_at(origin: &Path, n: u64, ts: u64) {
    let tag = format!("v{n}");
    std::fs::write(origin.join(&tag), format!("release {n}\n")).unwrap();
    git(origin, &["add", "."], ts);
    git(origin, &["commit", "--quiet", "-m", &tag], ts);
    git(origin, &["tag", &tag], ts);
}

fn make_origin(root: &Path, releases: u64) -> std::path::PathBuf {
    let origin = root.join("origin");
    std::fs::create_dir_all(&origin).unwrap();
    git(&origin, &["init", "--quiet", "--initial-branch=master"], 1_700_000_000);
    for n in 1..=releases {
        release(&origin, n);
    }
    origin
}

fn files(dir: &Path) -> Vec<String> {
    let mut out: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n != ".git")
        .collect();
    out.sort();
    out
}

#[tokio::test]
async fn deploy_switch_refresh_and_remove_with_git() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let origin = make_origin(root.path(), 3);
    let engine = DeploymentEngine::open(root.path().join("apps"), Arc::new(GitCli::default()))
        .await
        .unwrap();

    let app = engine
        .deploy("hello-world", origin.to_str().unwrap(), None)
        .await
        .unwrap();
    let names: Vec<&str> = app.refs.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["master", "v1", "v2", "v3"]);
    assert_eq!(files(&app.directory), vec!["v1", "v2", "v3"]);

    // Stray files from the previous tree must not survive a switch.
    std::fs::write(app.directory.join("scratch.log"), "x").unwrap();
    engine.switch_ref("hello-world", "tags/v2").await.unwrap();
    assert_eq!(files(&app.directory), vec!["v1", "v2"]);

    engine.switch_ref("hello-world", "v1").await.unwrap();
    assert_eq!(files(&app.directory), vec!["v1"]);
    assert_eq!(
        engine.find_application("hello-world").unwrap().current_ref,
        VcsRef::tag("v1")
    );

    engine.remove("hello-world").await.unwrap();
    assert!(!app.directory.exists());
    let err = engine.remove("hello-world").await.unwrap_err();
    assert!(matches!(err, DeployError::NotFound(_)));
}

#[tokio::test]
async fn update_refs_picks_up_new_tags_with_git() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let origin = make_origin(root.path(), 1);
    let engine = DeploymentEngine::open(root.path().join("apps"), Arc::new(GitCli::default()))
        .await
        .unwrap();
    let app = engine
        .deploy("hello-world", origin.to_str().unwrap(), None)
        .await
        .unwrap();
    assert_eq!(app.refs.len(), 2);

    release(&origin, 2);
    release(&origin, 3);
    let updated = engine.update_refs("hello-world").await.unwrap();

    assert_eq!(updated.refs.len(), 4);
    assert_eq!(updated.current_ref, app.current_ref);
    assert_eq!(files(&app.directory), vec!["v1"]);
}

#[tokio::test]
async fn tags_created_in_the_same_second_keep_creation_order() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let origin = make_origin(root.path(), 0);
    for n in [9, 10, 11] {
        release_at(&origin, n, 1_700_000_000);
    }
    let engine = DeploymentEngine::open(root.path().join("apps"), Arc::new(GitCli::default()))
        .await
        .unwrap();

    let app = engine
        .deploy("hello-world", origin.to_str().unwrap(), None)
        .await
        .unwrap();

    let names: Vec<&str> = app.refs.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["master", "v9", "v10", "v11"]);
}
