use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::error::{DeployError, DeployResult, VcsError};
use crate::store::RegistryStore;
use crate::vcs::{Vcs, VcsRef};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub directory: PathBuf,
    pub current_ref: VcsRef,
    pub refs: Vec<VcsRef>,
    pub deployed_at: DateTime<Utc>,
}

impl Application {
    pub fn find_ref(&self, requested: &str) -> Option<&VcsRef> {
        self.refs.iter().find(|r| r.matches(requested))
    }
}

struct Slot {
    app: Application,
    busy: Arc<tokio::sync::Mutex<()>>,
}

impl Slot {
    fn new(app: Application) -> Self {
        Self {
            app,
            busy: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

#[derive(Default)]
struct Registry {
    apps: BTreeMap<String, Slot>,
    deploying: HashSet<String>,
}

/// Owns every application checkout under `app_dir`.
///
/// Mutations of one application never interleave: a second switch, refresh or
/// removal of a name that is already being worked on fails with
/// [`DeployError::Conflict`]. Different names proceed independently.
pub struct DeploymentEngine {
    app_dir: PathBuf,
    vcs: Arc<dyn Vcs>,
    store: RegistryStore,
    registry: Mutex<Registry>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl DeploymentEngine {
    /// Opens the engine rooted at `app_dir`, reloading applications saved by a
    /// previous run. Records whose directory has disappeared are dropped.
    pub async fn open(app_dir: impl Into<PathBuf>, vcs: Arc<dyn Vcs>) -> DeployResult<Self> {
        let app_dir = app_dir.into();
        tokio::fs::create_dir_all(&app_dir).await?;
        let store = RegistryStore::new(&app_dir);

        let mut registry = Registry::default();
        for app in store.load().await? {
            if !tokio::fs::try_exists(&app.directory).await.unwrap_or(false) {
                tracing::warn!(app = %app.name, dir = %app.directory.display(), "application directory missing; dropping record");
                continue;
            }
            registry.apps.insert(app.name.clone(), Slot::new(app));
        }
        tracing::info!(dir = %app_dir.display(), apps = registry.apps.len(), "deployment engine ready");

        Ok(Self {
            app_dir,
            vcs,
            store,
            registry: Mutex::new(registry),
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn deploy(&self, name: &str, source: &str, user: Option<&str>) -> DeployResult<Application> {
        let name = normalize_name(name)?;
        {
            let mut reg = self.registry();
            if reg.apps.contains_key(&name) || !reg.deploying.insert(name.clone()) {
                return Err(DeployError::DuplicateName(name));
            }
        }

        let outcome = self.materialise(&name, source, user).await;
        {
            let mut reg = self.registry();
            reg.deploying.remove(&name);
            if let Ok(app) = &outcome {
                reg.apps.insert(name.clone(), Slot::new(app.clone()));
            }
        }
        let app = outcome?;
        self.persist().await;

        tracing::info!(app = %app.name, id = %app.id, reference = %app.current_ref, "application deployed");
        Ok(app)
    }

    async fn materialise(&self, name: &str, source: &str, user: Option<&str>) -> DeployResult<Application> {
        let id = uuid::Uuid::new_v4().to_string();
        let directory = self.app_dir.join(&id);

        let result = async {
            self.vcs.clone_repo(source, &directory).await?;
            let refs = self.vcs.list_refs(&directory).await?;
            let current_ref = refs.first().cloned().ok_or(VcsError::EmptyRepository)?;
            Ok::<_, DeployError>((refs, current_ref))
        }
        .await;

        match result {
            Ok((refs, current_ref)) => Ok(Application {
                id,
                name: name.to_string(),
                url: source.to_string(),
                user: user.map(str::to_string),
                directory,
                current_ref,
                refs,
                deployed_at: Utc::now(),
            }),
            Err(e) => {
                tracing::warn!(app = %name, error = %e, "deploy failed; cleaning up");
                remove_dir_if_exists(&directory).await?;
                Err(e)
            }
        }
    }

    pub fn list_applications(&self) -> Vec<Application> {
        self.registry().apps.values().map(|s| s.app.clone()).collect()
    }

    pub fn find_application(&self, name: &str) -> DeployResult<Application> {
        self.registry()
            .apps
            .get(name)
            .map(|s| s.app.clone())
            .ok_or_else(|| DeployError::NotFound(name.to_string()))
    }

    pub fn list_refs(&self, name: &str) -> DeployResult<Vec<VcsRef>> {
        self.find_application(name).map(|app| app.refs)
    }

    /// Puts the exact tree of `requested` in the application directory.
    ///
    /// The recorded ref changes only once the checkout succeeded. When the
    /// checkout fails the previous ref is checked out again before the error is
    /// returned; if that fails too the result is [`DeployError::RestoreFailed`].
    pub async fn switch_ref(&self, name: &str, requested: &str) -> DeployResult<Application> {
        let (app, _busy) = self.begin(name)?;
        let target = app
            .find_ref(requested)
            .cloned()
            .ok_or_else(|| DeployError::RefNotFound {
                app: name.to_string(),
                reference: requested.to_string(),
            })?;

        if let Err(e) = self.vcs.checkout(&app.directory, &target).await {
            tracing::warn!(app = %name, reference = %target, error = %e, "switch failed; restoring previous ref");
            if let Err(restore) = self.vcs.checkout(&app.directory, &app.current_ref).await {
                tracing::error!(app = %name, reference = %app.current_ref, error = %restore, "failed to restore previous ref");
                return Err(DeployError::RestoreFailed {
                    app: name.to_string(),
                    reference: app.current_ref.to_string(),
                    cause: e,
                    restore,
                });
            }
            return Err(e.into());
        }

        let app = self.commit(name, |a| a.current_ref = target.clone())?;
        self.persist().await;
        tracing::info!(app = %name, reference = %app.current_ref, "switched ref");
        Ok(app)
    }

    /// Fetches from origin and appends refs not seen before. Known refs, the
    /// current ref and the working tree are left alone.
    pub async fn update_refs(&self, name: &str) -> DeployResult<Application> {
        let (app, _busy) = self.begin(name)?;
        self.vcs.fetch_refs(&app.directory).await?;
        let discovered = self.vcs.list_refs(&app.directory).await?;

        let mut added = 0usize;
        let app = self.commit(name, |a| {
            for r in discovered {
                if !a.refs.contains(&r) {
                    a.refs.push(r);
                    added += 1;
                }
            }
        })?;
        if added > 0 {
            self.persist().await;
        }
        tracing::info!(app = %name, added, total = app.refs.len(), "refs updated");
        Ok(app)
    }

    pub async fn remove(&self, name: &str) -> DeployResult<()> {
        let (app, _busy) = self.begin(name)?;
        remove_dir_if_exists(&app.directory).await?;
        self.registry().apps.remove(name);
        self.persist().await;
        tracing::info!(app = %name, id = %app.id, "application removed");
        Ok(())
    }

    fn begin(&self, name: &str) -> DeployResult<(Application, OwnedMutexGuard<()>)> {
        let reg = self.registry();
        let slot = reg
            .apps
            .get(name)
            .ok_or_else(|| DeployError::NotFound(name.to_string()))?;
        let guard = slot
            .busy
            .clone()
            .try_lock_owned()
            .map_err(|_| DeployError::Conflict(name.to_string()))?;
        Ok((slot.app.clone(), guard))
    }

    fn commit(&self, name: &str, f: impl FnOnce(&mut Application)) -> DeployResult<Application> {
        let mut reg = self.registry();
        let slot = reg
            .apps
            .get_mut(name)
            .ok_or_else(|| DeployError::NotFound(name.to_string()))?;
        f(&mut slot.app);
        Ok(slot.app.clone())
    }

    /// Saves the registry after a committed change. The in-memory registry is
    /// authoritative, so a failed save is logged and retried by the next one.
    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let apps = self.list_applications();
        if let Err(e) = self.store.save(&apps).await {
            tracing::error!(error = %e, apps = apps.len(), path = %self.store.path().display(), "failed to save application registry");
        }
    }
}

fn normalize_name(raw: &str) -> DeployResult<String> {
    let name = raw.trim();
    if name.is_empty() || name.len() > 128 || name.chars().any(|c| c.is_control() || c == '/') {
        return Err(DeployError::InvalidName(raw.to_string()));
    }
    Ok(name.to_string())
}

async fn remove_dir_if_exists(dir: &Path) -> DeployResult<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::MemoryVcs;

    const ORIGIN: &str = "mem://hello-world";

    /// Origin with `master` plus tags v1..=v`tags`; tag vN adds file `vN`.
    fn origin(vcs: &MemoryVcs, tags: usize) {
        vcs.create_origin(ORIGIN, "master");
        for n in 1..=tags {
            add_release(vcs, n);
        }
    }

    fn add_release(vcs: &MemoryVcs, n: usize) {
        let tag = format!("v{n}");
        vcs.commit(ORIGIN, "master", &tag, &format!("release {n}"));
        vcs.tag(ORIGIN, &tag);
    }

    fn files(dir: &Path) -> Vec<String> {
        let mut out: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        out.sort();
        out
    }

    fn names(refs: &[VcsRef]) -> Vec<&str> {
        refs.iter().map(|r| r.name.as_str()).collect()
    }

    async fn engine(root: &Path, vcs: &Arc<MemoryVcs>) -> DeploymentEngine {
        DeploymentEngine::open(root.join("apps"), vcs.clone()).await.unwrap()
    }

    #[tokio::test]
    async fn deploy_clones_and_lists_default_branch_then_tags() {
        let root = tempfile::tempdir().unwrap();
        let vcs = Arc::new(MemoryVcs::new());
        origin(&vcs, 3);
        let engine = engine(root.path(), &vcs).await;

        let app = engine.deploy("hello-world", ORIGIN, Some("alex")).await.unwrap();

        assert_eq!(names(&app.refs), vec!["master", "v1", "v2", "v3"]);
        assert_eq!(app.current_ref, VcsRef::branch("master"));
        assert_eq!(app.directory, root.path().join("apps").join(&app.id));
        assert_eq!(files(&app.directory), vec!["v1", "v2", "v3"]);
        assert_eq!(app.user.as_deref(), Some("alex"));
        assert_eq!(engine.list_applications(), vec![app]);
    }

    #[tokio::test]
    async fn switch_ref_leaves_exactly_the_requested_tree() {
        let root = tempfile::tempdir().unwrap();
        let vcs = Arc::new(MemoryVcs::new());
        origin(&vcs, 3);
        let engine = engine(root.path(), &vcs).await;
        let app = engine.deploy("hello-world", ORIGIN, None).await.unwrap();

        let switched = engine.switch_ref("hello-world", "tags/v2").await.unwrap();
        assert_eq!(switched.current_ref, VcsRef::tag("v2"));
        assert_eq!(files(&app.directory), vec!["v1", "v2"]);

        engine.switch_ref("hello-world", "v1").await.unwrap();
        assert_eq!(files(&app.directory), vec!["v1"]);

        engine.switch_ref("hello-world", "origin/master").await.unwrap();
        assert_eq!(files(&app.directory), vec!["v1", "v2", "v3"]);
    }

    #[tokio::test]
    async fn unknown_ref_is_rejected_without_touching_the_tree() {
        let root = tempfile::tempdir().unwrap();
        let vcs = Arc::new(MemoryVcs::new());
        origin(&vcs, 2);
        let engine = engine(root.path(), &vcs).await;
        let app = engine.deploy("hello-world", ORIGIN, None).await.unwrap();
        let started = vcs.checkouts_started();

        let err = engine.switch_ref("hello-world", "v9").await.unwrap_err();

        assert!(matches!(err, DeployError::RefNotFound { .. }));
        assert_eq!(vcs.checkouts_started(), started);
        assert_eq!(files(&app.directory), vec!["v1", "v2"]);
    }

    #[tokio::test]
    async fn failed_switch_restores_previous_ref() {
        let root = tempfile::tempdir().unwrap();
        let vcs = Arc::new(MemoryVcs::new());
        origin(&vcs, 3);
        vcs.fail_checkouts_of("v2");
        let engine = engine(root.path(), &vcs).await;
        let app = engine.deploy("hello-world", ORIGIN, None).await.unwrap();
        engine.switch_ref("hello-world", "v1").await.unwrap();

        let err = engine.switch_ref("hello-world", "v2").await.unwrap_err();

        assert!(matches!(err, DeployError::Vcs(_)));
        let after = engine.find_application("hello-world").unwrap();
        assert_eq!(after.current_ref, VcsRef::tag("v1"));
        assert_eq!(files(&app.directory), vec!["v1"]);
    }

    #[tokio::test]
    async fn failed_restore_is_reported_separately() {
        let root = tempfile::tempdir().unwrap();
        let vcs = Arc::new(MemoryVcs::new());
        origin(&vcs, 3);
        vcs.fail_checkouts_of("v2");
        vcs.fail_checkouts_of("master");
        let engine = engine(root.path(), &vcs).await;
        engine.deploy("hello-world", ORIGIN, None).await.unwrap();

        let err = engine.switch_ref("hello-world", "v2").await.unwrap_err();

        match err {
            DeployError::RestoreFailed { app, reference, .. } => {
                assert_eq!(app, "hello-world");
                assert_eq!(reference, VcsRef::branch("master").to_string());
            }
            other => panic!("expected RestoreFailed, got {other:?}"),
        }
        let after = engine.find_application("hello-world").unwrap();
        assert_eq!(after.current_ref, VcsRef::branch("master"));
    }

    #[tokio::test]
    async fn save_failure_keeps_committed_changes() {
        let root = tempfile::tempdir().unwrap();
        let vcs = Arc::new(MemoryVcs::new());
        origin(&vcs, 2);
        let engine = engine(root.path(), &vcs).await;
        // A directory where the temporary registry file goes makes every save fail.
        let blocker = root.path().join("apps").join("applications.json.tmp");
        std::fs::create_dir_all(&blocker).unwrap();

        let app = engine.deploy("hello-world", ORIGIN, None).await.unwrap();
        assert_eq!(engine.list_applications(), vec![app.clone()]);
        let err = engine.deploy("hello-world", ORIGIN, None).await.unwrap_err();
        assert!(matches!(err, DeployError::DuplicateName(_)));

        std::fs::remove_dir(&blocker).unwrap();
        let switched = engine.switch_ref("hello-world", "v1").await.unwrap();

        let reopened = DeploymentEngine::open(root.path().join("apps"), vcs.clone()).await.unwrap();
        assert_eq!(reopened.find_application("hello-world").unwrap(), switched);
    }

    #[tokio::test]
    async fn update_refs_appends_without_moving_current_ref() {
        let root = tempfile::tempdir().unwrap();
        let vcs = Arc::new(MemoryVcs::new());
        origin(&vcs, 1);
        let engine = engine(root.path(), &vcs).await;
        let app = engine.deploy("hello-world", ORIGIN, None).await.unwrap();
        assert_eq!(app.refs.len(), 2);

        add_release(&vcs, 2);
        add_release(&vcs, 3);
        assert_eq!(engine.list_refs("hello-world").unwrap().len(), 2);

        let updated = engine.update_refs("hello-world").await.unwrap();

        assert_eq!(names(&updated.refs), vec!["master", "v1", "v2", "v3"]);
        assert_eq!(updated.current_ref, app.current_ref);
        assert_eq!(files(&app.directory), vec!["v1"]);

        // A second refresh finds nothing new.
        let again = engine.update_refs("hello-world").await.unwrap();
        assert_eq!(again.refs.len(), 4);
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        let vcs = Arc::new(MemoryVcs::new());
        origin(&vcs, 1);
        let engine = engine(root.path(), &vcs).await;
        engine.deploy("hello-world", ORIGIN, None).await.unwrap();

        let err = engine.deploy("hello-world", ORIGIN, None).await.unwrap_err();
        assert!(matches!(err, DeployError::DuplicateName(n) if n == "hello-world"));
        assert_eq!(engine.list_applications().len(), 1);
    }

    #[tokio::test]
    async fn failed_deploy_releases_the_name_and_directory() {
        let root = tempfile::tempdir().unwrap();
        let vcs = Arc::new(MemoryVcs::new());
        let engine = engine(root.path(), &vcs).await;

        let err = engine.deploy("hello-world", ORIGIN, None).await.unwrap_err();
        assert!(matches!(err, DeployError::Vcs(_)));
        assert!(engine.list_applications().is_empty());
        assert_eq!(files(&root.path().join("apps")), Vec::<String>::new());

        origin(&vcs, 1);
        engine.deploy("hello-world", ORIGIN, None).await.unwrap();
    }

    #[tokio::test]
    async fn remove_deletes_directory_and_repeat_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let vcs = Arc::new(MemoryVcs::new());
        origin(&vcs, 1);
        let engine = engine(root.path(), &vcs).await;
        let app = engine.deploy("hello-world", ORIGIN, None).await.unwrap();

        engine.remove("hello-world").await.unwrap();

        assert!(engine.list_applications().is_empty());
        assert!(!app.directory.exists());
        let err = engine.remove("hello-world").await.unwrap_err();
        assert!(matches!(err, DeployError::NotFound(_)));
    }

    #[tokio::test]
    async fn concurrent_mutations_of_one_app_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        let vcs = Arc::new(MemoryVcs::new());
        origin(&vcs, 3);
        let engine = Arc::new(engine(root.path(), &vcs).await);
        let app = engine.deploy("hello-world", ORIGIN, None).await.unwrap();
        engine.deploy("other", ORIGIN, None).await.unwrap();

        let gate = vcs.pause_checkouts().await;
        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.switch_ref("hello-world", "v2").await }
        });
        while vcs.checkouts_started() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = engine.switch_ref("hello-world", "v1").await.unwrap_err();
        assert!(matches!(err, DeployError::Conflict(_)));
        let err = engine.update_refs("hello-world").await.unwrap_err();
        assert!(matches!(err, DeployError::Conflict(_)));
        let err = engine.remove("hello-world").await.unwrap_err();
        assert!(matches!(err, DeployError::Conflict(_)));
        // Other applications are not blocked by the busy one.
        engine.update_refs("other").await.unwrap();

        drop(gate);
        first.await.unwrap().unwrap();
        assert_eq!(files(&app.directory), vec!["v1", "v2"]);
    }

    #[tokio::test]
    async fn registry_is_reloaded_on_open() {
        let root = tempfile::tempdir().unwrap();
        let vcs = Arc::new(MemoryVcs::new());
        origin(&vcs, 2);
        let app = {
            let engine = engine(root.path(), &vcs).await;
            engine.deploy("hello-world", ORIGIN, None).await.unwrap();
            engine.switch_ref("hello-world", "v1").await.unwrap()
        };

        let reopened = engine(root.path(), &vcs).await;

        assert_eq!(reopened.find_application("hello-world").unwrap(), app);
    }

    #[test]
    fn names_are_trimmed_and_validated() {
        assert_eq!(normalize_name("  web ").unwrap(), "web");
        assert!(normalize_name("").is_err());
        assert!(normalize_name("a/b").is_err());
    }
}
