//! Filesystem hot reload for policy override files
//!
//! The parent directory is watched rather than the file itself so that
//! atomic replacements (editor renames, ConfigMap `..data` symlink swaps)
//! are observed. Bursts of events are collapsed into a single reload.

use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::RuleEngine;
use crate::error::{PolicyError, Result};

/// Quiet period after the last filesystem event before reloading
pub const RELOAD_DEBOUNCE: Duration = Duration::from_millis(250);

/// Directory entry Kubernetes swaps when a mounted ConfigMap changes
const CONFIGMAP_DATA_LINK: &str = "..data";

impl RuleEngine {
    /// Watch the policy file and reload it on change until `cancel` fires
    ///
    /// Fails when no policy path is configured or the watch cannot be set up.
    pub fn start_hot_reload(self: &Arc<Self>, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let path = self
            .policy_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| PolicyError::watch("", format!("no policy file configured for {}", self.name())))?;
        let file_name = path
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| PolicyError::watch(&path, "policy path has no file name"))?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => Path::new(".").to_path_buf(),
        };

        let (tx, mut rx) = mpsc::channel::<()>(16);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_relevant(&event, &file_name) => {
                // a full channel already has a reload pending
                let _ = tx.try_send(());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "policy watcher error"),
        })
        .map_err(|e| PolicyError::watch(&path, e.to_string()))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| PolicyError::watch(&path, e.to_string()))?;

        info!(policy = %self.name(), path = %path.display(), "watching policy file");

        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => {
                        if event.is_none() {
                            break;
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(RELOAD_DEBOUNCE) => {}
                        }
                        while rx.try_recv().is_ok() {}
                        engine.reload_now();
                    }
                }
            }
            debug!(policy = %engine.name(), "policy watcher stopped");
        }))
    }

    /// Reload from the policy file now, logging instead of failing
    ///
    /// Returns whether a new policy was activated.
    pub fn reload_now(&self) -> bool {
        match self.load_from_file() {
            Ok(changed) => changed,
            Err(e) => {
                warn!(policy = %self.name(), error = %e, "policy reload failed");
                false
            }
        }
    }
}

fn is_relevant(event: &Event, file_name: &OsString) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event.paths.iter().any(|p| {
        p.file_name()
            .is_some_and(|name| name == file_name.as_os_str() || name == CONFIGMAP_DATA_LINK)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicySchema, PolicySource};
    use notify::event::{AccessKind, CreateKind, ModifyKind};
    use std::path::PathBuf;

    const BUILTIN: &str = "name: builtin\ndefault: { environment: unknown }\n";

    fn policy(env: &str) -> String {
        format!("name: file\ndefault: {{ environment: {env} }}\n")
    }

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    async fn wait_for(engine: &RuleEngine, expected: &str) -> bool {
        let want = crate::Policy::version_for(expected);
        for _ in 0..100 {
            if engine.policy_version() == want {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[test]
    fn test_relevant_events() {
        let name = OsString::from("environment.yaml");
        assert!(is_relevant(
            &event(EventKind::Modify(ModifyKind::Any), "/etc/policies/environment.yaml"),
            &name
        ));
        assert!(is_relevant(
            &event(EventKind::Create(CreateKind::Any), "/etc/policies/..data"),
            &name
        ));
        assert!(!is_relevant(
            &event(EventKind::Modify(ModifyKind::Any), "/etc/policies/priority.yaml"),
            &name
        ));
        assert!(!is_relevant(
            &event(EventKind::Access(AccessKind::Any), "/etc/policies/environment.yaml"),
            &name
        ));
    }

    #[tokio::test]
    async fn story_file_change_is_picked_up_without_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("environment.yaml");
        let first = policy("staging");
        std::fs::write(&path, &first).unwrap();

        let engine = Arc::new(
            RuleEngine::new("environment", PolicySchema::new(), BUILTIN)
                .unwrap()
                .with_policy_path(&path),
        );
        assert!(engine.load_from_file().unwrap());

        let cancel = CancellationToken::new();
        let handle = engine.start_hot_reload(cancel.clone()).unwrap();

        let second = policy("production");
        std::fs::write(&path, &second).unwrap();
        assert!(wait_for(&engine, &second).await, "reload not observed");
        assert_eq!(*engine.active_policy().source(), PolicySource::File(path.clone()));

        // a broken edit leaves the last good policy active
        std::fs::write(&path, "name: [broken").unwrap();
        tokio::time::sleep(RELOAD_DEBOUNCE * 4).await;
        assert_eq!(engine.policy_version(), crate::Policy::version_for(&second));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn story_cancel_during_debounce_stops_without_reloading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("environment.yaml");
        let first = policy("staging");
        std::fs::write(&path, &first).unwrap();

        let engine = Arc::new(
            RuleEngine::new("environment", PolicySchema::new(), BUILTIN)
                .unwrap()
                .with_policy_path(&path),
        );
        assert!(engine.load_from_file().unwrap());

        let cancel = CancellationToken::new();
        let handle = engine.start_hot_reload(cancel.clone()).unwrap();

        std::fs::write(&path, policy("production")).unwrap();
        tokio::time::sleep(RELOAD_DEBOUNCE / 5).await;
        cancel.cancel();

        tokio::time::timeout(RELOAD_DEBOUNCE / 2, handle)
            .await
            .expect("watcher kept running after cancel")
            .unwrap();
        assert_eq!(engine.policy_version(), crate::Policy::version_for(&first));
    }

    #[tokio::test]
    async fn test_hot_reload_requires_policy_path() {
        let engine = Arc::new(RuleEngine::new("environment", PolicySchema::new(), BUILTIN).unwrap());
        let err = engine.start_hot_reload(CancellationToken::new()).unwrap_err();
        assert!(matches!(err, PolicyError::Watch { .. }));
    }

    #[tokio::test]
    async fn test_reload_now_reports_failure_as_false() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("environment.yaml");
        std::fs::write(&path, "rules: 7").unwrap();

        let engine = RuleEngine::new("environment", PolicySchema::new(), BUILTIN)
            .unwrap()
            .with_policy_path(&path);
        assert!(!engine.reload_now());
        assert_eq!(*engine.active_policy().source(), PolicySource::BuiltIn);
    }
}
