//! Integration tests for Reconciler against real processes

use async_trait::async_trait;
use common::ErrorKind;
use reconciler::{
    DeploymentMode, LocalControl, ProxyCommands, ProxyControl, ReconcileState, Reconciler,
    ReconcilerPaths, SyntaxCheck,
};
use rulestore::{NewRule, RuleStore, RuleUpdate};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

const TEMPLATE: &str = "# generated {{generated_at}}\n\
{{#rules}}\n\
# {{description}}\n\
location {{path}} {\n    proxy_pass http://{{target_host}}:{{target_port}};\n}\n\
{{/rules}}\n";

/// Syntax check that rejects any config mentioning BROKEN
fn sh_commands(reload_script: &str) -> ProxyCommands {
    ProxyCommands {
        binary: "sh".to_string(),
        test_args: vec![
            "-c".to_string(),
            "if grep -q BROKEN \"$0\"; then echo 'emerg: BROKEN directive' >&2; exit 1; fi".to_string(),
            "{config}".to_string(),
        ],
        reload_args: vec!["-c".to_string(), reload_script.to_string()],
        version_args: vec!["-c".to_string(), "echo test/1.0".to_string()],
        timeout: Duration::from_millis(500),
    }
}

struct Fixture {
    _dir: TempDir,
    store: Arc<RuleStore>,
    reconciler: Arc<Reconciler>,
}

fn fixture(reload_script: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let template_path = dir.path().join("proxy_rules.conf.template");
    fs::write(&template_path, TEMPLATE).unwrap();

    let store = Arc::new(
        RuleStore::open(
            dir.path().join("proxy_config.yaml"),
            dir.path().join("backups"),
            10,
        )
        .unwrap(),
    );
    let control = Arc::new(LocalControl::new(sh_commands(reload_script)));
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        control,
        ReconcilerPaths {
            template_path,
            config_path: dir.path().join("conf.d/proxy_rules.conf"),
            rollback_path: None,
        },
    ));

    Fixture {
        _dir: dir,
        store,
        reconciler,
    }
}

#[tokio::test]
async fn test_commit_renders_enabled_rules_only() {
    let fx = fixture("exit 0");
    fx.store
        .add(NewRule::new("/api", 8080).with_host("10.0.0.1"))
        .unwrap();
    fx.store.add(NewRule::new("/off", 9090).disabled()).unwrap();

    let result = fx.reconciler.reconcile().await;
    assert!(result.success, "{:?}", result);
    assert_eq!(result.state, ReconcileState::Committed);

    let live = fs::read_to_string(fx.reconciler.config_path()).unwrap();
    assert!(live.contains("location /api {"));
    assert!(live.contains("proxy_pass http://10.0.0.1:8080;"));
    assert!(!live.contains("/off"));
}

#[tokio::test]
async fn test_syntax_failure_keeps_live_config() {
    let fx = fixture("exit 0");
    let rule = fx.store.add(NewRule::new("/api", 8080)).unwrap();
    assert!(fx.reconciler.reconcile().await.success);
    let before = fs::read_to_string(fx.reconciler.config_path()).unwrap();

    fx.store
        .update(
            &rule.id,
            RuleUpdate {
                description: Some("BROKEN".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

    let result = fx.reconciler.reconcile().await;
    assert!(!result.success);
    assert_eq!(result.state, ReconcileState::RolledBack);
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::SyntaxError);
    assert!(error.detail.contains("BROKEN directive"));

    assert_eq!(
        fs::read_to_string(fx.reconciler.config_path()).unwrap(),
        before
    );
}

#[tokio::test]
async fn test_reload_failure_restores_previous() {
    let fx = fixture("echo 'signal process started failed' >&2; exit 1");
    fs::create_dir_all(fx.reconciler.config_path().parent().unwrap()).unwrap();
    fs::write(fx.reconciler.config_path(), "# hand-written\n").unwrap();
    fx.store.add(NewRule::new("/api", 8080)).unwrap();

    let result = fx.reconciler.reconcile().await;
    assert!(!result.success);
    assert!(result.rolled_back);
    assert!(result.message.contains("rolled back"));
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::CommandFailure);
    assert!(error.detail.contains("signal process started failed"));

    assert_eq!(
        fs::read_to_string(fx.reconciler.config_path()).unwrap(),
        "# hand-written\n"
    );
}

#[tokio::test]
async fn test_reload_timeout_restores_previous() {
    let fx = fixture("sleep 5");
    fs::create_dir_all(fx.reconciler.config_path().parent().unwrap()).unwrap();
    fs::write(fx.reconciler.config_path(), "# before\n").unwrap();

    let result = fx.reconciler.reconcile().await;
    assert_eq!(result.state, ReconcileState::RolledBack);
    assert_eq!(result.error.unwrap().kind, ErrorKind::Timeout);
    assert!(result.duration_ms < 3000);
    assert_eq!(
        fs::read_to_string(fx.reconciler.config_path()).unwrap(),
        "# before\n"
    );
}

#[tokio::test]
async fn test_repeated_reconcile_is_stable() {
    let fx = fixture("exit 0");
    fx.store.add(NewRule::new("/a", 8001)).unwrap();
    fx.store.add(NewRule::new("/b", 8002)).unwrap();

    let strip = |text: String| {
        text.lines()
            .filter(|l| !l.starts_with("# generated"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    assert!(fx.reconciler.reconcile().await.success);
    let first = strip(fs::read_to_string(fx.reconciler.config_path()).unwrap());
    assert!(fx.reconciler.reconcile().await.success);
    let second = strip(fs::read_to_string(fx.reconciler.config_path()).unwrap());
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_concurrent_reconciles_all_succeed() {
    let fx = fixture("sleep 0.05");
    fx.store.add(NewRule::new("/api", 8080)).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let reconciler = fx.reconciler.clone();
            tokio::spawn(async move { reconciler.reconcile().await })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap().success);
    }

    let status = fx.reconciler.status().await;
    assert!(status.config_exists);
    assert_eq!(status.version.as_deref(), Some("test/1.0"));
    assert!(status.last_reconcile.unwrap().success);
}

/// Counts how many reconciles are between their syntax check and reload
#[derive(Default)]
struct OverlapTracker {
    active: AtomicUsize,
    peak: AtomicUsize,
    reloads: AtomicUsize,
}

#[async_trait]
impl ProxyControl for OverlapTracker {
    async fn test_config(&self, config_path: &Path) -> common::Result<SyntaxCheck> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        assert!(config_path.exists());
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok(SyntaxCheck::Passed(String::new()))
    }

    async fn reload(&self) -> common::Result<String> {
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.reloads.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(String::new())
    }

    async fn version(&self) -> common::Result<String> {
        Ok("tracker".to_string())
    }

    fn mode(&self) -> DeploymentMode {
        DeploymentMode::Local
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_calls_never_interleave() {
    let dir = tempfile::tempdir().unwrap();
    let template_path = dir.path().join("proxy_rules.conf.template");
    fs::write(&template_path, TEMPLATE).unwrap();
    let store = Arc::new(
        RuleStore::open(dir.path().join("proxy_config.yaml"), dir.path().join("backups"), 10).unwrap(),
    );
    store.add(NewRule::new("/api", 8080)).unwrap();

    let tracker = Arc::new(OverlapTracker::default());
    let reconciler = Arc::new(Reconciler::new(
        store,
        tracker.clone(),
        ReconcilerPaths {
            template_path,
            config_path: dir.path().join("conf.d/proxy_rules.conf"),
            rollback_path: None,
        },
    ));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.reconcile().await })
        })
        .collect();
    for handle in handles {
        assert!(handle.await.unwrap().success);
    }

    assert_eq!(tracker.reloads.load(Ordering::SeqCst), 4);
    assert_eq!(tracker.peak.load(Ordering::SeqCst), 1);
}
