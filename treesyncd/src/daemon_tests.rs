use super::*;
use crate::sync::folders;
use tempfile::tempdir;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[test]
fn expands_tilde_to_home_source_dir() {
    let home = PathBuf::from("/tmp/home-user");
    assert_eq!(
        expand_with_home("~/projects/docs", &home),
        PathBuf::from("/tmp/home-user/projects/docs")
    );
    assert_eq!(expand_with_home("~", &home), home);
    assert_eq!(
        expand_with_home("/var/lib/docs", &home),
        PathBuf::from("/var/lib/docs")
    );
}

#[test]
fn reads_intervals_from_env_or_default() {
    assert_eq!(read_u64_env("NO_SUCH_ENV_FOR_TEST", 42), 42);
    assert_eq!(read_count_env("NO_SUCH_ENV_FOR_TEST", 0), 0);
}

#[test]
fn jitter_is_enabled_by_default() {
    assert!(read_bool_env("NO_SUCH_BOOL_ENV_FOR_TEST", true));
    assert!(!read_bool_env("NO_SUCH_BOOL_ENV_FOR_TEST", false));
}

#[test]
fn outcome_labels_name_the_abort_reason() {
    assert_eq!(outcome_label(&RunOutcome::Success), "success");
    assert_eq!(outcome_label(&RunOutcome::PartialSuccess), "partial");
    assert_eq!(
        outcome_label(&RunOutcome::Aborted("cancelled".into())),
        "aborted: cancelled"
    );
}

const JOB: &str = "docs-job";

fn test_config(server: &MockServer, source_root: &Path, state_db: PathBuf) -> DaemonConfig {
    DaemonConfig {
        store_url: server.uri(),
        token: "token".into(),
        source_root: source_root.to_path_buf(),
        job: JOB.into(),
        root_title: "Docs".into(),
        poll_interval: Duration::from_secs(60),
        max_errors: DEFAULT_MAX_ERRORS,
        strict_errors: false,
        quota_limit: 0,
        retry_attempts: 1,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
        backoff_jitter: false,
        change_timeout: Duration::from_secs(5),
        page_size: 500,
        state_db,
    }
}

async fn mount_store(server: &MockServer, put_status: u16, puts: u64) {
    Mock::given(method("PUT"))
        .and(path(format!(
            "/v1/folders/{}",
            folders::root_folder_id(JOB)
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "root", "title": "Docs", "parent": null, "owner": JOB
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/resources"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [], "limit": 500, "offset": 0, "total": 0
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/stats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "quota_exceeded": false, "items": []
        })))
        .mount(server)
        .await;
    let response = if put_status == 200 {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "path": "report.json", "group": "default", "kind": "report", "name": "n", "hash": "h"
        }))
    } else {
        ResponseTemplate::new(put_status).set_body_string("boom")
    };
    Mock::given(method("PUT"))
        .and(path_regex("^/v1/resources/default/report/.+$"))
        .respond_with(response)
        .expect(puts)
        .mount(server)
        .await;
}

#[tokio::test]
async fn run_once_syncs_then_skips_until_forced() {
    let server = MockServer::start().await;
    mount_store(&server, 200, 2).await;
    let source_dir = tempdir().unwrap();
    std::fs::write(source_dir.path().join("report.json"), br#"{"kind":"report"}"#).unwrap();
    let state_dir = tempdir().unwrap();

    let config = test_config(&server, source_dir.path(), state_dir.path().join("state.db"));
    let daemon = DaemonRuntime::bootstrap(config).await.unwrap();

    daemon.run_once(false).await.unwrap();
    let rev = daemon
        .state
        .last_rev(JOB)
        .await
        .unwrap()
        .expect("revision stored after a successful run");
    let runs = daemon.state.recent_runs(JOB, 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].outcome, "success");

    // Unchanged source: nothing runs, nothing is logged.
    daemon.run_once(false).await.unwrap();
    assert_eq!(daemon.state.recent_runs(JOB, 10).await.unwrap().len(), 1);
    assert_eq!(
        daemon.state.last_rev(JOB).await.unwrap().as_deref(),
        Some(rev.as_str())
    );

    // A forced full run goes through regardless.
    daemon.run_once(true).await.unwrap();
    assert_eq!(daemon.state.recent_runs(JOB, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn partial_runs_keep_their_outcome_in_the_log() {
    let server = MockServer::start().await;
    mount_store(&server, 500, 1).await;
    let source_dir = tempdir().unwrap();
    std::fs::write(source_dir.path().join("report.json"), br#"{"kind":"report"}"#).unwrap();
    let state_dir = tempdir().unwrap();

    let config = test_config(&server, source_dir.path(), state_dir.path().join("state.db"));
    let daemon = DaemonRuntime::bootstrap(config).await.unwrap();

    daemon.run_once(false).await.unwrap();
    let runs = daemon.state.recent_runs(JOB, 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].outcome, "partial");
    assert_eq!(runs[0].summary.error_count, 1);
    // Partial runs still advance the revision; the failures are logged.
    assert!(daemon.state.last_rev(JOB).await.unwrap().is_some());
}
