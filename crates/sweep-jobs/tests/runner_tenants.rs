//! Tenant-scoped jobs with GitHub enrichment against a mock API.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use sweep_github::{GithubClient, RetryPolicy, StaticSecretStore};
use sweep_jobs::{
    Enricher, JobError, JobReport, JobRunner, JobSpec, MemoryCheckpointStore, Phase, SkipReason,
    index,
};
use sweep_store::{
    Cursor, MemoryStore, Page, ReadRequest, Record, RecordKey, RetryConfig, Store, StoreError,
    WriteOp,
};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PRIVATE_KEY: &str = include_str!("fixtures/test_app_key.pem");
const CHECK: &str = "Jit Security";

fn tenant(id: &str, owner: &str, app_id: &str, installation_id: &str) -> Record {
    Record::from_value(json!({
        "PK": format!("TENANT#{}", id),
        "SK": format!("VENDOR#github#INSTALLATION#{}", installation_id),
        "GSI5PK": "TYPE#Installation#ACTIVE#True",
        "tenant_id": id,
        "owner": owner,
        "app_id": app_id,
        "installation_id": installation_id,
        "vendor": "github",
        "is_active": true
    }))
    .unwrap()
}

fn asset(tenant_id: &str, owner: &str, name: &str) -> Record {
    let mut record = Record::from_value(json!({
        "PK": format!("TENANT#{}", tenant_id),
        "SK": format!("ASSET#{}-{}", owner, name),
        "tenant_id": tenant_id,
        "asset_id": format!("{}-{}", owner, name),
        "asset_type": "repo",
        "vendor": "github",
        "owner": owner,
        "asset_name": name,
        "is_active": true,
        "is_covered": true
    }))
    .unwrap();
    index::reindex(&mut record).unwrap();
    record
}

fn repo(id: u64, owner: &str, name: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "owner": {"login": owner},
        "private": true,
        "archived": false,
        "default_branch": "main"
    })
}

async fn seeded() -> MemoryStore {
    let store = MemoryStore::new().with_index("Tenants", "GSI5", "GSI5PK", None);
    store
        .insert_all(
            "Tenants",
            [
                tenant("t1", "acme", "11", "101"),
                tenant("t2", "globex", "22", "202"),
            ],
        )
        .await
        .unwrap();
    store
        .insert_all(
            "Assets",
            [
                asset("t1", "acme", "widgets"),
                asset("t2", "globex", "api"),
                asset("t2", "globex", "web"),
                asset("t2", "globex", "legacy"),
            ],
        )
        .await
        .unwrap();
    store
}

fn secrets() -> StaticSecretStore {
    StaticSecretStore::new()
        .with_secret("github-app-certification-11", PRIVATE_KEY)
        .with_secret("github-app-certification-22", PRIVATE_KEY)
}

fn enricher(server: &MockServer, secrets: StaticSecretStore) -> Enricher {
    let github = GithubClient::new(&server.uri())
        .unwrap()
        .with_retry(RetryPolicy {
            max_retries: 2,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        });
    Enricher::new(
        github,
        Arc::new(secrets),
        sweep_github::DEFAULT_SECRET_TEMPLATE,
        100,
    )
}

async fn mount_globex(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/app/installations/202/access_tokens"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"token": "ghs_t2"})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/installation/repositories"))
        .and(header("authorization", "Bearer ghs_t2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total_count": 2,
            "repositories": [repo(501, "globex", "api"), repo(502, "globex", "web")]
        })))
        .mount(server)
        .await;
}

fn job(transform: &str, missing_match: &str, include: Option<Vec<&str>>) -> JobSpec {
    let mut scope = json!({"type": "tenants"});
    if let Some(ids) = include {
        scope["include"] = json!(ids);
    }
    JobSpec::from_json(
        &json!({
            "name": format!("tenants-{}", transform),
            "scope": scope,
            "action": {"type": "transform", "transform": {"kind": transform}},
            "missing_match": missing_match
        })
        .to_string(),
    )
    .unwrap()
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

async fn run<S: Store>(store: S, job: JobSpec, enricher: Enricher) -> JobReport {
    JobRunner::new(store, job)
        .unwrap()
        .enricher(enricher)
        .retry(RetryConfig::immediate(1))
        .now(now())
        .run(None)
        .await
        .unwrap()
}

async fn get(store: &MemoryStore, tenant_id: &str, owner: &str, name: &str) -> Record {
    store
        .get(
            "Assets",
            &RecordKey::new(
                format!("TENANT#{}", tenant_id),
                format!("ASSET#{}-{}", owner, name),
            ),
        )
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_auth_failure_skips_tenant_and_next_tenant_proceeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/app/installations/101/access_tokens"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "message": "Bad credentials"
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_globex(&server).await;
    Mock::given(method("GET"))
        .and(path(
            "/repos/globex/api/branches/main/protection/required_status_checks/contexts",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([CHECK, "ci"])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(
            "/repos/globex/web/branches/main/protection/required_status_checks/contexts",
        ))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "message": "Branch not protected"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = seeded().await;
    let untouched = get(&store, "t1", "acme", "widgets").await;
    let report = run(
        &store,
        job("branch_protection", "leave_unchanged", None),
        enricher(&server, secrets()),
    )
    .await;

    assert_eq!(report.phase, Phase::Completed);
    assert_eq!(report.tenants_processed, 1);
    assert_eq!(report.skipped_tenants.len(), 1);
    assert_eq!(report.skipped_tenants[0].tenant_id, "t1");
    assert!(report.skipped_tenants[0].reason.contains("401"));
    assert_eq!(get(&store, "t1", "acme", "widgets").await, untouched);

    let api = get(&store, "t2", "globex", "api").await;
    assert_eq!(api.get_bool("is_branch_protected_by_jit"), Some(true));
    assert_eq!(api.get("external_repository_id"), Some(&json!(501)));
    assert_eq!(api.get_str("default_branch"), Some("main"));
    assert_eq!(api.get_bool("is_private"), Some(true));

    let web = get(&store, "t2", "globex", "web").await;
    assert_eq!(web.get_bool("is_branch_protected_by_jit"), Some(false));

    assert_eq!(report.transformed, 2);
    assert_eq!(report.skipped_records, 1);
}

#[tokio::test]
async fn test_mark_inactive_policy_deactivates_missing_repositories() {
    let server = MockServer::start().await;
    mount_globex(&server).await;

    let store = seeded().await;
    let report = run(
        &store,
        job("sync_active", "mark_inactive", Some(vec!["t2"])),
        enricher(&server, secrets()),
    )
    .await;

    assert!(report.skipped_tenants.is_empty());
    assert_eq!(report.tenants_processed, 1);
    let legacy = get(&store, "t2", "globex", "legacy").await;
    assert_eq!(legacy.get_bool("is_active"), Some(false));
    assert_eq!(legacy.get_bool("is_covered"), Some(false));
    assert_eq!(legacy.get_str("GSI4PK"), Some("TENANT#t2#ACTIVE#false"));
    assert!(index::is_consistent(&legacy));

    let api = get(&store, "t2", "globex", "api").await;
    assert_eq!(api.get_bool("is_active"), Some(true));
    assert_eq!(api.get("external_id"), Some(&json!(501)));
    assert_eq!(api.get("external_repository_id"), None);
}

#[tokio::test]
async fn test_missing_secret_skips_tenant() {
    let server = MockServer::start().await;
    mount_globex(&server).await;

    let store = seeded().await;
    let secrets = StaticSecretStore::new().with_secret("github-app-certification-22", PRIVATE_KEY);
    let report = run(
        &store,
        job("archived_flag", "leave_unchanged", None),
        enricher(&server, secrets),
    )
    .await;

    assert_eq!(report.skipped_tenants.len(), 1);
    assert_eq!(report.skipped_tenants[0].tenant_id, "t1");
    assert!(
        report.skipped_tenants[0]
            .reason
            .contains("github-app-certification-11")
    );
    // legacy has no repository and is left alone
    assert_eq!(report.skip_reasons.values().sum::<u64>(), 1);
    assert_eq!(
        get(&store, "t2", "globex", "api").await.get_bool("is_archived"),
        Some(false)
    );
}

/// Fails asset reads for one tenant partition while `broken` is set.
struct BrokenPartition {
    inner: MemoryStore,
    partition: String,
    broken: AtomicBool,
}

#[async_trait]
impl Store for BrokenPartition {
    async fn read_page(
        &self,
        request: &ReadRequest,
        start: Option<&Cursor>,
    ) -> Result<Page, StoreError> {
        let hits_partition = request.table == "Assets"
            && request
                .key
                .as_ref()
                .is_some_and(|key| key.partition == json!(self.partition));
        if hits_partition && self.broken.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("connection reset".to_string()));
        }
        self.inner.read_page(request, start).await
    }

    async fn batch_write(&self, table: &str, ops: &[WriteOp]) -> Result<(), StoreError> {
        self.inner.batch_write(table, ops).await
    }

    async fn get(&self, table: &str, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        self.inner.get(table, key).await
    }
}

fn uncover_job() -> JobSpec {
    JobSpec::from_json(
        &json!({
            "name": "uncover-tenants",
            "scope": {"type": "tenants"},
            "action": {"type": "transform", "transform": {"kind": "set_covered", "covered": false}},
            "page_size": 1
        })
        .to_string(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_tenant_page_checkpoint_survives_asset_read_failure() {
    let reference = seeded().await;
    JobRunner::new(&reference, uncover_job())
        .unwrap()
        .retry(RetryConfig::immediate(1))
        .now(now())
        .run(None)
        .await
        .unwrap();

    let store = BrokenPartition {
        inner: seeded().await,
        partition: "TENANT#t2".to_string(),
        broken: AtomicBool::new(true),
    };
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let err = JobRunner::new(&store, uncover_job())
        .unwrap()
        .retry(RetryConfig::immediate(1))
        .now(now())
        .checkpoints(checkpoints.clone())
        .run(None)
        .await
        .unwrap_err();

    let checkpoint = match err {
        JobError::Aborted { source, checkpoint } => {
            assert!(matches!(source, StoreError::Backend(_)));
            *checkpoint.expect("aborted run carries its checkpoint")
        }
        other => panic!("expected Aborted, got {:?}", other),
    };
    // t1 finished before t2 failed; nothing of t2 was counted.
    assert_eq!(checkpoint.processed_count, 1);
    assert!(checkpoint.last_cursor.is_some());
    assert_eq!(checkpoints.current(), Some(checkpoint.clone()));
    assert_eq!(
        get(&store.inner, "t1", "acme", "widgets").await.get_bool("is_covered"),
        Some(false)
    );
    assert_eq!(
        get(&store.inner, "t2", "globex", "api").await.get_bool("is_covered"),
        Some(true)
    );

    store.broken.store(false, Ordering::SeqCst);
    let report = JobRunner::new(&store, uncover_job())
        .unwrap()
        .retry(RetryConfig::immediate(1))
        .now(now())
        .checkpoints(checkpoints.clone())
        .run(Some(checkpoint))
        .await
        .unwrap();

    assert_eq!(report.phase, Phase::Completed);
    assert_eq!(report.processed, 4);
    assert_eq!(report.tenants_processed, 1);
    assert_eq!(report.transformed, 3);
    assert_eq!(checkpoints.current(), None);
    assert_eq!(
        store.inner.records("Assets").await,
        reference.records("Assets").await
    );
}

#[tokio::test]
async fn test_concurrent_tenants_merge_into_one_report() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/app/installations/101/access_tokens"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "message": "Bad credentials"
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_globex(&server).await;
    Mock::given(method("POST"))
        .and(path("/app/installations/303/access_tokens"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"token": "ghs_t3"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/installation/repositories"))
        .and(header("authorization", "Bearer ghs_t3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total_count": 1,
            "repositories": [repo(701, "initech", "core")]
        })))
        .mount(&server)
        .await;

    let store = seeded().await;
    store
        .insert_all("Tenants", [tenant("t3", "initech", "33", "303")])
        .await
        .unwrap();
    store
        .insert_all("Assets", [asset("t3", "initech", "core")])
        .await
        .unwrap();
    let secrets = secrets().with_secret("github-app-certification-33", PRIVATE_KEY);

    let job = JobSpec::from_json(
        &json!({
            "name": "sync-concurrently",
            "scope": {"type": "tenants"},
            "action": {"type": "transform", "transform": {"kind": "sync_active"}},
            "missing_match": "leave_unchanged",
            "concurrency": 3
        })
        .to_string(),
    )
    .unwrap();
    let report = run(&store, job, enricher(&server, secrets)).await;

    assert_eq!(report.phase, Phase::Completed);
    assert_eq!(report.tenants_processed, 2);
    assert_eq!(report.skipped_tenants.len(), 1);
    assert_eq!(report.skipped_tenants[0].tenant_id, "t1");
    assert!(report.skipped_tenants[0].reason.contains("401"));
    assert_eq!(report.processed, 4);
    assert_eq!(report.transformed, 3);
    assert_eq!(report.skipped_records, 1);
    assert_eq!(report.skip_reasons.get(&SkipReason::NoMatch), Some(&1));

    assert_eq!(
        get(&store, "t3", "initech", "core").await.get("external_id"),
        Some(&json!(701))
    );
    assert_eq!(
        get(&store, "t2", "globex", "web").await.get("external_id"),
        Some(&json!(502))
    );
    assert_eq!(
        get(&store, "t2", "globex", "legacy").await.get("external_id"),
        None
    );
}
