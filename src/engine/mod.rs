//! One reconciliation pass over the shard.
//!
//! A pass lists the shard prefix, then runs fetch, decrypt/unpack and apply
//! for every artifact independently.  A failing artifact is recorded and the
//! rest carry on; the pass reports an error only after all of them settled.

pub mod locks;
pub mod outcome;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use outcome::{ArtifactOutcome, Outcome, PassError, PassResult, PassSummary, Stage};

use crate::bundle::decrypt_and_unpack;
use crate::credentials::KeyMaterial;
use crate::error::{Classify, ErrorClass};
use crate::mirror::MirrorClient;
use crate::storage::artifact::{in_shard, is_artifact_key, target_for_key};
use crate::storage::{ArtifactStore, SyncArtifact};
use locks::TargetLocks;

/// Static inputs of every pass.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// `{S3_KEY_PREFIX}{shard}/`
    pub shard_prefix: String,
    pub default_namespace: String,
    pub workdir: PathBuf,
    pub concurrency: usize,
    pub dry_run: bool,
}

pub struct SyncEngine {
    worker: Arc<Worker>,
    concurrency: usize,
}

/// State shared by the per-artifact tasks.
struct Worker {
    store: Arc<dyn ArtifactStore>,
    mirror: Arc<dyn MirrorClient>,
    keys: Arc<KeyMaterial>,
    locks: TargetLocks,
    settings: EngineSettings,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        mirror: Arc<dyn MirrorClient>,
        keys: Arc<KeyMaterial>,
        settings: EngineSettings,
    ) -> Self {
        let concurrency = settings.concurrency.max(1);
        Self {
            worker: Arc::new(Worker {
                store,
                mirror,
                keys,
                locks: TargetLocks::default(),
                settings,
            }),
            concurrency,
        }
    }

    /// Run one pass.  Cancelling `cancel` stops in-flight artifacts, which
    /// are then reported as cancelled.
    #[instrument(skip_all, fields(prefix = %self.worker.settings.shard_prefix, dry_run = self.worker.settings.dry_run))]
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<PassResult, PassError> {
        let started = Instant::now();

        let artifacts = tokio::select! {
            _ = cancel.cancelled() => return Err(PassError::Cancelled),
            listed = self.discover() => listed?,
        };
        info!(count = artifacts.len(), "artifacts discovered");

        let keys: BTreeSet<String> = artifacts.iter().map(|a| a.key.clone()).collect();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for artifact in artifacts {
            let worker = self.worker.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let key = artifact.key.clone();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => cancelled(key),
                    outcome = async {
                        // Closed only if the semaphore is dropped, which it is not.
                        let _permit = semaphore.acquire_owned().await.ok();
                        worker.process(artifact).await
                    } => outcome,
                }
            });
        }

        let mut outcomes = Vec::with_capacity(keys.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "artifact task failed"),
            }
        }

        // A task that panicked left no outcome behind.
        let settled: BTreeSet<&str> = outcomes.iter().map(|o| o.key.as_str()).collect();
        let missing: Vec<String> = keys
            .iter()
            .filter(|k| !settled.contains(k.as_str()))
            .cloned()
            .collect();
        for key in missing {
            outcomes.push(ArtifactOutcome::failed(
                key,
                None,
                Stage::Internal,
                &"processing task panicked",
                ErrorClass::Retryable,
            ));
        }

        outcomes.sort_by(|a, b| a.key.cmp(&b.key));
        let result = PassResult {
            outcomes,
            dry_run: self.worker.settings.dry_run,
            duration: started.elapsed(),
        };
        let summary = result.summary();
        info!(
            applied = summary.applied,
            skipped = summary.skipped,
            failed = summary.failed,
            duration_ms = result.duration.as_millis() as u64,
            "pass complete"
        );

        if summary.failed == 0 {
            Ok(result)
        } else {
            let failed: Vec<&str> = result.failures().map(|o| o.key.as_str()).collect();
            warn!(keys = ?failed, worst = ?summary.worst, "artifacts failed this pass");
            Err(PassError::Artifacts { result, summary })
        }
    }

    /// List the shard and keep the artifact keys that really lie inside it.
    async fn discover(&self) -> Result<Vec<SyncArtifact>, PassError> {
        let prefix = &self.worker.settings.shard_prefix;
        let listed = self
            .worker
            .store
            .list(prefix)
            .await
            .map_err(PassError::Discovery)?;

        let mut artifacts: Vec<SyncArtifact> = listed
            .into_iter()
            .filter(|a| {
                if !in_shard(&a.key, prefix) {
                    warn!(key = %a.key, "listed object outside shard prefix; ignoring");
                    return false;
                }
                if !is_artifact_key(&a.key) {
                    debug!(key = %a.key, "not a snapshot artifact; ignoring");
                    return false;
                }
                true
            })
            .collect();
        artifacts.sort_by(|a, b| a.key.cmp(&b.key));
        artifacts.dedup_by(|a, b| a.key == b.key);
        Ok(artifacts)
    }
}

fn cancelled(key: String) -> ArtifactOutcome {
    ArtifactOutcome::failed(key, None, Stage::Cancelled, &"pass cancelled", ErrorClass::Retryable)
}

impl Worker {
    #[instrument(
        skip_all,
        fields(
            key = %artifact.key,
            etag = artifact.etag.as_deref(),
            last_modified = artifact.last_modified.map(|t| t.timestamp()),
            listed_size = artifact.size,
        )
    )]
    async fn process(&self, artifact: SyncArtifact) -> ArtifactOutcome {
        let SyncArtifact { key, .. } = artifact;
        let settings = &self.settings;

        let target = match target_for_key(&key, &settings.shard_prefix, &settings.default_namespace) {
            Ok(t) => t,
            Err(e) => return failure(key, None, Stage::Target, &e, ErrorClass::Permanent),
        };

        let _lock = self.locks.acquire(target.as_str()).await;

        let ciphertext = match self.store.fetch(&key).await {
            Ok(b) => b,
            Err(e) => {
                let class = e.class();
                return failure(key, Some(target), Stage::Fetch, &e, class);
            }
        };
        let downloaded = ciphertext.len() as u64;

        let bundle = match decrypt_and_unpack(ciphertext, self.keys.clone(), &settings.workdir, &target).await {
            Ok(b) => b,
            Err(e) => {
                let class = e.class();
                let mut out = failure(key, Some(target), Stage::Unpack, &e, class);
                out.downloaded = downloaded;
                return out;
            }
        };

        let outcome = match self.mirror.apply(&target, &bundle, settings.dry_run).await {
            Ok(report) if report.is_noop() => {
                info!(%target, bundle_sha256 = %bundle.sha256, "mirror already up to date");
                Outcome::Skipped {
                    reason: "up to date".to_string(),
                }
            }
            Ok(report) => {
                info!(
                    %target,
                    created = report.created,
                    changed_refs = report.changed_refs(),
                    dry_run = report.dry_run,
                    bundle_sha256 = %bundle.sha256,
                    bundle_bytes = bundle.size,
                    "bundle applied"
                );
                Outcome::Applied { report }
            }
            Err(e) => {
                let class = e.class();
                let mut out = failure(key, Some(target), Stage::Apply, &e, class);
                out.downloaded = downloaded;
                return out;
            }
        };

        ArtifactOutcome {
            key,
            target: Some(target),
            downloaded,
            outcome,
        }
    }
}

/// Build and log a failed outcome.
fn failure<E: std::fmt::Display>(
    key: String,
    target: Option<crate::storage::RepoPath>,
    stage: Stage,
    error: &E,
    class: ErrorClass,
) -> ArtifactOutcome {
    warn!(key = %key, stage = %stage, class = %class, error = %error, "artifact failed");
    ArtifactOutcome::failed(key, target, stage, error, class)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use age::x25519::Identity;
    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::bundle::header::tests::{bundle_bytes, OID_A, OID_B};
    use crate::bundle::DecodedBundle;
    use crate::config::UpdatePolicy;
    use crate::credentials::private_key::tests::seal;
    use crate::mirror::{plan, ApplyReport, MirrorError};
    use crate::storage::{RepoPath, StoreError};

    const PREFIX: &str = "shard/fedramp/";

    // -- fakes --

    #[derive(Default)]
    struct FakeStore {
        objects: BTreeMap<String, Bytes>,
        fetched: Mutex<Vec<String>>,
        list_error: Option<fn() -> StoreError>,
    }

    #[async_trait]
    impl ArtifactStore for FakeStore {
        // Ignores the prefix so the engine's own shard check is exercised.
        async fn list(&self, _prefix: &str) -> Result<Vec<SyncArtifact>, StoreError> {
            if let Some(err) = self.list_error {
                return Err(err());
            }
            Ok(self.objects.keys().rev().map(SyncArtifact::new).collect())
        }

        async fn fetch(&self, key: &str) -> Result<Bytes, StoreError> {
            self.fetched.lock().unwrap().push(key.to_string());
            self.objects.get(key).cloned().ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
        }
    }

    /// Mirror that keeps refs in memory and force-applies everything.
    #[derive(Default)]
    struct FakeMirror {
        repos: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
        in_flight: Mutex<BTreeMap<String, usize>>,
        max_in_flight_per_target: AtomicUsize,
        delay: Option<Duration>,
        hang: bool,
    }

    #[async_trait]
    impl MirrorClient for FakeMirror {
        async fn apply(
            &self,
            target: &RepoPath,
            bundle: &DecodedBundle,
            dry_run: bool,
        ) -> Result<ApplyReport, MirrorError> {
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                let n = in_flight.entry(target.to_string()).or_default();
                *n += 1;
                self.max_in_flight_per_target.fetch_max(*n, Ordering::SeqCst);
            }
            if self.hang {
                std::future::pending::<()>().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let mut repos = self.repos.lock().unwrap();
            let created = !repos.contains_key(target.as_str());
            let remote = repos.get(target.as_str()).cloned().unwrap_or_default();
            let refs = plan::plan_updates(
                bundle.header.pushable_refs(),
                &remote,
                &BTreeMap::new(),
                UpdatePolicy::Force,
            );
            if !dry_run {
                let entry = repos.entry(target.to_string()).or_default();
                for (name, oid) in bundle.header.pushable_refs() {
                    entry.insert(name.to_string(), oid.to_string());
                }
            }
            *self.in_flight.lock().unwrap().get_mut(target.as_str()).unwrap() -= 1;
            Ok(ApplyReport {
                project: target.to_string(),
                created,
                refs,
                default_branch: None,
                dry_run,
            })
        }
    }

    // -- helpers --

    struct Fixture {
        identity: Identity,
        workdir: tempfile::TempDir,
        objects: BTreeMap<String, Bytes>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                identity: Identity::generate(),
                workdir: tempfile::tempdir().unwrap(),
                objects: BTreeMap::new(),
            }
        }

        fn put(&mut self, key: &str, plaintext: &[u8]) {
            self.objects
                .insert(key.to_string(), Bytes::from(seal(&self.identity, plaintext)));
        }

        fn put_bundle(&mut self, key: &str, oid: &str) {
            self.put(key, &bundle_bytes(&[(oid, "refs/heads/main"), (oid, "HEAD")]));
        }

        fn store(&self) -> Arc<FakeStore> {
            Arc::new(FakeStore {
                objects: self.objects.clone(),
                ..Default::default()
            })
        }

        fn engine(&self, store: Arc<FakeStore>, mirror: Arc<FakeMirror>, dry_run: bool) -> SyncEngine {
            let keys = KeyMaterial::parse(&self.identity.to_string()).unwrap();
            SyncEngine::new(
                store,
                mirror,
                Arc::new(keys),
                EngineSettings {
                    shard_prefix: PREFIX.to_string(),
                    default_namespace: "mirrors".to_string(),
                    workdir: self.workdir.path().to_path_buf(),
                    concurrency: 4,
                    dry_run,
                },
            )
        }
    }

    fn kinds(result: &PassResult) -> Vec<(&str, &str)> {
        result
            .outcomes
            .iter()
            .map(|o| (o.key.as_str(), o.outcome.as_str()))
            .collect()
    }

    fn repo_refs(mirror: &FakeMirror, target: &str) -> Option<BTreeMap<String, String>> {
        mirror.repos.lock().unwrap().get(target).cloned()
    }

    // -- properties --

    #[tokio::test]
    async fn applies_repo_a_to_default_namespace() {
        let mut fx = Fixture::new();
        fx.put_bundle("shard/fedramp/repoA.bundle.enc", OID_A);
        let mirror = Arc::new(FakeMirror::default());

        let result = fx
            .engine(fx.store(), mirror.clone(), false)
            .run_pass(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(kinds(&result), [("shard/fedramp/repoA.bundle.enc", "applied")]);
        let outcome = &result.outcomes[0];
        assert_eq!(outcome.target.as_ref().map(RepoPath::as_str), Some("mirrors/repoA"));
        assert!(outcome.downloaded > 0);
        assert_eq!(
            repo_refs(&mirror, "mirrors/repoA").unwrap().get("refs/heads/main").map(String::as_str),
            Some(OID_A)
        );
    }

    #[tokio::test]
    async fn only_shard_artifacts_are_fetched() {
        let mut fx = Fixture::new();
        fx.put_bundle("shard/fedramp/repoA.bundle.enc", OID_A);
        fx.put_bundle("shard/other/repoB.bundle.enc", OID_A);
        fx.put_bundle("shard/fedramp-east/repoC.bundle.enc", OID_A);
        fx.put("shard/fedramp/README.txt", b"not an artifact");
        let store = fx.store();
        let mirror = Arc::new(FakeMirror::default());

        let result = fx
            .engine(store.clone(), mirror.clone(), false)
            .run_pass(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.outcomes.len(), 1);
        assert_eq!(*store.fetched.lock().unwrap(), ["shard/fedramp/repoA.bundle.enc"]);
        assert_eq!(mirror.repos.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn one_corrupt_artifact_does_not_stop_the_rest() {
        let mut fx = Fixture::new();
        fx.put_bundle("shard/fedramp/a.bundle.enc", OID_A);
        fx.put("shard/fedramp/b.bundle.enc", b"definitely not a bundle");
        fx.put_bundle("shard/fedramp/c.bundle.enc", OID_A);
        fx.put_bundle("shard/fedramp/team/d.bundle.enc", OID_B);
        let mirror = Arc::new(FakeMirror::default());

        let err = fx
            .engine(fx.store(), mirror.clone(), false)
            .run_pass(&CancellationToken::new())
            .await
            .unwrap_err();

        let PassError::Artifacts { result, summary } = &err else {
            panic!("unexpected error: {err:?}");
        };
        assert_eq!((summary.applied, summary.failed), (3, 1));
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert_eq!(
            kinds(result),
            [
                ("shard/fedramp/a.bundle.enc", "applied"),
                ("shard/fedramp/b.bundle.enc", "failed"),
                ("shard/fedramp/c.bundle.enc", "applied"),
                ("shard/fedramp/team/d.bundle.enc", "applied"),
            ]
        );
        assert!(matches!(
            result.outcomes[1].outcome,
            Outcome::Failed { stage: Stage::Unpack, .. }
        ));
        assert!(repo_refs(&mirror, "mirrors/b").is_none());
        assert!(repo_refs(&mirror, "team/d").is_some());
    }

    #[tokio::test]
    async fn wrong_key_fails_without_mutation() {
        let mut fx = Fixture::new();
        fx.put_bundle("shard/fedramp/repoA.bundle.enc", OID_A);
        let store = fx.store();
        fx.identity = Identity::generate();
        let mirror = Arc::new(FakeMirror::default());

        let err = fx
            .engine(store, mirror.clone(), false)
            .run_pass(&CancellationToken::new())
            .await
            .unwrap_err();

        let result = err.result().unwrap();
        match &result.outcomes[0].outcome {
            Outcome::Failed { stage, class, error } => {
                assert_eq!(*stage, Stage::Unpack);
                assert_eq!(*class, ErrorClass::Retryable);
                assert!(error.contains("decryption"), "{error}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(mirror.repos.lock().unwrap().is_empty());
        assert_eq!(std::fs::read_dir(fx.workdir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn dry_run_reports_without_mutating() {
        let mut fx = Fixture::new();
        fx.put_bundle("shard/fedramp/repoA.bundle.enc", OID_A);
        fx.put_bundle("shard/fedramp/repoB.bundle.enc", OID_B);
        let mirror = Arc::new(FakeMirror::default());

        let dry = fx
            .engine(fx.store(), mirror.clone(), true)
            .run_pass(&CancellationToken::new())
            .await
            .unwrap();
        assert!(dry.dry_run);
        assert!(mirror.repos.lock().unwrap().is_empty());

        let real = fx
            .engine(fx.store(), mirror.clone(), false)
            .run_pass(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(kinds(&dry), kinds(&real));
        for (d, r) in dry.outcomes.iter().zip(&real.outcomes) {
            let (Outcome::Applied { report: dr }, Outcome::Applied { report: rr }) = (&d.outcome, &r.outcome) else {
                panic!("expected applied outcomes");
            };
            assert_eq!(dr.refs, rr.refs);
            assert!(dr.dry_run && !rr.dry_run);
        }
    }

    #[tokio::test]
    async fn second_pass_over_same_snapshots_is_a_no_op() {
        let mut fx = Fixture::new();
        fx.put_bundle("shard/fedramp/repoA.bundle.enc", OID_A);
        fx.put_bundle("shard/fedramp/repoB.bundle.enc", OID_B);
        let mirror = Arc::new(FakeMirror::default());
        let engine = fx.engine(fx.store(), mirror.clone(), false);

        engine.run_pass(&CancellationToken::new()).await.unwrap();
        let state = mirror.repos.lock().unwrap().clone();

        let again = engine.run_pass(&CancellationToken::new()).await.unwrap();
        assert!(again
            .outcomes
            .iter()
            .all(|o| matches!(o.outcome, Outcome::Skipped { .. })));
        assert_eq!(*mirror.repos.lock().unwrap(), state);
        assert_eq!(std::fs::read_dir(fx.workdir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn same_target_is_never_applied_concurrently() {
        let mut fx = Fixture::new();
        // Both resolve to mirrors/repoA.
        fx.put_bundle("shard/fedramp/repoA.bundle.enc", OID_A);
        fx.put_bundle("shard/fedramp/mirrors/repoA.bundle.enc", OID_B);
        let mirror = Arc::new(FakeMirror {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });

        let result = fx
            .engine(fx.store(), mirror.clone(), false)
            .run_pass(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.outcomes.len(), 2);
        assert_eq!(mirror.max_in_flight_per_target.load(Ordering::SeqCst), 1);
    }

    fn access_denied() -> StoreError {
        StoreError::AccessDenied {
            code: "AccessDenied".to_string(),
            message: "Access Denied".to_string(),
        }
    }

    #[tokio::test]
    async fn discovery_failure_fails_the_pass() {
        let fx = Fixture::new();
        let store = Arc::new(FakeStore {
            list_error: Some(access_denied),
            ..Default::default()
        });

        let err = fx
            .engine(store, Arc::new(FakeMirror::default()), false)
            .run_pass(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PassError::Discovery(StoreError::AccessDenied { .. })));
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[tokio::test]
    async fn empty_shard_is_a_successful_pass() {
        let fx = Fixture::new();
        let result = fx
            .engine(fx.store(), Arc::new(FakeMirror::default()), false)
            .run_pass(&CancellationToken::new())
            .await
            .unwrap();
        assert!(result.outcomes.is_empty());
    }

    #[tokio::test]
    async fn cancellation_marks_in_flight_artifacts() {
        let mut fx = Fixture::new();
        fx.put_bundle("shard/fedramp/repoA.bundle.enc", OID_A);
        let mirror = Arc::new(FakeMirror {
            hang: true,
            ..Default::default()
        });
        let engine = fx.engine(fx.store(), mirror, false);
        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            }
        });

        let err = tokio::time::timeout(Duration::from_secs(5), engine.run_pass(&cancel))
            .await
            .unwrap()
            .unwrap_err();
        let result = err.result().unwrap();
        assert!(matches!(
            result.outcomes[0].outcome,
            Outcome::Failed { stage: Stage::Cancelled, .. }
        ));
        assert_eq!(err.class(), ErrorClass::Retryable);
        // The aborted attempt's scratch directory is gone.
        assert_eq!(std::fs::read_dir(fx.workdir.path()).unwrap().count(), 0);
    }
}
