//! Write coordination: issues create/update/delete calls against the cluster
//! store and classifies what came back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use kube::ResourceExt;
use tracing::debug;
use tracing::info;

use crate::domain::change::Watched;

/// Response classes of the cluster store.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum ApiError {
    #[display("conflict: {_0}")]
    Conflict(String),
    #[display("already exists: {_0}")]
    AlreadyExists(String),
    #[display("not found: {_0}")]
    NotFound(String),
    #[display("namespace is being terminated: {_0}")]
    NamespaceTerminating(String),
    #[display("invalid: {_0}")]
    Invalid(String),
    #[display("unavailable: {_0}")]
    Unavailable(String),
}

impl std::error::Error for ApiError {}

/// Write access to one kind in the cluster store.
#[async_trait]
pub trait ObjectApi<K>: Send + Sync {
    async fn create(&self, obj: &K) -> Result<K, ApiError>;

    /// Replaces the object; the resource version in `obj` is a precondition.
    async fn update(&self, obj: &K) -> Result<K, ApiError>;

    async fn delete(&self, obj: &K) -> Result<(), ApiError>;
}

/// Local bookkeeping refreshed after every successful write.
pub trait WriteTracker<K>: Send + Sync {
    fn written(&self, previous: Option<&K>, written: &K);
    fn deleted(&self, obj: &K);

    /// The object was already gone when the delete reached the server.
    fn missing(&self, obj: &K) {
        self.deleted(obj);
    }
}

/// Field-level equality of the parts of an object this controller owns.
pub trait SemanticEq {
    fn semantically_eq(&self, other: &Self) -> bool;
}

#[derive(Debug)]
pub enum WriteOp<K> {
    Create(K),
    Update { desired: K, observed: Arc<K> },
    Delete(Arc<K>),
}

impl<K: kube::Resource> WriteOp<K> {
    pub fn verb(&self) -> &'static str {
        match self {
            WriteOp::Create(_) => "create",
            WriteOp::Update { .. } => "update",
            WriteOp::Delete(_) => "delete",
        }
    }

    fn target(&self) -> String {
        let obj: &K = match self {
            WriteOp::Create(obj) => obj,
            WriteOp::Update { desired, .. } => desired,
            WriteOp::Delete(obj) => obj,
        };
        let name = obj
            .meta()
            .name
            .clone()
            .or_else(|| obj.meta().generate_name.as_ref().map(|p| format!("{p}*")))
            .unwrap_or_default();
        format!("{}/{}", obj.namespace().unwrap_or_default(), name)
    }
}

#[derive(Debug)]
pub enum WriteOutcome<K> {
    Created(K),
    Updated(K),
    Deleted,
    /// Desired and observed were equivalent; nothing was sent.
    Unchanged,
    /// Update or delete of an object that is already gone.
    AlreadyConverged,
    /// The namespace is being torn down; nothing to converge.
    Skipped,
}

impl<K> WriteOutcome<K> {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            WriteOutcome::Created(_) | WriteOutcome::Updated(_) | WriteOutcome::Deleted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum WriteError {
    #[display("write conflicted with a concurrent change")]
    Conflict,
    #[display("write failed and should be retried with backoff")]
    Retryable,
    #[display("write was rejected as invalid")]
    Rejected,
}

impl std::error::Error for WriteError {}

pub struct WriteCoordinator<K> {
    api: Arc<dyn ObjectApi<K>>,
    tracker: Arc<dyn WriteTracker<K>>,
    timeout: Duration,
}

impl<K> WriteCoordinator<K>
where
    K: Watched + SemanticEq,
{
    pub fn new(
        api: Arc<dyn ObjectApi<K>>,
        tracker: Arc<dyn WriteTracker<K>>,
        timeout: Duration,
    ) -> Self {
        Self {
            api,
            tracker,
            timeout,
        }
    }

    /// Applies one write. Every call is independent; a failure says nothing
    /// about other writes of the same reconciliation.
    pub async fn apply(&self, op: WriteOp<K>) -> Result<WriteOutcome<K>, Report<WriteError>> {
        let verb = op.verb();
        let target = op.target();

        let result = match op {
            WriteOp::Create(desired) => self
                .call(self.api.create(&desired))
                .await
                .map(|created| {
                    self.tracker.written(None, &created);
                    WriteOutcome::Created(created)
                }),
            WriteOp::Update { desired, observed } => {
                if desired.semantically_eq(&observed) {
                    debug!(kind = K::KIND, object = %target, "Desired state equals observed, skipping update");
                    return Ok(WriteOutcome::Unchanged);
                }
                self.call(self.api.update(&desired))
                    .await
                    .map(|updated| {
                        self.tracker.written(Some(&observed), &updated);
                        WriteOutcome::Updated(updated)
                    })
                    .or_else(|err| match err {
                        ApiError::NotFound(_) => Ok(WriteOutcome::AlreadyConverged),
                        other => Err(other),
                    })
            }
            WriteOp::Delete(observed) => self
                .call(self.api.delete(&observed))
                .await
                .map(|()| {
                    self.tracker.deleted(&observed);
                    WriteOutcome::Deleted
                })
                .or_else(|err| match err {
                    ApiError::NotFound(_) => {
                        self.tracker.missing(&observed);
                        Ok(WriteOutcome::AlreadyConverged)
                    }
                    other => Err(other),
                }),
        };

        match result {
            Ok(outcome) => Ok(outcome),
            Err(ApiError::NamespaceTerminating(message)) => {
                info!(kind = K::KIND, object = %target, %message, "Namespace is terminating, skipping {verb}");
                Ok(WriteOutcome::Skipped)
            }
            Err(err) => {
                let class = match &err {
                    ApiError::Conflict(_) | ApiError::AlreadyExists(_) => WriteError::Conflict,
                    ApiError::Invalid(_) => WriteError::Rejected,
                    _ => WriteError::Retryable,
                };
                Err(Report::new(err)
                    .change_context(class)
                    .attach_printable(format!("{verb} {} {target}", K::KIND)))
            }
        }
    }

    async fn call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, ApiError>>,
    ) -> Result<T, ApiError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Unavailable(format!(
                "request timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::Endpoints;
    use k8s_openapi::api::discovery::v1::EndpointSlice;

    use super::*;
    use crate::domain::keys::ServiceKey;
    use crate::domain::service::LABEL_SERVICE_NAME;
    use crate::domain::tracker::EndpointSliceTracker;
    use crate::mock::fixtures;
    use crate::mock::FakeApi;
    use crate::mock::Failure;

    struct NoopTracker;

    impl WriteTracker<Endpoints> for NoopTracker {
        fn written(&self, _previous: Option<&Endpoints>, _written: &Endpoints) {}
        fn deleted(&self, _obj: &Endpoints) {}
    }

    fn coordinator(api: Arc<FakeApi<Endpoints>>) -> WriteCoordinator<Endpoints> {
        WriteCoordinator::new(api, Arc::new(NoopTracker), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn create_then_unchanged_update_skips_the_call() {
        let api = Arc::new(FakeApi::<Endpoints>::detached());
        let writer = coordinator(Arc::clone(&api));

        let created = match writer
            .apply(WriteOp::Create(fixtures::endpoints("default", "svc")))
            .await
            .unwrap()
        {
            WriteOutcome::Created(obj) => obj,
            other => panic!("unexpected outcome {other:?}"),
        };
        let outcome = writer
            .apply(WriteOp::Update {
                desired: created.clone(),
                observed: Arc::new(created),
            })
            .await
            .unwrap();

        assert!(matches!(outcome, WriteOutcome::Unchanged));
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn classifies_failures() {
        let api = Arc::new(FakeApi::<Endpoints>::detached());
        let writer = coordinator(Arc::clone(&api));
        let obj = fixtures::endpoints("default", "svc");

        api.fail_next(Failure::Api(ApiError::Conflict("rv mismatch".into())));
        let err = writer.apply(WriteOp::Create(obj.clone())).await.unwrap_err();
        assert_eq!(*err.current_context(), WriteError::Conflict);

        api.fail_next(Failure::Api(ApiError::Invalid("bad port".into())));
        let err = writer.apply(WriteOp::Create(obj.clone())).await.unwrap_err();
        assert_eq!(*err.current_context(), WriteError::Rejected);

        api.fail_next(Failure::Api(ApiError::Unavailable("etcd down".into())));
        let err = writer.apply(WriteOp::Create(obj.clone())).await.unwrap_err();
        assert_eq!(*err.current_context(), WriteError::Retryable);

        api.fail_next(Failure::Api(ApiError::NamespaceTerminating("ns".into())));
        let outcome = writer.apply(WriteOp::Create(obj)).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Skipped));
    }

    #[tokio::test]
    async fn not_found_on_delete_is_converged() {
        let api = Arc::new(FakeApi::<Endpoints>::detached());
        let writer = coordinator(api);
        let mut obj = fixtures::endpoints("default", "svc");
        obj.metadata.resource_version = Some("7".to_string());

        let outcome = writer.apply(WriteOp::Delete(Arc::new(obj))).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::AlreadyConverged));
    }

    #[tokio::test]
    async fn vanished_slice_leaves_no_pending_deletion() {
        let tracker = Arc::new(EndpointSliceTracker::new());
        let writer = WriteCoordinator::new(
            Arc::new(FakeApi::<EndpointSlice>::detached()),
            Arc::clone(&tracker) as Arc<dyn WriteTracker<EndpointSlice>>,
            Duration::from_millis(200),
        );
        let mut slice = EndpointSlice {
            address_type: "IPv4".to_string(),
            ..Default::default()
        };
        slice.metadata.namespace = Some("default".to_string());
        slice.metadata.name = Some("svc-abc".to_string());
        slice.metadata.generation = Some(1);
        slice.metadata.labels = Some(BTreeMap::from([(
            LABEL_SERVICE_NAME.to_string(),
            "svc".to_string(),
        )]));
        tracker.update(&slice);

        let outcome = writer
            .apply(WriteOp::Delete(Arc::new(slice.clone())))
            .await
            .unwrap();

        assert!(matches!(outcome, WriteOutcome::AlreadyConverged));
        assert!(!tracker.deletion_expected(&slice));
        assert!(!tracker.has(&slice));
        assert!(!tracker.stale_slices(&ServiceKey::new("default", "svc"), &[]));
    }

    #[tokio::test]
    async fn slow_calls_time_out_as_retryable() {
        let api = Arc::new(FakeApi::<Endpoints>::detached());
        let writer = coordinator(Arc::clone(&api));
        api.fail_next(Failure::Hang(Duration::from_secs(5)));

        let err = writer
            .apply(WriteOp::Create(fixtures::endpoints("default", "svc")))
            .await
            .unwrap_err();
        assert_eq!(*err.current_context(), WriteError::Retryable);
    }
}
