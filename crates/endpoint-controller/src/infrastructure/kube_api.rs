//! [`ObjectApi`] backed by the Kubernetes API server.

use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::DeleteParams;
use kube::api::PostParams;
use kube::api::Preconditions;
use kube::Api;
use kube::Client;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::domain::change::Watched;
use crate::domain::write::ApiError;
use crate::domain::write::ObjectApi;

/// Writes namespaced objects of kind `K`.
pub struct KubeObjectApi<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeObjectApi<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K> KubeObjectApi<K>
where
    K: Watched + kube::Resource<Scope = NamespaceResourceScope>,
{
    fn api(&self, obj: &K) -> Api<K> {
        let namespace = obj.namespace().unwrap_or_default();
        Api::namespaced(self.client.clone(), &namespace)
    }
}

#[async_trait]
impl<K> ObjectApi<K> for KubeObjectApi<K>
where
    K: Watched + kube::Resource<Scope = NamespaceResourceScope> + Serialize + DeserializeOwned,
{
    async fn create(&self, obj: &K) -> Result<K, ApiError> {
        self.api(obj)
            .create(&PostParams::default(), obj)
            .await
            .map_err(classify)
    }

    async fn update(&self, obj: &K) -> Result<K, ApiError> {
        self.api(obj)
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await
            .map_err(classify)
    }

    async fn delete(&self, obj: &K) -> Result<(), ApiError> {
        let params = DeleteParams {
            preconditions: obj.uid().map(|uid| Preconditions {
                uid: Some(uid),
                resource_version: None,
            }),
            ..DeleteParams::default()
        };
        self.api(obj)
            .delete(&obj.name_any(), &params)
            .await
            .map(|_| ())
            .map_err(classify)
    }
}

/// Maps an API server response onto the classes the write path acts on.
pub fn classify(err: kube::Error) -> ApiError {
    match err {
        kube::Error::Api(response) => {
            let message = response.message;
            match response.code {
                409 if response.reason == "AlreadyExists" => ApiError::AlreadyExists(message),
                409 => ApiError::Conflict(message),
                404 => ApiError::NotFound(message),
                403 if response.reason == "NamespaceTerminating"
                    || message.contains("because it is being terminated") =>
                {
                    ApiError::NamespaceTerminating(message)
                }
                400 | 422 => ApiError::Invalid(message),
                _ => ApiError::Unavailable(message),
            }
        }
        other => ApiError::Unavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use kube::error::ErrorResponse;

    use super::*;

    fn response(code: u16, reason: &str, message: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn classifies_api_responses() {
        similar_asserts::assert_eq!(
            classify(response(409, "AlreadyExists", "exists")),
            ApiError::AlreadyExists("exists".to_string())
        );
        similar_asserts::assert_eq!(
            classify(response(409, "Conflict", "modified")),
            ApiError::Conflict("modified".to_string())
        );
        similar_asserts::assert_eq!(
            classify(response(404, "NotFound", "gone")),
            ApiError::NotFound("gone".to_string())
        );
        similar_asserts::assert_eq!(
            classify(response(422, "Invalid", "bad port")),
            ApiError::Invalid("bad port".to_string())
        );
        similar_asserts::assert_eq!(
            classify(response(500, "InternalError", "etcd")),
            ApiError::Unavailable("etcd".to_string())
        );
    }

    #[test]
    fn terminating_namespace_is_recognised_from_the_message() {
        let message =
            "endpointslices \"web-abc\" is forbidden: unable to create new content in namespace shop because it is being terminated";
        assert!(matches!(
            classify(response(403, "Forbidden", message)),
            ApiError::NamespaceTerminating(_)
        ));
        assert!(matches!(
            classify(response(403, "Forbidden", "rbac denied")),
            ApiError::Unavailable(_)
        ));
    }
}
