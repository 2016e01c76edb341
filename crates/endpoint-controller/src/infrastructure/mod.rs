pub mod cache;
pub mod informer;
pub mod kube_api;
pub mod kube_client;
pub mod logging;
pub mod metrics;
