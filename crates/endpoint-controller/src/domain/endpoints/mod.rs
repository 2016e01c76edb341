//! Endpoints pipeline: one aggregated object per Service.

mod reconciler;
pub mod subsets;

pub use reconciler::EndpointsReconciler;
pub use reconciler::EndpointsSettings;
