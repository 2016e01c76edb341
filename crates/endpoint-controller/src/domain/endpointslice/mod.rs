//! EndpointSlice pipeline: endpoint construction, topology hints, slice
//! packing and the reconciler that writes the result.

pub mod builder;
pub mod packing;
mod reconciler;
pub mod topology;

pub use reconciler::EndpointSliceReconciler;
pub use reconciler::EndpointSliceSettings;
