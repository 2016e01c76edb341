//! Reconciliation core: the two pipelines and the machinery they share.

pub mod change;
pub mod controller;
pub mod endpoints;
pub mod endpointslice;
pub mod keys;
pub mod pod;
pub mod queue;
pub mod selector;
pub mod service;
pub mod tracker;
pub mod translator;
pub mod write;
