//! Local records of what this controller wrote, used to tell a lagging cache
//! apart from a real change.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::ResourceExt;

use crate::domain::keys::ServiceKey;
use crate::domain::service::LABEL_SERVICE_NAME;
use crate::domain::write::WriteTracker;

const DELETION_EXPECTED: i64 = -1;

/// Owning service of a slice, from its service-name label.
pub fn slice_service_key(slice: &EndpointSlice) -> Option<ServiceKey> {
    let name = slice.labels().get(LABEL_SERVICE_NAME)?;
    Some(ServiceKey::new(slice.namespace().unwrap_or_default(), name))
}

fn generation(slice: &EndpointSlice) -> i64 {
    slice.metadata.generation.unwrap_or(0)
}

/// Last generation written for every slice, per service. Deletions this
/// controller issued are kept as `DELETION_EXPECTED` until the cache drops
/// the slice.
#[derive(Default)]
pub struct EndpointSliceTracker {
    generations: DashMap<ServiceKey, HashMap<String, i64>>,
}

impl EndpointSliceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, slice: &EndpointSlice) -> bool {
        let Some(key) = slice_service_key(slice) else {
            return false;
        };
        self.generations
            .get(&key)
            .map(|slices| slices.contains_key(&slice.name_any()))
            .unwrap_or(false)
    }

    /// False when the slice is exactly what this controller last wrote.
    pub fn should_sync(&self, slice: &EndpointSlice) -> bool {
        let Some(key) = slice_service_key(slice) else {
            return true;
        };
        match self
            .generations
            .get(&key)
            .and_then(|slices| slices.get(&slice.name_any()).copied())
        {
            Some(written) => generation(slice) > written,
            None => true,
        }
    }

    /// Whether the deletion of this slice was issued by this controller.
    pub fn deletion_expected(&self, slice: &EndpointSlice) -> bool {
        let Some(key) = slice_service_key(slice) else {
            return false;
        };
        self.generations
            .get(&key)
            .and_then(|slices| slices.get(&slice.name_any()).copied())
            == Some(DELETION_EXPECTED)
    }

    /// True when the cached slices of a service are older than what was
    /// written: a lower generation, a written slice that has not shown up yet,
    /// or a deleted slice that is still listed.
    pub fn stale_slices(&self, service: &ServiceKey, cached: &[Arc<EndpointSlice>]) -> bool {
        let Some(tracked) = self.generations.get(service) else {
            return false;
        };
        let mut seen = 0;
        for slice in cached {
            if let Some(&written) = tracked.get(&slice.name_any()) {
                if written == DELETION_EXPECTED || written > generation(slice) {
                    return true;
                }
                seen += 1;
            }
        }
        let expected_present = tracked
            .values()
            .filter(|&&written| written != DELETION_EXPECTED)
            .count();
        seen < expected_present
    }

    pub fn update(&self, slice: &EndpointSlice) {
        let Some(key) = slice_service_key(slice) else {
            return;
        };
        self.generations
            .entry(key)
            .or_default()
            .insert(slice.name_any(), generation(slice));
    }

    pub fn expect_deletion(&self, slice: &EndpointSlice) {
        let Some(key) = slice_service_key(slice) else {
            return;
        };
        self.generations
            .entry(key)
            .or_default()
            .insert(slice.name_any(), DELETION_EXPECTED);
    }

    /// Forgets a slice the cache no longer holds. Returns true when the
    /// deletion was not issued by this controller.
    pub fn handle_deletion(&self, slice: &EndpointSlice) -> bool {
        let Some(key) = slice_service_key(slice) else {
            return true;
        };
        let Some(mut slices) = self.generations.get_mut(&key) else {
            return true;
        };
        let unexpected = slices.remove(&slice.name_any()) != Some(DELETION_EXPECTED);
        let emptied = slices.is_empty();
        drop(slices);
        if emptied {
            self.generations.remove_if(&key, |_, slices| slices.is_empty());
        }
        unexpected
    }

    pub fn delete_service(&self, service: &ServiceKey) {
        self.generations.remove(service);
    }
}

impl WriteTracker<EndpointSlice> for EndpointSliceTracker {
    fn written(&self, _previous: Option<&EndpointSlice>, written: &EndpointSlice) {
        self.update(written);
    }

    fn deleted(&self, obj: &EndpointSlice) {
        self.expect_deletion(obj);
    }

    fn missing(&self, obj: &EndpointSlice) {
        self.handle_deletion(obj);
    }
}

/// Resource versions replaced by this controller's own Endpoints updates.
/// Seeing one of them in the cache again means the cache has not caught up.
#[derive(Default)]
pub struct StaleEndpointsTracker {
    stale: DashMap<ServiceKey, String>,
}

impl StaleEndpointsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stale(&self, endpoints: &Endpoints) -> bool {
        let key = ServiceKey::from_object(endpoints);
        match (self.stale.get(&key), endpoints.resource_version()) {
            (Some(stale), Some(current)) => *stale == current,
            _ => false,
        }
    }

    pub fn mark_stale(&self, endpoints: &Endpoints) {
        if let Some(rv) = endpoints.resource_version() {
            self.stale.insert(ServiceKey::from_object(endpoints), rv);
        }
    }

    pub fn delete(&self, service: &ServiceKey) {
        self.stale.remove(service);
    }
}

impl WriteTracker<Endpoints> for StaleEndpointsTracker {
    fn written(&self, previous: Option<&Endpoints>, _written: &Endpoints) {
        if let Some(previous) = previous {
            self.mark_stale(previous);
        }
    }

    fn deleted(&self, obj: &Endpoints) {
        self.delete(&ServiceKey::from_object(obj));
    }
}
