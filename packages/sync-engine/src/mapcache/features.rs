//! Per-layer vector feature cache (§4.5 "feature store"): keeps cached
//! `VectorFeature`s filterable by bounding box, and reconciles a layer
//! against a remote endpoint by uploading unsynced features and applying
//! whatever the endpoint hands back.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sync_core::model::{BoundingBox, VectorFeature};
use sync_core::{ErrorKind, Result, SyncError, SystemClock, HLC};

use crate::persistence::Persistence;

/// What a layer reconcile uploaded and how the endpoint responded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    pub layer_id: String,
    pub features: Vec<VectorFeature>,
}

/// The endpoint's reply to a [`ReconcileRequest`]: authoritative versions of
/// (some of) the uploaded features, plus ids the server wants dropped
/// entirely (e.g. the feature was deleted upstream).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResponse {
    pub features: Vec<VectorFeature>,
    pub deleted: Vec<String>,
}

/// Outcome of one [`FeatureStore::reconcile`] call. Features the upload call
/// itself failed for are listed in `failed` and remain `synced = false` in
/// storage; everything else the endpoint returned was applied.
#[derive(Debug, Clone, Default)]
pub struct ReconcileSummary {
    pub applied: usize,
    pub deleted: usize,
    pub failed: Vec<String>,
}

fn feature_key(layer: &str, feature_id: &str) -> String {
    format!("feature:{layer}:{feature_id}")
}

fn feature_prefix(layer: &str) -> String {
    format!("feature:{layer}:")
}

/// Durable cache of [`VectorFeature`]s, namespaced by layer.
pub struct FeatureStore {
    persistence: Arc<dyn Persistence>,
    clock: parking_lot::Mutex<HLC>,
}

impl FeatureStore {
    #[must_use]
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self::with_node_id("feature-store", persistence)
    }

    #[must_use]
    pub fn with_node_id(node_id: impl Into<String>, persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence, clock: parking_lot::Mutex::new(HLC::new(node_id.into(), Box::new(SystemClock))) }
    }

    /// Saves a local edit. Always stamps a fresh `last_modified` and marks
    /// the stored record `synced = false`, whatever the caller passed in --
    /// only [`Self::reconcile`], applying a server-acknowledged feature, may
    /// set `synced = true`.
    pub async fn put(&self, feature: &VectorFeature) -> Result<()> {
        let mut feature = feature.clone();
        feature.synced = false;
        feature.last_modified = self.clock.lock().now();
        self.store_raw(&feature).await
    }

    async fn store_raw(&self, feature: &VectorFeature) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(feature)
            .map_err(|e| SyncError::with_source(ErrorKind::Storage, "failed to encode feature", e))?;
        self.persistence.put_asset(&feature_key(&feature.layer, &feature.id), bytes).await
    }

    pub async fn get(&self, layer: &str, feature_id: &str) -> Result<Option<VectorFeature>> {
        let Some(bytes) = self.persistence.get_asset(&feature_key(layer, feature_id)).await? else {
            return Ok(None);
        };
        let feature = rmp_serde::from_slice(&bytes)
            .map_err(|e| SyncError::with_source(ErrorKind::Storage, "failed to decode feature", e))?;
        Ok(Some(feature))
    }

    /// All cached features in `layer`.
    pub async fn list_layer(&self, layer: &str) -> Result<Vec<VectorFeature>> {
        let keys = self.persistence.list_asset_keys(&feature_prefix(layer)).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(bytes) = self.persistence.get_asset(&key).await? {
                let feature: VectorFeature = rmp_serde::from_slice(&bytes)
                    .map_err(|e| SyncError::with_source(ErrorKind::Storage, "failed to decode feature", e))?;
                out.push(feature);
            }
        }
        Ok(out)
    }

    /// Features in `layer` whose geometry intersects `bbox`.
    pub async fn query_bbox(&self, layer: &str, bbox: &BoundingBox) -> Result<Vec<VectorFeature>> {
        Ok(self.list_layer(layer).await?.into_iter().filter(|f| f.geometry.bbox().intersects(bbox)).collect())
    }

    pub async fn delete(&self, layer: &str, feature_id: &str) -> Result<()> {
        self.persistence.delete_asset(&feature_key(layer, feature_id)).await
    }

    /// Reconciles `layer` against a remote endpoint (§4.5 step 3): collects
    /// every locally-unsynced feature, hands them to `upload`, and applies
    /// the response -- returned features overwrite the local copy and are
    /// marked `synced`, and ids in `deleted` are dropped entirely. If
    /// `upload` fails, every feature that was in the request is left
    /// `synced = false` and reported in [`ReconcileSummary::failed`] rather
    /// than propagating the error, since a reconcile failure is a per-layer
    /// outcome, not a fatal one.
    pub async fn reconcile<F, Fut>(&self, layer: &str, upload: F) -> Result<ReconcileSummary>
    where
        F: FnOnce(ReconcileRequest) -> Fut,
        Fut: Future<Output = Result<ReconcileResponse>>,
    {
        let unsynced: Vec<VectorFeature> = self.list_layer(layer).await?.into_iter().filter(|f| !f.synced).collect();
        if unsynced.is_empty() {
            return Ok(ReconcileSummary::default());
        }

        let request = ReconcileRequest { layer_id: layer.to_string(), features: unsynced.clone() };
        let response = match upload(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(layer, error = %e, "feature reconcile upload failed");
                return Ok(ReconcileSummary { failed: unsynced.into_iter().map(|f| f.id).collect(), ..Default::default() });
            }
        };

        let applied = response.features.len();
        for mut feature in response.features {
            feature.synced = true;
            self.store_raw(&feature).await?;
        }
        for id in &response.deleted {
            self.delete(layer, id).await?;
        }
        Ok(ReconcileSummary { applied, deleted: response.deleted.len(), failed: Vec::new() })
    }
}
