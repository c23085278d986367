//! Per-municipality dataset extraction.
//!
//! For every municipality that survived the split, each dataset's tag filter
//! is applied to the municipality file, the result is converted to GeoJSON,
//! stripped of user-identifying properties, and written to
//! `<output_dir>/<stateId>/<slug>/<datasetId>.geojson`.
//!
//! Empty results produce no file. If a file for that pair exists from an
//! earlier day it is removed, so the output tree always reflects the day
//! being processed. Municipalities the split could not finish are left
//! untouched: their absence says nothing about the day.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::FailurePolicy;
use crate::fanout::{UnitLabel, WorkerLimiter};
use crate::models::{Dataset, Municipality};
use crate::osmium::ExtractionTool;
use crate::workdir::write_atomic;

/// Feature properties that identify mappers. Always removed.
pub const IDENTIFYING_PROPERTIES: &[&str] = &["user", "uid", "@user", "@uid"];

pub const ARTIFACT_EXTENSION: &str = "geojson";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: String,
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub geometry: Value,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            kind: "FeatureCollection".to_string(),
            features,
        }
    }

    /// Remove every [`IDENTIFYING_PROPERTIES`] key from every feature.
    pub fn sanitize(mut self) -> Self {
        for feature in &mut self.features {
            for key in IDENTIFYING_PROPERTIES {
                feature.properties.remove(*key);
            }
        }
        self
    }
}

/// Where the artifact for a (municipality, dataset) pair lives.
pub fn artifact_path(output_root: &Path, municipality: &Municipality, dataset: &Dataset) -> PathBuf {
    output_root
        .join(&municipality.state_id)
        .join(&municipality.slug)
        .join(format!("{}.{}", dataset.id, ARTIFACT_EXTENSION))
}

impl UnitLabel for Municipality {
    fn label(&self) -> String {
        format!("{} ({})", self.slug, self.id)
    }
}

/// What happened for one municipality.
#[derive(Debug, Clone, Default)]
pub struct MunicipalityOutcome {
    pub written: usize,
    pub removed: usize,
    pub features: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractionSummary {
    pub municipalities: usize,
    pub artifacts_written: usize,
    pub artifacts_removed: usize,
    pub features: usize,
    /// Municipalities not touched because their split was incomplete.
    pub skipped: usize,
    /// Ids of municipalities whose extraction failed under best-effort.
    pub failed: Vec<String>,
    pub duration: Duration,
}

pub struct DatasetExtractor<'a> {
    tool: &'a dyn ExtractionTool,
    limiter: &'a WorkerLimiter,
    policy: FailurePolicy,
    output_root: &'a Path,
}

impl<'a> DatasetExtractor<'a> {
    pub fn new(
        tool: &'a dyn ExtractionTool,
        limiter: &'a WorkerLimiter,
        policy: FailurePolicy,
        output_root: &'a Path,
    ) -> Self {
        Self {
            tool,
            limiter,
            policy,
            output_root,
        }
    }

    /// Extract every dataset for every municipality whose split file exists
    /// in `municipality_dir`. One concurrency-limited unit per municipality.
    /// Municipalities listed in `incomplete` keep their published artifacts.
    pub async fn extract_all(
        &self,
        municipalities: &[Municipality],
        datasets: &[Dataset],
        municipality_dir: &Path,
        scratch_dir: &Path,
        incomplete: &BTreeSet<String>,
    ) -> Result<ExtractionSummary> {
        let started = Instant::now();
        crate::workdir::reset_dir(scratch_dir).await?;

        let (skipped, units): (Vec<Municipality>, Vec<Municipality>) = municipalities
            .iter()
            .cloned()
            .partition(|m| incomplete.contains(&m.id));
        for m in &skipped {
            tracing::warn!(municipality = %m.label(), "split incomplete, keeping previous artifacts");
        }
        let ids: HashMap<String, String> =
            units.iter().map(|m| (m.label(), m.id.clone())).collect();

        tracing::info!(
            municipalities = units.len(),
            datasets = datasets.len(),
            skipped = skipped.len(),
            "extracting datasets"
        );

        let report = self
            .limiter
            .run_all("datasets", units, |m| async move {
                let source = municipality_dir.join(format!("{}.osm.pbf", m.id));
                self.extract_municipality(&m, datasets, &source, scratch_dir)
                    .await
            })
            .await;
        let stage = report.into_result(self.policy)?;

        let mut summary = ExtractionSummary {
            municipalities: stage.completed.iter().filter(|o| o.written > 0).count(),
            skipped: skipped.len(),
            failed: stage
                .failed_labels()
                .filter_map(|label| ids.get(label).cloned())
                .collect(),
            duration: started.elapsed(),
            ..Default::default()
        };
        for o in &stage.completed {
            summary.artifacts_written += o.written;
            summary.artifacts_removed += o.removed;
            summary.features += o.features;
        }

        tracing::info!(
            municipalities = summary.municipalities,
            written = summary.artifacts_written,
            removed = summary.artifacts_removed,
            features = summary.features,
            duration_ms = summary.duration.as_millis() as u64,
            "datasets extracted"
        );
        Ok(summary)
    }

    /// Run all datasets for one municipality, one after another. A missing
    /// `source` file means the municipality had no features that day.
    pub async fn extract_municipality(
        &self,
        municipality: &Municipality,
        datasets: &[Dataset],
        source: &Path,
        scratch_dir: &Path,
    ) -> Result<MunicipalityOutcome> {
        let mut outcome = MunicipalityOutcome::default();

        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            for dataset in datasets {
                let target = artifact_path(self.output_root, municipality, dataset);
                if remove_stale(&target).await? {
                    outcome.removed += 1;
                }
            }
            return Ok(outcome);
        }

        for dataset in datasets {
            let target = artifact_path(self.output_root, municipality, dataset);
            match self
                .extract_dataset(municipality, dataset, source, scratch_dir, &target)
                .await
                .with_context(|| format!("dataset '{}' of {}", dataset.id, municipality.id))?
            {
                Some(features) => {
                    outcome.written += 1;
                    outcome.features += features;
                }
                None => {
                    if remove_stale(&target).await? {
                        outcome.removed += 1;
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Returns the number of features written, or `None` when the filter
    /// matched nothing.
    async fn extract_dataset(
        &self,
        municipality: &Municipality,
        dataset: &Dataset,
        source: &Path,
        scratch_dir: &Path,
        target: &Path,
    ) -> Result<Option<usize>> {
        let scratch = scratch_dir.join(format!("{}-{}.osm.pbf", municipality.id, dataset.id));

        self.tool
            .tags_filter(source, std::slice::from_ref(&dataset.filter), &scratch)
            .await?;

        if self.tool.feature_count(&scratch).await? == 0 {
            tokio::fs::remove_file(&scratch).await.ok();
            return Ok(None);
        }

        let exported = self.tool.export_geojson(&scratch).await?;
        tokio::fs::remove_file(&scratch).await.ok();

        let collection: FeatureCollection = serde_json::from_value(exported)
            .with_context(|| format!("Unexpected GeoJSON for {}", scratch.display()))?;
        let collection = collection.sanitize();
        if collection.features.is_empty() {
            return Ok(None);
        }

        let json = serde_json::to_vec_pretty(&collection)?;
        write_atomic(target, &json).await?;
        Ok(Some(collection.features.len()))
    }
}

/// Delete an artifact left over from an earlier day. Returns true if one existed.
async fn remove_stale(target: &Path) -> Result<bool> {
    match tokio::fs::remove_file(target).await {
        Ok(()) => {
            tracing::debug!(path = %target.display(), "removed stale artifact");
            Ok(true)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("Failed to remove {}", target.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_strips_identifying_fields() {
        let collection: FeatureCollection = serde_json::from_value(json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "id": "node/1",
                "geometry": { "type": "Point", "coordinates": [-46.6, -23.5] },
                "properties": {
                    "amenity": "hospital",
                    "user": "mapper",
                    "uid": 42,
                    "@user": "mapper",
                    "@uid": 42,
                    "@version": 3
                }
            }]
        }))
        .unwrap();

        let clean = collection.sanitize();
        let props = &clean.features[0].properties;
        for key in IDENTIFYING_PROPERTIES {
            assert!(!props.contains_key(*key), "{} survived", key);
        }
        assert_eq!(props.get("amenity"), Some(&json!("hospital")));
        assert_eq!(props.get("@version"), Some(&json!(3)));
    }

    #[test]
    fn test_feature_without_properties_parses() {
        let f: Feature = serde_json::from_value(json!({
            "type": "Feature",
            "geometry": { "type": "Point", "coordinates": [0, 0] }
        }))
        .unwrap();
        assert!(f.properties.is_empty());
        assert!(f.id.is_none());
    }

    #[test]
    fn test_artifact_path_layout() {
        let m = Municipality {
            id: "3550308".into(),
            slug: "sao-paulo".into(),
            state_id: "SP".into(),
            name: None,
        };
        let d = Dataset {
            id: "hospitals".into(),
            name: None,
            filter: "nwr/amenity=hospital".into(),
        };
        assert_eq!(
            artifact_path(Path::new("/out"), &m, &d),
            PathBuf::from("/out/SP/sao-paulo/hospitals.geojson")
        );
    }
}
