//! Static reference data: the municipality list and the dataset presets.
//!
//! Both are JSON arrays read once per run.
//!
//! ```json
//! [{ "id": "3550308", "slug": "sao-paulo", "stateId": "SP", "name": "São Paulo" }]
//! ```
//!
//! ```json
//! [{ "id": "hospitals", "name": "Hospitals", "filter": "nwr/amenity=hospital" }]
//! ```

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::path::Path;

use crate::models::{Dataset, Municipality};

pub fn load_municipalities(path: &Path) -> Result<Vec<Municipality>> {
    let municipalities: Vec<Municipality> = read_json(path)?;

    let mut seen = HashSet::new();
    for m in &municipalities {
        if m.id.is_empty() || m.slug.is_empty() || m.state_id.is_empty() {
            bail!(
                "Municipality entries need id, slug and stateId ({})",
                path.display()
            );
        }
        if !seen.insert(m.id.as_str()) {
            bail!("Duplicate municipality id '{}' in {}", m.id, path.display());
        }
    }

    Ok(municipalities)
}

pub fn load_datasets(path: &Path) -> Result<Vec<Dataset>> {
    let datasets: Vec<Dataset> = read_json(path)?;

    let mut seen = HashSet::new();
    for d in &datasets {
        if d.id.is_empty() || d.filter.trim().is_empty() {
            bail!("Dataset entries need id and filter ({})", path.display());
        }
        if d.id.contains('/') || d.id.contains('\\') {
            bail!("Dataset id '{}' must not contain path separators", d.id);
        }
        if !seen.insert(d.id.as_str()) {
            bail!("Duplicate dataset id '{}' in {}", d.id, path.display());
        }
    }

    Ok(datasets)
}

/// The union of all dataset filters, used to pre-filter the history file.
pub fn combined_filters(datasets: &[Dataset]) -> Vec<String> {
    let mut filters: Vec<String> = Vec::new();
    for d in datasets {
        if !filters.contains(&d.filter) {
            filters.push(d.filter.clone());
        }
    }
    filters
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read reference file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse reference file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_datasets_and_combine() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("datasets.json");
        std::fs::write(
            &path,
            r#"[
                {"id":"hospitals","filter":"nwr/amenity=hospital"},
                {"id":"clinics","filter":"nwr/amenity=clinic"},
                {"id":"health","filter":"nwr/amenity=hospital"}
            ]"#,
        )
        .unwrap();
        let datasets = load_datasets(&path).unwrap();
        assert_eq!(datasets.len(), 3);
        assert_eq!(
            combined_filters(&datasets),
            vec!["nwr/amenity=hospital".to_string(), "nwr/amenity=clinic".to_string()]
        );
    }

    #[test]
    fn test_duplicate_municipality_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("municipalities.json");
        std::fs::write(
            &path,
            r#"[
                {"id":"1","slug":"a","stateId":"SP"},
                {"id":"1","slug":"b","stateId":"SP"}
            ]"#,
        )
        .unwrap();
        let err = load_municipalities(&path).unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_dataset_id_with_separator_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("datasets.json");
        std::fs::write(&path, r#"[{"id":"../x","filter":"n/amenity"}]"#).unwrap();
        assert!(load_datasets(&path).is_err());
    }
}
