//! COCO dataset manifest: model, load, and atomic persist.

use std::collections::HashSet;
use std::path::Path;
use std::time::SystemTime;

use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use synthblend_core::annotation::{Category, CocoAnnotation};

use crate::atomic::write_atomic;
use crate::error::DatasetError;

/// Format used for `date_created` / `date_captured`.
const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// License id referenced by every image record.
pub const DEFAULT_LICENSE_ID: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Info {
    pub description: String,
    pub url: String,
    pub version: String,
    pub year: i32,
    pub contributor: String,
    pub date_created: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct License {
    pub url: String,
    pub id: u32,
    pub name: String,
}

/// One rendered image. Field order matches the exported schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub license: u32,
    pub file_name: String,
    pub height: u32,
    pub width: u32,
    pub date_captured: String,
    pub id: String,
}

impl ImageRecord {
    /// Record for a square render captured now.
    pub fn new(id: impl Into<String>, file_name: impl Into<String>, img_size: u32) -> Self {
        Self {
            license: DEFAULT_LICENSE_ID,
            file_name: file_name.into(),
            height: img_size,
            width: img_size,
            date_captured: Utc::now().format(DATE_FORMAT).to_string(),
            id: id.into(),
        }
    }
}

/// What one render job contributes to the dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub image: ImageRecord,
    pub annotation: CocoAnnotation,
}

/// The whole manifest.
///
/// Image ids are unique; every annotation's `image_id` refers to an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoDataset {
    pub info: Info,
    pub licenses: Vec<License>,
    pub images: Vec<ImageRecord>,
    pub annotations: Vec<CocoAnnotation>,
    pub categories: Vec<Category>,
}

impl CocoDataset {
    /// Empty dataset with the given categories.
    pub fn new(categories: Vec<Category>) -> Self {
        let now = Utc::now();
        Self {
            info: Info {
                description: "Synthetic object detection dataset".to_string(),
                url: String::new(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                year: now.year(),
                contributor: "synthblend".to_string(),
                date_created: now.format(DATE_FORMAT).to_string(),
            },
            licenses: vec![License {
                url: String::new(),
                id: DEFAULT_LICENSE_ID,
                name: "Synthetic".to_string(),
            }],
            images: Vec::new(),
            annotations: Vec::new(),
            categories,
        }
    }

    pub fn contains_image(&self, id: &str) -> bool {
        self.images.iter().any(|i| i.id == id)
    }

    pub fn image_ids(&self) -> HashSet<String> {
        self.images.iter().map(|i| i.id.clone()).collect()
    }

    /// First job index after every numeric image id, or 0 when empty.
    pub fn next_free_index(&self) -> u64 {
        self.images
            .iter()
            .filter_map(|i| i.id.parse::<u64>().ok())
            .max()
            .map_or(0, |max| max + 1)
    }

    /// Add a category for every name in `catalog` the dataset lacks.
    ///
    /// Existing ids are never renumbered; new categories get ids after the
    /// highest one in use, in `catalog` order. Returns how many were added.
    pub fn reconcile_categories(&mut self, catalog: &[Category]) -> usize {
        let mut next_id = self.categories.iter().map(|c| c.id + 1).max().unwrap_or(0);
        let mut added = 0;
        for category in catalog {
            if self.categories.iter().any(|c| c.name == category.name) {
                continue;
            }
            self.categories.push(Category {
                id: next_id,
                ..category.clone()
            });
            next_id += 1;
            added += 1;
        }
        added
    }

    /// Add one image and its annotation. Rejects a duplicate image id.
    pub fn append(&mut self, entry: DatasetEntry) -> Result<(), DatasetError> {
        if self.contains_image(&entry.image.id) {
            return Err(DatasetError::DuplicateImage(entry.image.id));
        }
        self.images.push(entry.image);
        self.annotations.push(entry.annotation);
        Ok(())
    }

    /// Copy in every image (with its annotations) from `other` whose id is
    /// not already present. Returns how many images were added.
    pub fn merge_from(&mut self, other: &CocoDataset) -> usize {
        let mut known: HashSet<String> = self.images.iter().map(|i| i.id.clone()).collect();
        let mut added = 0;
        for image in &other.images {
            if !known.insert(image.id.clone()) {
                continue;
            }
            self.images.push(image.clone());
            self.annotations.extend(
                other
                    .annotations
                    .iter()
                    .filter(|a| a.image_id == image.id)
                    .cloned(),
            );
            added += 1;
        }
        added
    }

    /// Sort images and annotations by id for a stable on-disk order.
    pub fn sort(&mut self) {
        self.images.sort_by(|a, b| a.id.cmp(&b.id));
        self.annotations.sort_by(|a, b| a.id.cmp(&b.id));
    }
}

/// Load the manifest at `path`, or start an empty one with `categories`.
///
/// Category ids are never renumbered: an existing manifest keeps its own
/// categories, and names it does not know yet are appended with fresh ids.
pub async fn load_or_create(
    path: &Path,
    categories: Vec<Category>,
) -> Result<CocoDataset, DatasetError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "Creating new dataset manifest");
            return Ok(CocoDataset::new(categories));
        }
        Err(e) => return Err(DatasetError::io(path)(e)),
    };

    let mut dataset: CocoDataset =
        serde_json::from_slice(&bytes).map_err(|source| DatasetError::Json {
            path: path.to_path_buf(),
            source,
        })?;

    let added = dataset.reconcile_categories(&categories);
    if added > 0 {
        tracing::info!(
            path = %path.display(),
            added,
            total = dataset.categories.len(),
            "Added new categories to the manifest",
        );
    }

    tracing::debug!(
        path = %path.display(),
        images = dataset.images.len(),
        "Loaded dataset manifest",
    );
    Ok(dataset)
}

/// Size and modification time of a manifest file, used to notice writes
/// made by someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

/// Fingerprint of `path`, or `None` if it does not exist.
pub async fn fingerprint(path: &Path) -> Result<Option<Fingerprint>, DatasetError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(Fingerprint {
            len: meta.len(),
            modified: meta.modified().ok(),
        })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(DatasetError::io(path)(e)),
    }
}

/// Atomically write `dataset` to `path` and return the new fingerprint.
pub async fn persist(dataset: &CocoDataset, path: &Path) -> Result<Option<Fingerprint>, DatasetError> {
    let bytes = serde_json::to_vec_pretty(dataset).map_err(|source| DatasetError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes).await?;
    fingerprint(path).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::test_helpers::entry;

    fn categories() -> Vec<Category> {
        vec![Category {
            supercategory: "object".into(),
            id: 0,
            name: "crate".into(),
        }]
    }

    #[test]
    fn append_rejects_duplicate_ids() {
        let mut dataset = CocoDataset::new(categories());
        dataset.append(entry("00001")).expect("first append");
        assert_matches!(
            dataset.append(entry("00001")),
            Err(DatasetError::DuplicateImage(id)) if id == "00001"
        );
        assert_eq!(dataset.images.len(), 1);
        assert_eq!(dataset.annotations.len(), 1);
    }

    #[test]
    fn merge_skips_known_ids() {
        let mut a = CocoDataset::new(categories());
        a.append(entry("00001")).unwrap();
        let mut b = CocoDataset::new(categories());
        b.append(entry("00001")).unwrap();
        b.append(entry("00002")).unwrap();

        assert_eq!(a.merge_from(&b), 1);
        assert_eq!(a.images.len(), 2);
        assert_eq!(a.annotations.len(), 2);
    }

    #[test]
    fn serialized_schema_has_expected_keys() {
        let mut dataset = CocoDataset::new(categories());
        dataset.append(entry("00003")).unwrap();
        let json = serde_json::to_value(&dataset).expect("serialize");
        for key in ["info", "licenses", "images", "annotations", "categories"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        let image = &json["images"][0];
        for key in ["license", "file_name", "height", "width", "date_captured", "id"] {
            assert!(image.get(key).is_some(), "image missing {key}");
        }
        let ann = &json["annotations"][0];
        for key in ["segmentation", "area", "iscrowd", "image_id", "bbox", "category_id", "id"] {
            assert!(ann.get(key).is_some(), "annotation missing {key}");
        }
        assert_eq!(json["categories"][0]["supercategory"], "object");
    }

    #[tokio::test]
    async fn load_missing_creates_and_persist_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("renders/coco.json");

        let mut dataset = load_or_create(&path, categories()).await.expect("create");
        assert!(dataset.images.is_empty());
        dataset.append(entry("00000")).unwrap();

        let fp = persist(&dataset, &path).await.expect("persist");
        assert!(fp.is_some());
        let reloaded = load_or_create(&path, categories()).await.expect("reload");
        assert_eq!(reloaded, dataset);
    }

    fn category(id: usize, name: &str) -> Category {
        Category {
            supercategory: "object".into(),
            id,
            name: name.into(),
        }
    }

    #[tokio::test]
    async fn existing_category_ids_survive_a_new_catalog() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("coco.json");
        persist(&CocoDataset::new(categories()), &path).await.expect("persist");

        // The catalog now sorts "barrel" before "crate".
        let catalog = vec![category(0, "barrel"), category(1, "crate")];
        let dataset = load_or_create(&path, catalog.clone()).await.expect("load");
        assert_eq!(dataset.categories, vec![category(0, "crate"), category(1, "barrel")]);

        let mut again = dataset.clone();
        assert_eq!(again.reconcile_categories(&catalog), 0);
        assert_eq!(again.categories, dataset.categories);
    }

    #[test]
    fn next_free_index_follows_highest_id() {
        let mut dataset = CocoDataset::new(categories());
        assert_eq!(dataset.next_free_index(), 0);
        dataset.append(entry("00007")).unwrap();
        dataset.append(entry("00002")).unwrap();
        assert_eq!(dataset.next_free_index(), 8);
        assert!(dataset.image_ids().contains("00002"));
    }

    #[tokio::test]
    async fn malformed_manifest_is_json_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("coco.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert_matches!(
            load_or_create(&path, categories()).await,
            Err(DatasetError::Json { .. })
        );
    }

    #[tokio::test]
    async fn fingerprint_of_missing_file_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(fingerprint(&dir.path().join("nope.json")).await.unwrap().is_none());
    }
}
