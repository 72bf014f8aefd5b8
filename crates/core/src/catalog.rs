//! Asset catalog: models, their texture variants, and background images.
//!
//! The catalog is built once per batch by scanning the models and
//! backgrounds directories. Texture availability is resolved at build time
//! into [`AssetKind`], so jobs never probe the filesystem for it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rand::seq::IndexedRandom;
use rand::Rng;
use serde::Serialize;

use crate::annotation::Category;
use crate::config::SelectionPolicy;
use crate::types::JobIndex;

/// Mesh file extensions the renderer can import.
pub const MESH_EXTENSIONS: &[&str] = &["dae", "obj", "fbx", "glb", "gltf", "blend"];

/// Image extensions accepted for textures and backgrounds.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Supercategory written for every model category.
const SUPERCATEGORY: &str = "object";

/// Catalog-domain error type.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("No eligible model files found in {}", dir.display())]
    AssetNotFound { dir: PathBuf },

    #[error("Model '{model_id}' has no texture; it will render untextured")]
    MeshNotFound { model_id: String },

    #[error("Model '{model_id}' has no category in the dataset")]
    UnknownCategory { model_id: String },

    #[error("I/O error scanning {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Texture availability for a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "textures", rename_all = "snake_case")]
pub enum AssetKind {
    /// Ordered, non-empty list of texture variants.
    Textured(Vec<PathBuf>),
    Untextured,
}

/// A model available for rendering. Immutable once the catalog is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Asset {
    pub id: String,
    pub model_path: PathBuf,
    pub kind: AssetKind,
    /// COCO category id. Starts as the position in the sorted catalog and
    /// is replaced by the dataset's id for the same name, see
    /// [`AssetCatalog::assign_categories`].
    pub category_index: usize,
}

impl Asset {
    /// Texture variants, empty for untextured models.
    pub fn textures(&self) -> &[PathBuf] {
        match &self.kind {
            AssetKind::Textured(textures) => textures,
            AssetKind::Untextured => &[],
        }
    }
}

/// Indexed set of models and backgrounds.
#[derive(Debug, Clone)]
pub struct AssetCatalog {
    models: Vec<Asset>,
    backgrounds: Vec<PathBuf>,
}

impl AssetCatalog {
    /// Scan `models_dir` and `backgrounds_dir`.
    ///
    /// Two model layouts are recognized: `models/<id>/<mesh>` with textures
    /// beside the mesh, and `models/<id>.<ext>` with textures in
    /// `models/<id>/`. Fails with [`CatalogError::AssetNotFound`] when no
    /// model is found. A missing backgrounds directory yields an empty list.
    pub fn build(models_dir: &Path, backgrounds_dir: &Path) -> Result<Self, CatalogError> {
        if !models_dir.is_dir() {
            return Err(CatalogError::AssetNotFound {
                dir: models_dir.to_path_buf(),
            });
        }

        let mut found: BTreeMap<String, (PathBuf, Vec<PathBuf>)> = BTreeMap::new();
        for path in sorted_entries(models_dir)? {
            let discovered = if path.is_dir() {
                let files = sorted_entries(&path)?;
                files
                    .iter()
                    .find(|f| has_extension(f, MESH_EXTENSIONS))
                    .cloned()
                    .map(|mesh| (file_name(&path), mesh, filter_images(files)))
            } else if has_extension(&path, MESH_EXTENSIONS) {
                let id = file_stem(&path);
                let texture_dir = models_dir.join(&id);
                let textures = if texture_dir.is_dir() {
                    filter_images(sorted_entries(&texture_dir)?)
                } else {
                    Vec::new()
                };
                Some((id, path, textures))
            } else {
                None
            };

            if let Some((id, mesh, textures)) = discovered {
                if found.contains_key(&id) {
                    tracing::warn!(model_id = %id, path = %mesh.display(), "Duplicate model id, keeping first");
                    continue;
                }
                found.insert(id, (mesh, textures));
            }
        }

        if found.is_empty() {
            return Err(CatalogError::AssetNotFound {
                dir: models_dir.to_path_buf(),
            });
        }

        let models: Vec<Asset> = found
            .into_iter()
            .enumerate()
            .map(|(category_index, (id, (model_path, textures)))| {
                let kind = if textures.is_empty() {
                    let warning = CatalogError::MeshNotFound {
                        model_id: id.clone(),
                    };
                    tracing::warn!(model_id = %id, "{warning}");
                    AssetKind::Untextured
                } else {
                    AssetKind::Textured(textures)
                };
                Asset {
                    id,
                    model_path,
                    kind,
                    category_index,
                }
            })
            .collect();

        let backgrounds = if backgrounds_dir.is_dir() {
            filter_images(sorted_entries(backgrounds_dir)?)
        } else {
            tracing::warn!(dir = %backgrounds_dir.display(), "Backgrounds directory not found");
            Vec::new()
        };

        tracing::info!(
            models = models.len(),
            backgrounds = backgrounds.len(),
            "Asset catalog built",
        );

        Ok(Self {
            models,
            backgrounds,
        })
    }

    /// Build a catalog from already-resolved assets. Category indices are
    /// reassigned from the slice order.
    pub fn from_parts(models: Vec<Asset>, backgrounds: Vec<PathBuf>) -> Result<Self, CatalogError> {
        if models.is_empty() {
            return Err(CatalogError::AssetNotFound {
                dir: PathBuf::new(),
            });
        }
        let models = models
            .into_iter()
            .enumerate()
            .map(|(category_index, asset)| Asset {
                category_index,
                ..asset
            })
            .collect();
        Ok(Self {
            models,
            backgrounds,
        })
    }

    /// Model ids in catalog order.
    pub fn list_models(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.id.as_str()).collect()
    }

    pub fn models(&self) -> &[Asset] {
        &self.models
    }

    pub fn backgrounds(&self) -> &[PathBuf] {
        &self.backgrounds
    }

    /// Pick the model for a job.
    pub fn select_model<R: Rng>(
        &self,
        policy: SelectionPolicy,
        job_index: JobIndex,
        rng: &mut R,
    ) -> &Asset {
        match policy {
            SelectionPolicy::Index => &self.models[(job_index % self.models.len() as u64) as usize],
            SelectionPolicy::Random => &self.models[rng.random_range(0..self.models.len())],
        }
    }

    /// Pick a texture variant for `asset`, or `None` if it is untextured.
    ///
    /// The index policy walks the variants once per full pass over the
    /// models, so consecutive passes cycle through textures.
    pub fn select_texture<'a, R: Rng>(
        &self,
        asset: &'a Asset,
        policy: SelectionPolicy,
        job_index: JobIndex,
        rng: &mut R,
    ) -> Option<&'a Path> {
        let textures = asset.textures();
        if textures.is_empty() {
            return None;
        }
        let chosen = match policy {
            SelectionPolicy::Index => {
                let pass = job_index / self.models.len() as u64;
                &textures[(pass % textures.len() as u64) as usize]
            }
            SelectionPolicy::Random => textures.choose(rng)?,
        };
        Some(chosen.as_path())
    }

    /// Uniformly random background, or `None` if there are none.
    pub fn select_background<R: Rng>(&self, rng: &mut R) -> Option<&Path> {
        self.backgrounds.choose(rng).map(PathBuf::as_path)
    }

    /// Take each model's category id from `categories`, matched by name.
    ///
    /// An existing dataset fixes its ids for good, so a model keeps its id
    /// even when other models are added or removed.
    pub fn assign_categories(&mut self, categories: &[Category]) -> Result<(), CatalogError> {
        for model in &mut self.models {
            let category = categories
                .iter()
                .find(|c| c.name == model.id)
                .ok_or_else(|| CatalogError::UnknownCategory {
                    model_id: model.id.clone(),
                })?;
            model.category_index = category.id;
        }
        Ok(())
    }

    /// COCO categories, one per model, ids equal to `category_index`.
    pub fn categories(&self) -> Vec<Category> {
        self.models
            .iter()
            .map(|m| Category {
                supercategory: SUPERCATEGORY.to_string(),
                id: m.category_index,
                name: m.id.clone(),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, CatalogError> {
    let io_err = |source| CatalogError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = std::fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;
    paths.sort();
    Ok(paths)
}

/// Case-insensitive extension check.
pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

fn filter_images(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths
        .into_iter()
        .filter(|p| p.is_file() && has_extension(p, IMAGE_EXTENSIONS))
        .collect()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::fs;

    use assert_matches::assert_matches;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create dirs");
        }
        fs::write(path, b"x").expect("write file");
    }

    /// Five nested models (`m0`..`m4`); `m2` has no texture.
    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        for i in 0..5 {
            touch(&dir.path().join(format!("models/m{i}/model.dae")));
            if i != 2 {
                touch(&dir.path().join(format!("models/m{i}/texture_a.png")));
                touch(&dir.path().join(format!("models/m{i}/texture_b.jpg")));
            }
        }
        touch(&dir.path().join("backgrounds/sky.jpg"));
        touch(&dir.path().join("backgrounds/notes.txt"));
        dir
    }

    fn build(dir: &tempfile::TempDir) -> AssetCatalog {
        AssetCatalog::build(&dir.path().join("models"), &dir.path().join("backgrounds"))
            .expect("catalog builds")
    }

    #[test]
    fn nested_layout_is_indexed_in_order() {
        let dir = fixture();
        let catalog = build(&dir);
        assert_eq!(catalog.list_models(), vec!["m0", "m1", "m2", "m3", "m4"]);
        assert_eq!(catalog.models()[3].category_index, 3);
        assert_eq!(catalog.backgrounds().len(), 1);
    }

    #[test]
    fn missing_texture_resolves_untextured() {
        let dir = fixture();
        let catalog = build(&dir);
        assert_eq!(catalog.models()[2].kind, AssetKind::Untextured);
        assert_eq!(catalog.models()[1].textures().len(), 2);
    }

    #[test]
    fn flat_layout_picks_up_texture_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("models/crate.dae"));
        touch(&dir.path().join("models/crate/wood.png"));
        let catalog =
            AssetCatalog::build(&dir.path().join("models"), &dir.path().join("bg")).expect("build");
        assert_eq!(catalog.list_models(), vec!["crate"]);
        assert_eq!(catalog.models()[0].textures().len(), 1);
        assert!(catalog.backgrounds().is_empty());
    }

    #[test]
    fn empty_models_dir_is_asset_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("models")).expect("mkdir");
        touch(&dir.path().join("models/readme.md"));
        let result = AssetCatalog::build(&dir.path().join("models"), dir.path());
        assert_matches!(result, Err(CatalogError::AssetNotFound { .. }));
    }

    #[test]
    fn missing_models_dir_is_asset_not_found() {
        let result = AssetCatalog::build(Path::new("/nonexistent/models"), Path::new("/nonexistent"));
        assert_matches!(result, Err(CatalogError::AssetNotFound { .. }));
    }

    #[test]
    fn index_policy_selects_job_mod_len() {
        let dir = fixture();
        let catalog = build(&dir);
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(catalog.select_model(SelectionPolicy::Index, 3, &mut rng).id, "m3");
        assert_eq!(catalog.select_model(SelectionPolicy::Index, 8, &mut rng).id, "m3");
    }

    #[test]
    fn index_policy_cycles_textures_per_pass() {
        let dir = fixture();
        let catalog = build(&dir);
        let mut rng = StdRng::seed_from_u64(0);
        let asset = &catalog.models()[1];
        let first = catalog.select_texture(asset, SelectionPolicy::Index, 1, &mut rng);
        let second = catalog.select_texture(asset, SelectionPolicy::Index, 6, &mut rng);
        assert_ne!(first, second);
        let untextured = &catalog.models()[2];
        assert!(catalog
            .select_texture(untextured, SelectionPolicy::Random, 2, &mut rng)
            .is_none());
    }

    #[test]
    fn random_policy_is_reproducible_for_a_seed() {
        let dir = fixture();
        let catalog = build(&dir);
        let pick = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            catalog.select_model(SelectionPolicy::Random, 0, &mut rng).id.clone()
        };
        assert_eq!(pick(11), pick(11));
    }

    #[test]
    fn assigned_categories_match_by_name() {
        let dir = fixture();
        let mut catalog = build(&dir);
        // m3 was the first model ever seen; the rest came later.
        let mut existing: Vec<Category> = catalog.categories();
        existing.rotate_left(3);
        for (id, category) in existing.iter_mut().enumerate() {
            category.id = id;
        }

        catalog.assign_categories(&existing).expect("all names known");
        let ids: Vec<_> = catalog.models().iter().map(|m| (m.id.as_str(), m.category_index)).collect();
        assert_eq!(ids, vec![("m0", 2), ("m1", 3), ("m2", 4), ("m3", 0), ("m4", 1)]);
        assert_eq!(catalog.categories()[3].id, 0);

        assert_matches!(
            catalog.assign_categories(&existing[..2]),
            Err(CatalogError::UnknownCategory { model_id }) if model_id == "m0"
        );
    }

    #[test]
    fn categories_follow_catalog_order() {
        let dir = fixture();
        let categories = build(&dir).categories();
        assert_eq!(categories.len(), 5);
        assert_eq!(categories[4].id, 4);
        assert_eq!(categories[4].name, "m4");
        assert_eq!(categories[0].supercategory, "object");
    }
}
