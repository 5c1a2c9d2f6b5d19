use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use ndarray::{concatenate, Array2, Axis};
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use walkdir::WalkDir;

use crate::config::{Config, FileParams};
use crate::error::{IdcaeError, Result};
use crate::features::build_samples;

static MACHINE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"id_[0-9]+").expect("valid regex"));

/// Row-aligned features and one-hot labels for one machine type.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub features: Array2<f32>,
    pub matches: Array2<f32>,
    pub non_matches: Array2<f32>,
}

impl Dataset {
    pub fn new(
        features: Array2<f32>,
        matches: Array2<f32>,
        non_matches: Array2<f32>,
    ) -> Result<Self> {
        if features.nrows() != matches.nrows() || matches.dim() != non_matches.dim() {
            return Err(IdcaeError::Model(format!(
                "dataset parts disagree: features {:?}, matches {:?}, non-matches {:?}",
                features.dim(),
                matches.dim(),
                non_matches.dim()
            )));
        }
        Ok(Self {
            features,
            matches,
            non_matches,
        })
    }

    pub fn len(&self) -> usize {
        self.features.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dims(&self) -> usize {
        self.features.ncols()
    }

    pub fn classes(&self) -> usize {
        self.matches.ncols()
    }

    /// Append `other`'s rows after this dataset's rows.
    pub fn append(&mut self, other: &Dataset) -> Result<()> {
        self.features = concatenate(Axis(0), &[self.features.view(), other.features.view()])?;
        self.matches = concatenate(Axis(0), &[self.matches.view(), other.matches.view()])?;
        self.non_matches =
            concatenate(Axis(0), &[self.non_matches.view(), other.non_matches.view()])?;
        Ok(())
    }

    /// Copy out the rows at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Dataset {
        Dataset {
            features: self.features.select(Axis(0), indices),
            matches: self.matches.select(Axis(0), indices),
            non_matches: self.non_matches.select(Axis(0), indices),
        }
    }
}

/// Sorted machine-type directories directly under `root`.
pub fn machine_type_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_dir() {
            dirs.push(entry.into_path());
        }
    }
    Ok(dirs)
}

pub fn machine_type_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Files directly inside `dir`, sorted by name.
fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Machine ids (`id_00`, `id_02`, ...) found in `type_dir/dir_name`.
/// The position in the returned list is the id's class index.
pub fn machine_id_list(type_dir: &Path, files: &FileParams) -> Result<Vec<String>> {
    let dir = type_dir.join(&files.dir_name);
    let ids: BTreeSet<String> = list_files(&dir)?
        .iter()
        .filter(|p| has_extension(p, &files.ext))
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .filter_map(|name| MACHINE_ID.find(&name).map(|m| m.as_str().to_string()))
        .collect();
    Ok(ids.into_iter().collect())
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

/// Normal training files for one machine id, shuffled and capped at `cap`.
pub fn training_files<R: Rng + ?Sized>(
    type_dir: &Path,
    id: &str,
    files: &FileParams,
    cap: usize,
    rng: &mut R,
) -> Result<Vec<PathBuf>> {
    let dir = type_dir.join(&files.dir_name);
    let prefix = format!("{}_{}", files.prefix_normal, id);
    let mut matched: Vec<PathBuf> = list_files(&dir)?
        .into_iter()
        .filter(|p| has_extension(p, &files.ext))
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().starts_with(&prefix))
                .unwrap_or(false)
        })
        .collect();

    log::info!("target_dir : {}_{}", type_dir.display(), id);
    if matched.is_empty() {
        let pattern = format!("{}/{}*.{}", dir.display(), prefix, files.ext);
        log::error!("no audio files matched {pattern}");
        return Err(IdcaeError::NoAudioFiles { pattern });
    }
    matched.shuffle(rng);
    matched.truncate(cap);
    log::info!("train_file num : {}", matched.len());
    Ok(matched)
}

/// Build the labeled dataset for one machine type, one id block at a time in
/// class order.
pub fn assemble<R: Rng + ?Sized>(
    type_dir: &Path,
    ids: &[String],
    config: &Config,
    rng: &mut R,
) -> Result<Dataset> {
    if ids.len() < 2 {
        return Err(IdcaeError::TooFewIdentities { found: ids.len() });
    }
    let mut dataset: Option<Dataset> = None;
    for (cls_label, id) in ids.iter().enumerate() {
        let files = training_files(type_dir, id, &config.files, config.fit.max_files_per_id, rng)?;
        let block = build_samples(
            &files,
            cls_label,
            ids.len(),
            &config.feature,
            rng,
            &format!("generate train_dataset {id}"),
        )?;
        match dataset.as_mut() {
            Some(ds) => ds.append(&block)?,
            None => dataset = Some(block),
        }
    }
    let dataset = dataset.ok_or(IdcaeError::TooFewIdentities { found: 0 })?;
    log::info!(
        "assembled {} samples of width {} over {} ids",
        dataset.len(),
        dataset.dims(),
        dataset.classes()
    );
    Ok(dataset)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{FeatureParams, FitParams};
    use crate::features::tests::write_sine_wav;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    pub(crate) fn test_config(root: &Path) -> Config {
        Config {
            dev_directory: root.join("dev_data"),
            eval_directory: root.join("eval_data"),
            model_directory: root.join("model"),
            metrics_directory: root.join("runs"),
            feature: FeatureParams {
                n_mels: 8,
                frames: 2,
                n_fft: 256,
                hop_length: 128,
                power: 2.0,
                sample_rate: None,
            },
            fit: FitParams {
                epochs: 2,
                batch_size: 8,
                validation_split: 0.25,
                max_files_per_id: 2,
                seed: 3,
            },
            decoder: Default::default(),
            model: crate::config::ModelParams {
                hidden_dim: 12,
                latent_dim: 4,
            },
            files: Default::default(),
            train_param: BTreeMap::new(),
        }
    }

    /// `<root>/dev_data/<machine>/train/normal_id_XX_YYYYYYYY.wav` fixtures.
    pub(crate) fn write_machine(
        root: &Path,
        machine: &str,
        ids: &[&str],
        per_id: usize,
    ) -> PathBuf {
        let type_dir = root.join("dev_data").join(machine);
        let train = type_dir.join("train");
        std::fs::create_dir_all(&train).unwrap();
        for (k, id) in ids.iter().enumerate() {
            for n in 0..per_id {
                let path = train.join(format!("normal_{id}_{n:08}.wav"));
                write_sine_wav(&path, 200.0 + 150.0 * k as f32 + 10.0 * n as f32, 8_000, 0.1);
            }
        }
        type_dir
    }

    fn sample(rows: usize, offset: f32) -> Dataset {
        Dataset::new(
            Array2::from_elem((rows, 3), offset),
            Array2::zeros((rows, 2)),
            Array2::zeros((rows, 2)),
        )
        .unwrap()
    }

    #[test]
    fn append_and_select_keep_rows_aligned() {
        let mut ds = sample(2, 1.0);
        ds.append(&sample(3, 2.0)).unwrap();
        assert_eq!(ds.len(), 5);
        let picked = ds.select(&[4, 0]);
        assert_eq!(picked.features.column(0).to_vec(), vec![2.0, 1.0]);
        assert_eq!(picked.matches.nrows(), 2);
    }

    #[test]
    fn mismatched_parts_are_rejected() {
        let err = Dataset::new(Array2::zeros((2, 3)), Array2::zeros((3, 2)), Array2::zeros((3, 2)));
        assert!(err.is_err());
    }

    #[test]
    fn ids_are_sorted_and_unique() {
        let dir = tempfile::tempdir().unwrap();
        let type_dir = write_machine(dir.path(), "fan", &["id_04", "id_00", "id_02"], 2);
        std::fs::write(type_dir.join("train").join("notes.txt"), "id_09").unwrap();
        let ids = machine_id_list(&type_dir, &FileParams::default()).unwrap();
        assert_eq!(ids, vec!["id_00", "id_02", "id_04"]);
    }

    #[test]
    fn machine_types_are_directories() {
        let dir = tempfile::tempdir().unwrap();
        write_machine(dir.path(), "valve", &["id_00"], 1);
        write_machine(dir.path(), "fan", &["id_00"], 1);
        std::fs::write(dir.path().join("dev_data").join("readme.md"), "").unwrap();
        let dirs = machine_type_dirs(&dir.path().join("dev_data")).unwrap();
        let names: Vec<String> = dirs.iter().map(|d| machine_type_name(d)).collect();
        assert_eq!(names, vec!["fan", "valve"]);
    }

    #[test]
    fn training_files_are_capped_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let type_dir = write_machine(dir.path(), "fan", &["id_00", "id_02"], 4);
        let mut rng = StdRng::seed_from_u64(5);
        let files =
            training_files(&type_dir, "id_02", &FileParams::default(), 3, &mut rng).unwrap();
        assert_eq!(files.len(), 3);
        assert!(files
            .iter()
            .all(|f| f.file_name().unwrap().to_string_lossy().starts_with("normal_id_02")));
    }

    #[test]
    fn missing_id_files_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let type_dir = write_machine(dir.path(), "fan", &["id_00"], 1);
        let mut rng = StdRng::seed_from_u64(5);
        let err =
            training_files(&type_dir, "id_06", &FileParams::default(), 3, &mut rng).unwrap_err();
        assert!(matches!(err, IdcaeError::NoAudioFiles { .. }));
    }

    #[test]
    fn assemble_concatenates_in_id_order() {
        let dir = tempfile::tempdir().unwrap();
        let type_dir = write_machine(dir.path(), "fan", &["id_00", "id_02"], 3);
        let config = test_config(dir.path());
        let ids = machine_id_list(&type_dir, &config.files).unwrap();
        let mut rng = StdRng::seed_from_u64(config.fit.seed);
        let ds = assemble(&type_dir, &ids, &config, &mut rng).unwrap();

        assert_eq!(ds.classes(), 2);
        assert_eq!(ds.dims(), 16);
        let half = ds.len() / 2;
        assert!(ds.matches.column(0).iter().take(half).all(|&v| v == 1.0));
        assert!(ds.matches.column(1).iter().skip(half).all(|&v| v == 1.0));
        // Two ids: the non-match is always the other one.
        for (m, nm) in ds.matches.rows().into_iter().zip(ds.non_matches.rows()) {
            assert_eq!(m[0], nm[1]);
        }
    }

    #[test]
    fn single_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let type_dir = write_machine(dir.path(), "fan", &["id_00"], 1);
        let config = test_config(dir.path());
        let mut rng = StdRng::seed_from_u64(0);
        let err = assemble(&type_dir, &["id_00".to_string()], &config, &mut rng).unwrap_err();
        assert!(matches!(err, IdcaeError::TooFewIdentities { found: 1 }));
    }
}
