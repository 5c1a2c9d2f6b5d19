use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{Config, Mode};
use crate::dataset::{assemble, machine_id_list, machine_type_dirs, machine_type_name};
use crate::error::Result;
use crate::loader::{split, Loaders};
use crate::metrics::JsonlMetrics;
use crate::model::Decoder;
use crate::plot::loss_plot;
use crate::train::{
    load_or_train_encoder, DecoderHistory, DecoderTrainer, EncoderStage, EncoderTrainer,
};

/// Output files of one machine type.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPaths {
    pub encoder: PathBuf,
    pub decoder: PathBuf,
    pub history_img: PathBuf,
}

impl RunPaths {
    pub fn new(model_dir: &Path, machine_type: &str) -> Self {
        Self {
            encoder: model_dir.join(format!("encoder_{machine_type}.npz")),
            decoder: model_dir.join(format!("decoder_{machine_type}.npz")),
            history_img: model_dir.join(format!("history_{machine_type}.png")),
        }
    }

    /// Both stages already have weights on disk.
    pub fn complete(&self) -> bool {
        self.encoder.exists() && self.decoder.exists()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeOutcome {
    /// Both weight files existed; nothing was read or written.
    Skipped,
    Trained {
        encoder: EncoderStage,
        decoder: DecoderHistory,
    },
}

/// Machine-type directories for the selected mode.
pub fn machine_types(config: &Config, mode: Mode) -> Result<Vec<PathBuf>> {
    let root = config.data_root(mode);
    log::info!("load_directory <- {}", root.display());
    machine_type_dirs(root)
}

/// Dataset build, encoder stage, then decoder stage for one machine type.
///
/// The type is skipped outright only when both weight files exist. Otherwise
/// an existing encoder file is reused and the decoder is always retrained.
pub fn process_machine_type(config: &Config, type_dir: &Path) -> Result<TypeOutcome> {
    let machine_type = machine_type_name(type_dir);
    let paths = RunPaths::new(&config.model_directory, &machine_type);
    if paths.complete() {
        log::info!("model exists for {machine_type}, skipping");
        return Ok(TypeOutcome::Skipped);
    }
    let train_param = config.train_param(&machine_type)?;
    fs::create_dir_all(&config.model_directory)?;
    let mut rng = StdRng::seed_from_u64(config.fit.seed);

    log::info!("============== DATASET_GENERATOR ==============");
    let ids = machine_id_list(type_dir, &config.files)?;
    log::info!("{machine_type}: machine ids {ids:?}");
    let dataset = assemble(type_dir, &ids, config, &mut rng)?;
    let (dims, classes) = (dataset.dims(), dataset.classes());
    let split = split(dataset.len(), config.fit.validation_split, &mut rng);
    let loaders = Loaders::new(&dataset, &split, config.fit.batch_size);
    drop(dataset);
    log::info!(
        "train samples: {}, validation samples: {}",
        loaders.train.len(),
        loaders.validation.len()
    );

    log::info!("============== MODEL TRAINING ==============");
    let mut metrics = JsonlMetrics::create(&config.metrics_directory, &machine_type)?;
    let mut encoder_trainer = EncoderTrainer::new(train_param.encoder.lr, config.fit.epochs);
    let (encoder, encoder_stage) = load_or_train_encoder(
        &paths.encoder,
        dims,
        classes,
        config.model,
        &mut encoder_trainer,
        &loaders,
        &mut rng,
        &mut metrics,
    )?;

    log::info!("Start Decoder training...");
    let mut decoder = Decoder::new(dims, classes, config.model, &mut rng);
    let mut decoder_trainer = DecoderTrainer::new(
        &encoder,
        &config.decoder,
        config.fit.batch_size,
        train_param.decoder.lr,
        train_param.decoder.gamma,
        config.fit.epochs,
    );
    let history = decoder_trainer.fit(&mut decoder, &loaders, &mut rng, &mut metrics)?;
    decoder.save(&paths.decoder)?;
    loss_plot(
        &history.loss.train_loss,
        &history.loss.val_loss,
        &paths.history_img,
    )?;
    log::info!(
        "save_model -> en: {} de: {}",
        paths.encoder.display(),
        paths.decoder.display()
    );
    log::info!("metrics -> {}", metrics.path().display());

    Ok(TypeOutcome::Trained {
        encoder: encoder_stage,
        decoder: history,
    })
}

/// Process every directory whose name equals `target` exactly.
///
/// Configuration problems end that machine type only; any other error ends
/// the run.
pub fn run(
    config: &Config,
    dirs: &[PathBuf],
    target: &str,
) -> Result<Vec<(String, TypeOutcome)>> {
    let mut done = Vec::new();
    for type_dir in dirs {
        let machine_type = machine_type_name(type_dir);
        if machine_type != target {
            continue;
        }
        log::info!("===========================");
        log::info!("{}", type_dir.display());
        match process_machine_type(config, type_dir) {
            Ok(outcome) => done.push((machine_type, outcome)),
            Err(e) if e.is_configuration() => {
                log::error!("{machine_type}: {e}; skipping this machine type");
            }
            Err(e) => return Err(e),
        }
    }
    if done.is_empty() {
        log::warn!("nothing processed for machine type {target:?}");
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DecoderLr, EncoderLr, TrainParam};
    use crate::dataset::tests::{test_config, write_machine};
    use crate::error::IdcaeError;
    use crate::metrics::ScalarRecord;

    fn with_params(mut config: Config, machine: &str) -> Config {
        config.train_param.insert(
            machine.to_string(),
            TrainParam {
                encoder: EncoderLr { lr: 0.001 },
                decoder: DecoderLr { lr: 0.001, gamma: 0.9 },
            },
        );
        config
    }

    #[test]
    fn paths_are_keyed_by_machine_type() {
        let paths = RunPaths::new(Path::new("model"), "fan");
        assert_eq!(paths.encoder, PathBuf::from("model/encoder_fan.npz"));
        assert_eq!(paths.decoder, PathBuf::from("model/decoder_fan.npz"));
        assert_eq!(paths.history_img, PathBuf::from("model/history_fan.png"));
    }

    #[test]
    fn trains_then_skips_on_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let type_dir = write_machine(dir.path(), "fan", &["id_00", "id_02", "id_04"], 2);
        let config = with_params(test_config(dir.path()), "fan");

        let outcome = process_machine_type(&config, &type_dir).unwrap();
        match &outcome {
            TypeOutcome::Trained { encoder, decoder } => {
                assert!(matches!(encoder, EncoderStage::Trained(h) if h.epochs() == 2));
                assert_eq!(decoder.loss.epochs(), 2);
            }
            TypeOutcome::Skipped => panic!("first run must train"),
        }
        let paths = RunPaths::new(&config.model_directory, "fan");
        assert!(paths.complete());
        assert!(paths.history_img.exists());

        let metrics_file = config.metrics_directory.join("metrics_fan.jsonl");
        let tags: Vec<String> = fs::read_to_string(&metrics_file)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<ScalarRecord>(l).unwrap().tag)
            .collect();
        assert!(tags.contains(&"en_train/loss".to_string()));
        assert!(tags.contains(&"bad_loss".to_string()));
        assert!(tags.contains(&"en_comp/loss".to_string()));
        assert!(tags.contains(&"de_comp/loss".to_string()));

        let stamp = |p: &Path| fs::metadata(p).unwrap().modified().unwrap();
        let before = (stamp(&paths.encoder), stamp(&paths.decoder), stamp(&metrics_file));
        let outcome = process_machine_type(&config, &type_dir).unwrap();
        assert_eq!(outcome, TypeOutcome::Skipped);
        assert_eq!(
            before,
            (stamp(&paths.encoder), stamp(&paths.decoder), stamp(&metrics_file))
        );
    }

    #[test]
    fn existing_encoder_is_reused_and_decoder_retrained() {
        let dir = tempfile::tempdir().unwrap();
        let type_dir = write_machine(dir.path(), "fan", &["id_00", "id_02"], 2);
        let config = with_params(test_config(dir.path()), "fan");
        process_machine_type(&config, &type_dir).unwrap();

        let paths = RunPaths::new(&config.model_directory, "fan");
        fs::remove_file(&paths.decoder).unwrap();
        let outcome = process_machine_type(&config, &type_dir).unwrap();
        assert!(matches!(
            outcome,
            TypeOutcome::Trained {
                encoder: EncoderStage::Loaded,
                ..
            }
        ));
        assert!(paths.decoder.exists());
    }

    #[test]
    fn missing_train_param_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let type_dir = write_machine(dir.path(), "pump", &["id_00", "id_02"], 1);
        let config = test_config(dir.path());
        let err = process_machine_type(&config, &type_dir).unwrap_err();
        assert!(matches!(err, IdcaeError::MissingTrainParam(_)));
        assert!(!config.model_directory.exists());
    }

    #[test]
    fn short_recordings_abort_the_machine_type() {
        let dir = tempfile::tempdir().unwrap();
        write_machine(dir.path(), "fan", &["id_00", "id_02"], 2);
        let mut config = with_params(test_config(dir.path()), "fan");
        // Each fixture clip yields 7 mel frames.
        config.feature.frames = 10;
        let dirs = machine_types(&config, Mode::Development).unwrap();

        let err = process_machine_type(&config, &dirs[0]).unwrap_err();
        assert!(matches!(err, IdcaeError::EmptyFeatures { frames: 10, .. }));
        let paths = RunPaths::new(&config.model_directory, "fan");
        assert!(!paths.encoder.exists());
        assert!(!paths.decoder.exists());

        assert!(run(&config, &dirs, "fan").unwrap().is_empty());
    }

    #[test]
    fn run_selects_exact_name_and_survives_configuration_errors() {
        let dir = tempfile::tempdir().unwrap();
        write_machine(dir.path(), "fan", &["id_00", "id_02"], 1);
        write_machine(dir.path(), "valve", &["id_00"], 1);
        let mut config = with_params(test_config(dir.path()), "fan");
        config = with_params(config, "valve");
        let dirs = machine_types(&config, Mode::Development).unwrap();
        assert_eq!(dirs.len(), 2);

        assert!(run(&config, &dirs, "Fan").unwrap().is_empty());
        assert!(!config.model_directory.exists());

        // valve has a single id, which is a configuration error.
        assert!(run(&config, &dirs, "valve").unwrap().is_empty());

        let done = run(&config, &dirs, "fan").unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].0, "fan");
    }
}
