use std::fs::File;
use std::path::{Path, PathBuf};

use hound::SampleFormat;
use indicatif::{ProgressBar, ProgressStyle};
use mel_filter::{mel, NormalizationFactor};
use minimp3::{Decoder, Error as Mp3Error, Frame};
use ndarray::{concatenate, s, Array2, ArrayView2, Axis};
use rand::Rng;
use rayon::prelude::*;
use rubato::{FftFixedInOut, Resampler};
use rustfft::{num_complex::Complex, FftPlanner};

use crate::config::FeatureParams;
use crate::dataset::Dataset;
use crate::error::{IdcaeError, Result};

const RESAMPLE_CHUNK: usize = 1024;

/// Average interleaved channels down to one.
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Load a WAV file as mono samples in [-1, 1] along with its sample rate.
pub fn load_wav_samples(path: &Path) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()?
        }
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()?,
    };
    Ok((downmix(&interleaved, spec.channels as usize), spec.sample_rate))
}

/// Decode an MP3 file with `minimp3`.
pub fn load_mp3_samples(path: &Path) -> Result<(Vec<f32>, u32)> {
    let mut decoder = Decoder::new(File::open(path)?);
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;
    loop {
        match decoder.next_frame() {
            Ok(Frame {
                data,
                sample_rate: sr,
                channels,
                ..
            }) => {
                if sample_rate == 0 {
                    sample_rate = sr as u32;
                }
                let frame: Vec<f32> = data.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
                samples.extend(downmix(&frame, channels));
            }
            Err(Mp3Error::Eof) => break,
            Err(e) => return Err(IdcaeError::Audio(format!("{}: {e}", path.display()))),
        }
    }
    if sample_rate == 0 {
        return Err(IdcaeError::Audio(format!(
            "{}: no frames decoded",
            path.display()
        )));
    }
    Ok((samples, sample_rate))
}

/// Load audio by extension. Resamples when `target_rate` is set and differs.
pub fn load_audio(path: &Path, target_rate: Option<u32>) -> Result<(Vec<f32>, u32)> {
    let is_mp3 = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("mp3"))
        .unwrap_or(false);
    let (samples, sr) = if is_mp3 {
        load_mp3_samples(path)?
    } else {
        load_wav_samples(path)?
    };
    match target_rate {
        Some(rate) if rate != sr => Ok((resample(&samples, sr, rate)?, rate)),
        _ => Ok((samples, sr)),
    }
}

/// Resample mono samples with rubato, zero-padding the final chunk.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let mut resampler =
        FftFixedInOut::<f32>::new(from_rate as usize, to_rate as usize, RESAMPLE_CHUNK, 1)
            .map_err(|e| IdcaeError::Audio(e.to_string()))?;
    let expected = (samples.len() as f64 * to_rate as f64 / from_rate as f64).round() as usize;
    let mut result = Vec::with_capacity(expected + RESAMPLE_CHUNK);
    let mut pos = 0;
    while pos < samples.len() {
        let need = resampler.input_frames_next();
        let end = (pos + need).min(samples.len());
        let mut chunk = samples[pos..end].to_vec();
        chunk.resize(need, 0.0);
        let input = vec![chunk];
        let output = resampler
            .process(&input, None)
            .map_err(|e| IdcaeError::Audio(e.to_string()))?;
        result.extend_from_slice(&output[0]);
        pos = end;
    }
    result.truncate(expected);
    Ok(result)
}

/// Mirror `pad` samples onto each end, excluding the edge sample itself.
/// Signals too short to reflect are zero-padded instead.
fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(samples.len() + 2 * pad);
    if samples.len() > pad {
        out.extend(samples[1..=pad].iter().rev());
        out.extend_from_slice(samples);
        let n = samples.len();
        out.extend(samples[n - 1 - pad..n - 1].iter().rev());
    } else {
        out.resize(pad, 0.0);
        out.extend_from_slice(samples);
        out.resize(samples.len() + 2 * pad, 0.0);
    }
    out
}

fn hann_window(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / len as f32).cos())
        .collect()
}

/// Centered STFT → mel filterbank → decibels. Output is `(n_frames, n_mels)`.
pub fn log_mel_spectrogram(
    samples: &[f32],
    sample_rate: u32,
    params: &FeatureParams,
) -> Array2<f32> {
    let n_fft = params.n_fft;
    let padded = reflect_pad(samples, n_fft / 2);
    if padded.len() < n_fft {
        return Array2::zeros((0, params.n_mels));
    }
    let n_frames = 1 + (padded.len() - n_fft) / params.hop_length;

    let mel_filters = mel::<f32>(
        sample_rate as usize,
        n_fft,
        Some(params.n_mels),
        None,
        None,
        false,
        NormalizationFactor::One,
    );
    let window = hann_window(n_fft);
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(n_fft);
    let mut buffer = vec![Complex::<f32>::new(0.0, 0.0); n_fft];
    let half_power = params.power / 2.0;
    let db_scale = 20.0 / params.power;

    let mut log_mel = Array2::<f32>::zeros((n_frames, params.n_mels));
    for (frame_idx, mut row) in log_mel.rows_mut().into_iter().enumerate() {
        let start = frame_idx * params.hop_length;
        for (i, (&val, &w)) in padded[start..start + n_fft].iter().zip(&window).enumerate() {
            buffer[i] = Complex::new(val * w, 0.0);
        }
        fft.process(&mut buffer);
        let spectrum: Vec<f32> = buffer
            .iter()
            .take(n_fft / 2 + 1)
            .map(|c| c.norm_sqr().powf(half_power))
            .collect();

        for (band, filt) in mel_filters.iter().enumerate() {
            let energy: f32 = filt.iter().zip(&spectrum).map(|(w, p)| w * p).sum();
            row[band] = db_scale * (energy + f32::EPSILON).log10();
        }
    }
    log_mel
}

/// Concatenate `frames` consecutive mel frames into one row.
/// Column block `t` of row `i` holds mel frame `i + t`.
pub fn stack_frames(log_mel: ArrayView2<f32>, frames: usize) -> Array2<f32> {
    let (n_frames, n_mels) = log_mel.dim();
    if n_frames < frames {
        return Array2::zeros((0, n_mels * frames));
    }
    let rows = n_frames - frames + 1;
    let mut vectors = Array2::<f32>::zeros((rows, n_mels * frames));
    for t in 0..frames {
        vectors
            .slice_mut(s![.., n_mels * t..n_mels * (t + 1)])
            .assign(&log_mel.slice(s![t..t + rows, ..]));
    }
    vectors
}

/// Feature rows for a single audio file.
pub fn file_to_vectors(path: &Path, params: &FeatureParams) -> Result<Array2<f32>> {
    let (samples, sr) = load_audio(path, params.sample_rate)?;
    let log_mel = log_mel_spectrogram(&samples, sr, params);
    Ok(stack_frames(log_mel.view(), params.frames))
}

/// One-hot match labels at `cls_label` and non-match labels drawn uniformly
/// from the other `cls_num - 1` classes, independently per row.
pub fn synthesize_labels<R: Rng + ?Sized>(
    rows: usize,
    cls_label: usize,
    cls_num: usize,
    rng: &mut R,
) -> Result<(Array2<f32>, Array2<f32>)> {
    if cls_num < 2 {
        return Err(IdcaeError::TooFewIdentities { found: cls_num });
    }
    if cls_label >= cls_num {
        return Err(IdcaeError::LabelOutOfRange {
            label: cls_label,
            classes: cls_num,
        });
    }
    let mut matches = Array2::<f32>::zeros((rows, cls_num));
    let mut non_matches = Array2::<f32>::zeros((rows, cls_num));
    for i in 0..rows {
        matches[[i, cls_label]] = 1.0;
        let mut other = rng.gen_range(0..cls_num - 1);
        if other >= cls_label {
            other += 1;
        }
        non_matches[[i, other]] = 1.0;
    }
    Ok((matches, non_matches))
}

/// Turn one identity's file list into labeled samples.
pub fn build_samples<R: Rng + ?Sized>(
    files: &[PathBuf],
    cls_label: usize,
    cls_num: usize,
    params: &FeatureParams,
    rng: &mut R,
    msg: &str,
) -> Result<Dataset> {
    if files.is_empty() {
        return Err(IdcaeError::NoAudioFiles {
            pattern: format!("<file list for class {cls_label}>"),
        });
    }

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} {bar:40} {pos}/{len} ETA {eta}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb.set_message(msg.to_string());

    // Extraction is per-file and order-preserving, so it can fan out.
    let blocks: Vec<Array2<f32>> = files
        .par_iter()
        .map(|path| {
            let vectors = file_to_vectors(path, params);
            pb.inc(1);
            vectors
        })
        .collect::<Result<_>>()?;
    pb.finish_and_clear();

    let views: Vec<ArrayView2<f32>> = blocks.iter().map(|b| b.view()).collect();
    let features = concatenate(Axis(0), &views)?;
    drop(blocks);
    if features.nrows() == 0 {
        log::error!("{msg}: no file is long enough for {} stacked frames", params.frames);
        return Err(IdcaeError::EmptyFeatures {
            files: files.len(),
            frames: params.frames,
        });
    }

    let (matches, non_matches) = synthesize_labels(features.nrows(), cls_label, cls_num, rng)?;
    Dataset::new(features, matches, non_matches)
}
