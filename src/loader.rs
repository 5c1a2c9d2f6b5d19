use ndarray::Array2;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::dataset::Dataset;

/// Disjoint, exhaustive train/validation row indices.
#[derive(Debug, Clone)]
pub struct Split {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
}

/// Randomly partition `0..total`; the validation side gets `floor(total * fraction)` rows.
pub fn split<R: Rng + ?Sized>(total: usize, fraction: f64, rng: &mut R) -> Split {
    let val_size = ((total as f64) * fraction).floor() as usize;
    let val_size = val_size.min(total);
    let mut indices: Vec<usize> = (0..total).collect();
    indices.shuffle(rng);
    let train = indices.split_off(val_size);
    Split {
        train,
        validation: indices,
    }
}

/// One mini-batch of `(feature, match, non_match)` rows.
#[derive(Debug, Clone)]
pub struct Batch {
    pub features: Array2<f32>,
    pub matches: Array2<f32>,
    pub non_matches: Array2<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.features.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Class index of each row's match label.
    pub fn match_classes(&self) -> Vec<usize> {
        self.matches
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                        if v > best.1 {
                            (i, v)
                        } else {
                            best
                        }
                    })
                    .0
            })
            .collect()
    }
}

/// Owns one subset of the dataset and hands out shuffled batches of it.
pub struct BatchLoader {
    subset: Dataset,
    batch_size: usize,
}

impl BatchLoader {
    pub fn new(dataset: &Dataset, indices: &[usize], batch_size: usize) -> Self {
        Self {
            subset: dataset.select(indices),
            batch_size: batch_size.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.subset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subset.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    /// A fresh shuffle of the subset, cut into batches. Only the last may be short.
    pub fn batches<R: Rng + ?Sized>(&self, rng: &mut R) -> Batches<'_> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        Batches {
            loader: self,
            order,
            pos: 0,
        }
    }
}

/// The train and validation loaders of one machine type.
pub struct Loaders {
    pub train: BatchLoader,
    pub validation: BatchLoader,
}

impl Loaders {
    pub fn new(dataset: &Dataset, split: &Split, batch_size: usize) -> Self {
        Self {
            train: BatchLoader::new(dataset, &split.train, batch_size),
            validation: BatchLoader::new(dataset, &split.validation, batch_size),
        }
    }
}

pub struct Batches<'a> {
    loader: &'a BatchLoader,
    order: Vec<usize>,
    pos: usize,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.pos >= self.order.len() {
            return None;
        }
        let end = (self.pos + self.loader.batch_size).min(self.order.len());
        let rows = self.loader.subset.select(&self.order[self.pos..end]);
        self.pos = end;
        Some(Batch {
            features: rows.features,
            matches: rows.matches,
            non_matches: rows.non_matches,
        })
    }
}
