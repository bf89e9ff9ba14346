//! Composer-stratified batch assembly.
//!
//! Windows from the whole corpus are pooled per composer, shuffled with a
//! seeded RNG, and interleaved by largest-remainder credit so that any prefix
//! of the epoch carries each composer's windows in proportion to its catalog
//! share (within one batch). A composer whose catalog runs dry is
//! under-filled, never oversampled.

use super::sequence::{Composer, TokenSequence};
use super::window::{Window, Windower};
use crate::error::{Error, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::collections::VecDeque;

/// One training batch: parallel arrays over `batch_size` rows, right-padded
/// to the longest window with the model's pad token.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Token IDs, `batch_size x seq_len` flattened.
    pub token_ids: Vec<u32>,
    /// True for real positions, false for padding.
    pub attention_mask: Vec<bool>,
    /// Source composer per row.
    pub composers: Vec<Composer>,
    /// Real (unpadded) length per row.
    pub lengths: Vec<usize>,
    /// Number of rows.
    pub batch_size: usize,
    /// Padded row length.
    pub seq_len: usize,
}

impl Batch {
    /// Token row `i` (padded).
    pub fn tokens(&self, i: usize) -> &[u32] {
        &self.token_ids[i * self.seq_len..(i + 1) * self.seq_len]
    }

    /// Mask row `i`.
    pub fn mask(&self, i: usize) -> &[bool] {
        &self.attention_mask[i * self.seq_len..(i + 1) * self.seq_len]
    }

    /// Total real tokens in the batch.
    pub fn num_real_tokens(&self) -> usize {
        self.lengths.iter().sum()
    }
}

/// A window tagged with its source sequence's composer.
#[derive(Debug, Clone)]
pub struct TaggedWindow {
    pub window: Window,
    pub composer: Composer,
}

/// Stratified batch assembler over one epoch's window pool.
#[derive(Debug)]
pub struct BatchAssembler {
    queue: VecDeque<TaggedWindow>,
    batch_size: usize,
    pad_id: u32,
}

impl BatchAssembler {
    /// Window the corpus and build the epoch's stratified emission order.
    ///
    /// `seed` fixes both the per-composer shuffles and, therefore, the whole
    /// epoch: identical inputs and seed replay identical batches.
    pub fn new(
        corpus: &[TokenSequence],
        max_seq_len: usize,
        overlap: usize,
        batch_size: usize,
        pad_id: u32,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be positive".into()));
        }

        let mut pools: BTreeMap<Composer, Vec<Window>> = BTreeMap::new();
        for sequence in corpus {
            if sequence.is_empty() {
                continue;
            }
            let windows = Windower::new(sequence, max_seq_len, overlap)?;
            pools.entry(sequence.composer()).or_default().extend(windows);
        }

        let mut rng = StdRng::seed_from_u64(seed);
        for pool in pools.values_mut() {
            pool.shuffle(&mut rng);
            // Pop from the back below; reverse so shuffled order is kept.
            pool.reverse();
        }

        Ok(Self {
            queue: Self::interleave(pools),
            batch_size,
            pad_id,
        })
    }

    /// Largest-remainder interleave: each slot goes to the composer with the
    /// highest accumulated credit that still has windows, keeping every epoch
    /// prefix proportional to catalog shares.
    fn interleave(mut pools: BTreeMap<Composer, Vec<Window>>) -> VecDeque<TaggedWindow> {
        let total: usize = pools.values().map(Vec::len).sum();
        let shares: BTreeMap<Composer, f64> = pools
            .iter()
            .map(|(&c, pool)| (c, pool.len() as f64 / total.max(1) as f64))
            .collect();
        let mut credits: BTreeMap<Composer, f64> = shares.keys().map(|&c| (c, 0.0)).collect();

        let mut queue = VecDeque::with_capacity(total);
        for _ in 0..total {
            for (&composer, credit) in credits.iter_mut() {
                *credit += shares[&composer];
            }
            let pick = credits
                .iter()
                .filter(|&(c, _)| pools.get(c).is_some_and(|p| !p.is_empty()))
                .max_by(|a, b| a.1.partial_cmp(b.1).expect("credits are finite"))
                .map(|(&c, _)| c)
                .expect("some pool is non-empty while slots remain");
            *credits.get_mut(&pick).expect("picked composer has a credit") -= 1.0;
            let window = pools.get_mut(&pick).expect("picked pool exists").pop().expect("pool");
            queue.push_back(TaggedWindow { window, composer: pick });
        }
        queue
    }

    /// Windows not yet emitted this epoch.
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    /// Emit the next batch.
    ///
    /// The final batch of an epoch may hold fewer than `batch_size` rows.
    /// Returns [`Error::EmptyBatch`] once the pool is exhausted — the normal
    /// end-of-epoch signal, recovered by building the next epoch's assembler.
    pub fn next_batch(&mut self) -> Result<Batch> {
        if self.queue.is_empty() {
            return Err(Error::EmptyBatch);
        }

        let rows: Vec<TaggedWindow> = (0..self.batch_size)
            .map_while(|_| self.queue.pop_front())
            .collect();
        let seq_len = rows.iter().map(|r| r.window.len()).max().unwrap_or(0);
        let batch_size = rows.len();

        let mut token_ids = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask = Vec::with_capacity(batch_size * seq_len);
        let mut composers = Vec::with_capacity(batch_size);
        let mut lengths = Vec::with_capacity(batch_size);

        for row in &rows {
            let len = row.window.len();
            token_ids.extend_from_slice(&row.window.tokens);
            token_ids.extend(std::iter::repeat(self.pad_id).take(seq_len - len));
            attention_mask.extend(std::iter::repeat(true).take(len));
            attention_mask.extend(std::iter::repeat(false).take(seq_len - len));
            composers.push(row.composer);
            lengths.push(len);
        }

        Ok(Batch {
            token_ids,
            attention_mask,
            composers,
            lengths,
            batch_size,
            seq_len,
        })
    }
}
