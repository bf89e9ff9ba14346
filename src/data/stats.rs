//! Corpus inspection before training: per-sequence and per-corpus token
//! statistics in the shape the upstream MIDI tooling reports for raw files.

use super::sequence::{Composer, TokenSequence};
use super::window::Windower;
use crate::error::Result;
use serde::Serialize;
use std::collections::BTreeMap;

/// Statistics for one tokenized composition.
#[derive(Debug, Clone, Serialize)]
pub struct SequenceStats {
    pub composer: Composer,
    pub num_tokens: usize,
    pub min_token: Option<u32>,
    pub max_token: Option<u32>,
    /// Spread between the lowest and highest token id seen.
    pub token_span: Option<u32>,
    /// Windows this sequence contributes under the given geometry.
    pub num_windows: usize,
}

/// Aggregate statistics over a corpus.
#[derive(Debug, Clone, Serialize)]
pub struct CorpusStats {
    pub num_sequences: usize,
    pub total_tokens: usize,
    pub total_windows: usize,
    /// Window counts per composer, the basis of stratified batch shares.
    pub windows_per_composer: BTreeMap<Composer, usize>,
}

/// Inspect one sequence under a windowing geometry.
pub fn sequence_stats(
    sequence: &TokenSequence,
    max_seq_len: usize,
    overlap: usize,
) -> Result<SequenceStats> {
    let num_windows = if sequence.is_empty() {
        0
    } else {
        Windower::new(sequence, max_seq_len, overlap)?.count_windows()
    };
    let min_token = sequence.tokens().iter().min().copied();
    let max_token = sequence.tokens().iter().max().copied();
    Ok(SequenceStats {
        composer: sequence.composer(),
        num_tokens: sequence.len(),
        min_token,
        max_token,
        token_span: min_token.zip(max_token).map(|(lo, hi)| hi - lo),
        num_windows,
    })
}

/// Inspect a whole corpus under a windowing geometry.
pub fn corpus_stats(
    corpus: &[TokenSequence],
    max_seq_len: usize,
    overlap: usize,
) -> Result<CorpusStats> {
    let mut total_tokens = 0;
    let mut total_windows = 0;
    let mut windows_per_composer: BTreeMap<Composer, usize> = BTreeMap::new();
    for sequence in corpus {
        let stats = sequence_stats(sequence, max_seq_len, overlap)?;
        total_tokens += stats.num_tokens;
        total_windows += stats.num_windows;
        *windows_per_composer.entry(stats.composer).or_default() += stats.num_windows;
    }
    Ok(CorpusStats {
        num_sequences: corpus.len(),
        total_tokens,
        total_windows,
        windows_per_composer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_stats_basic() {
        let seq = TokenSequence::new(vec![10, 50, 30], Composer::Chopin);
        let stats = sequence_stats(&seq, 8, 2).unwrap();
        assert_eq!(stats.num_tokens, 3);
        assert_eq!(stats.min_token, Some(10));
        assert_eq!(stats.max_token, Some(50));
        assert_eq!(stats.token_span, Some(40));
        assert_eq!(stats.num_windows, 1);
    }

    #[test]
    fn test_empty_sequence_stats() {
        let seq = TokenSequence::new(vec![], Composer::Unknown);
        let stats = sequence_stats(&seq, 8, 2).unwrap();
        assert_eq!(stats.num_windows, 0);
        assert_eq!(stats.token_span, None);
    }

    #[test]
    fn test_corpus_stats_aggregates() {
        let corpus = vec![
            TokenSequence::new((0..20).collect(), Composer::Bach),
            TokenSequence::new((0..20).collect(), Composer::Bach),
            TokenSequence::new((0..5).collect(), Composer::Liszt),
        ];
        let stats = corpus_stats(&corpus, 8, 2).unwrap();
        assert_eq!(stats.num_sequences, 3);
        assert_eq!(stats.total_tokens, 45);
        assert_eq!(stats.windows_per_composer[&Composer::Liszt], 1);
        assert_eq!(
            stats.total_windows,
            stats.windows_per_composer.values().sum::<usize>()
        );
    }
}
