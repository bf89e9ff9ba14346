//! Token sequences and composer identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fixed composer catalog, plus `Unknown` for untagged material.
///
/// Matches the classical piano corpus the upstream codec is trained on; the
/// discriminant order is stable and doubles as the conditioning-token offset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Composer {
    Bach,
    Beethoven,
    Brahms,
    Chopin,
    Debussy,
    Liszt,
    Mozart,
    Rachmaninoff,
    Schubert,
    Scriabin,
    #[default]
    Unknown,
}

impl Composer {
    /// Every named composer, in conditioning-token order.
    pub const CATALOG: [Composer; 10] = [
        Composer::Bach,
        Composer::Beethoven,
        Composer::Brahms,
        Composer::Chopin,
        Composer::Debussy,
        Composer::Liszt,
        Composer::Mozart,
        Composer::Rachmaninoff,
        Composer::Schubert,
        Composer::Scriabin,
    ];

    /// Stable index into the catalog; `None` for `Unknown`.
    pub fn catalog_index(&self) -> Option<usize> {
        Self::CATALOG.iter().position(|c| c == self)
    }
}

impl fmt::Display for Composer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Composer::Bach => "bach",
            Composer::Beethoven => "beethoven",
            Composer::Brahms => "brahms",
            Composer::Chopin => "chopin",
            Composer::Debussy => "debussy",
            Composer::Liszt => "liszt",
            Composer::Mozart => "mozart",
            Composer::Rachmaninoff => "rachmaninoff",
            Composer::Schubert => "schubert",
            Composer::Scriabin => "scriabin",
            Composer::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Composer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bach" => Ok(Composer::Bach),
            "beethoven" => Ok(Composer::Beethoven),
            "brahms" => Ok(Composer::Brahms),
            "chopin" => Ok(Composer::Chopin),
            "debussy" => Ok(Composer::Debussy),
            "liszt" => Ok(Composer::Liszt),
            "mozart" => Ok(Composer::Mozart),
            "rachmaninoff" => Ok(Composer::Rachmaninoff),
            "schubert" => Ok(Composer::Schubert),
            "scriabin" => Ok(Composer::Scriabin),
            "unknown" => Ok(Composer::Unknown),
            other => Err(format!("unknown composer: {other}")),
        }
    }
}

/// One tokenized composition: ordered token IDs plus composer identity.
///
/// Produced by the external MIDI-to-token codec and immutable afterwards;
/// the windower reads it, nothing writes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSequence {
    tokens: Vec<u32>,
    composer: Composer,
}

impl TokenSequence {
    /// Wrap a codec-produced token stream.
    pub fn new(tokens: Vec<u32>, composer: Composer) -> Self {
        Self { tokens, composer }
    }

    /// The token IDs.
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Sequence length in tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the sequence is empty.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Composer identity tag.
    pub fn composer(&self) -> Composer {
        self.composer
    }
}
