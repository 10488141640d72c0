use crate::error::EngineError;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A bounded span of source text, the atomic unit of grounding.
///
/// Chunks are immutable once loaded and owned exclusively by the
/// [`KnowledgeBase`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable identifier, unique within a knowledge base
    pub id: String,
    /// The chunk text
    pub text: String,
    /// Position in the original document order
    pub sequence_index: usize,
    /// Arbitrary metadata carried through from the loader
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Ordered, addressable collection of chunks with sampling support.
///
/// Insertion order is preserved and used as the stable secondary sampling
/// key; every chunk id is unique.
#[derive(Debug)]
pub struct KnowledgeBase {
    chunks: Vec<Chunk>,
    index: HashMap<String, usize>,
}

impl KnowledgeBase {
    /// Build a knowledge base from an ordered chunk sequence.
    ///
    /// Sequence indexes are assigned from input order. Duplicate ids are a
    /// construction error.
    pub fn load(chunks: impl IntoIterator<Item = Chunk>) -> Result<Self, EngineError> {
        let mut out = Vec::new();
        let mut index = HashMap::new();
        for (i, mut chunk) in chunks.into_iter().enumerate() {
            chunk.sequence_index = i;
            if index.insert(chunk.id.clone(), i).is_some() {
                return Err(EngineError::DuplicateChunkId(chunk.id));
            }
            out.push(chunk);
        }
        Ok(Self { chunks: out, index })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Look up a chunk by id.
    pub fn get(&self, id: &str) -> Result<&Chunk, EngineError> {
        self.index
            .get(id)
            .map(|&i| &self.chunks[i])
            .ok_or_else(|| EngineError::ChunkNotFound(id.to_string()))
    }

    /// Iterate chunks in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    fn by_sequence(&self, i: usize) -> &Chunk {
        &self.chunks[i]
    }

    /// Sample `n` distinct chunks uniformly without replacement.
    ///
    /// Signals [`EngineError::InsufficientData`] when `n` exceeds the number
    /// of available chunks; never silently truncates.
    pub fn sample(&self, n: usize, rng: &mut StdRng) -> Result<Vec<&Chunk>, EngineError> {
        if n > self.chunks.len() {
            return Err(EngineError::InsufficientData {
                requested: n,
                available: self.chunks.len(),
            });
        }
        let mut indexes: Vec<usize> = (0..self.chunks.len()).collect();
        indexes.shuffle(rng);
        Ok(indexes[..n].iter().map(|&i| &self.chunks[i]).collect())
    }

    /// Up to `span` chunks adjacent in sequence order starting at `id`,
    /// for multi-hop question synthesis. Always includes the anchor chunk.
    pub fn neighborhood(&self, id: &str, span: usize) -> Result<Vec<&Chunk>, EngineError> {
        let anchor = self.get(id)?;
        let start = anchor.sequence_index;
        let end = (start + span.max(1)).min(self.chunks.len());
        Ok(self.chunks[start..end].iter().collect())
    }
}

/// Read a pre-chunked corpus from JSONL: one `{id?, text, metadata?}`
/// record per line. Records without an id get one from their line position.
pub fn read_chunks(path: &std::path::Path) -> Result<Vec<Chunk>, EngineError> {
    use std::io::BufRead;

    #[derive(Deserialize)]
    struct RawChunk {
        #[serde(default)]
        id: Option<String>,
        text: String,
        #[serde(default)]
        metadata: HashMap<String, serde_json::Value>,
    }

    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut chunks = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawChunk = serde_json::from_str(&line)
            .map_err(|e| EngineError::Persist(format!("line {}: {}", lineno + 1, e)))?;
        chunks.push(Chunk {
            id: raw.id.unwrap_or_else(|| format!("chunk-{}", lineno)),
            text: raw.text,
            sequence_index: chunks.len(),
            metadata: raw.metadata,
        });
    }
    Ok(chunks)
}

/// Sampling strategy over a knowledge base.
///
/// Pluggable; [`UniformSampler`] is the default. Implementations draw
/// without replacement within a call and may track state across calls.
pub trait SamplingStrategy {
    fn sample<'a>(
        &mut self,
        kb: &'a KnowledgeBase,
        n: usize,
    ) -> Result<Vec<&'a Chunk>, EngineError>;
}

/// Uniform random sampling without replacement, both within each call and
/// across calls in one generation session. Once the pool is exhausted the
/// session reshuffles and starts over, so long runs degrade to sampling with
/// replacement between passes rather than failing.
pub struct UniformSampler {
    rng: StdRng,
    drawn: HashSet<String>,
}

impl UniformSampler {
    /// Seeded for reproducibility when a seed is supplied; entropy-seeded
    /// otherwise.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            drawn: HashSet::new(),
        }
    }
}

impl SamplingStrategy for UniformSampler {
    fn sample<'a>(
        &mut self,
        kb: &'a KnowledgeBase,
        n: usize,
    ) -> Result<Vec<&'a Chunk>, EngineError> {
        if n > kb.len() {
            return Err(EngineError::InsufficientData {
                requested: n,
                available: kb.len(),
            });
        }
        let mut fresh: Vec<usize> = kb
            .iter()
            .filter(|c| !self.drawn.contains(&c.id))
            .map(|c| c.sequence_index)
            .collect();
        if fresh.len() < n {
            // Pool exhausted for this session; start a new pass.
            self.drawn.clear();
            fresh = (0..kb.len()).collect();
        }
        fresh.shuffle(&mut self.rng);
        let picked: Vec<&Chunk> = fresh[..n].iter().map(|&i| kb.by_sequence(i)).collect();
        for chunk in &picked {
            self.drawn.insert(chunk.id.clone());
        }
        Ok(picked)
    }
}
