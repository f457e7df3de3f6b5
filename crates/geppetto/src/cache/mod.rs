//! Inference result caching.
//!
//! [`CachingEngine`] fingerprints the incoming Turn, replays the stored
//! output blocks on a hit and records the engine's output on a miss.
//! Two back-ends implement [`InferenceCache`]:
//!
//! | Back-end | Bound | Survives restart |
//! |----------|-------|------------------|
//! | [`MemoryCache`] | entry count (LRU) | no |
//! | [`DiskCache`] | entry count and total bytes (LRU by file time) | yes |
//!
//! Failed or cancelled inferences are never cached. A failed cache
//! write is logged and the engine's result is still returned.

mod disk;
mod memory;

pub use disk::DiskCache;
pub use memory::MemoryCache;

use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::context::InferenceContext;
use crate::engine::{CacheType, DynEngine, Engine, StepSettings};
use crate::error::GeppettoError;
use crate::events::{Event, EventMetadata};
use crate::turns::{Block, Turn};

/// One cached inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Blocks the engine appended.
    pub messages: Vec<Block>,
    /// The Turn's blocks before inference.
    pub input: Vec<Block>,
    /// When the entry was recorded.
    pub created: DateTime<Utc>,
}

/// Storage for cached inferences, keyed by [`fingerprint`].
pub trait InferenceCache: Send + Sync {
    /// The entry for `key`; `None` on a miss.
    ///
    /// # Errors
    ///
    /// Back-end failures other than "not present".
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, GeppettoError>;

    /// Stores `entry` under `key`, evicting as needed.
    ///
    /// # Errors
    ///
    /// [`GeppettoError::CacheWrite`] when the entry cannot be persisted.
    fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), GeppettoError>;
}

/// A lowercase hex SHA-256 over everything that shapes the provider
/// request: the namespace (provider and model), each block's kind, role,
/// payload and metadata, and the turn's tool and inference overrides.
///
/// Block ids are not part of the fingerprint.
pub fn fingerprint(namespace: &str, turn: &Turn) -> String {
    let mut hasher = Sha256::new();
    let mut write = |bytes: &[u8]| {
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    };

    write(namespace.as_bytes());
    for block in &turn.blocks {
        write(block.kind.as_str().as_bytes());
        write(block.role.as_deref().unwrap_or_default().as_bytes());
        write(serde_json::Value::Object(block.payload.clone()).to_string().as_bytes());
        write(serde_json::Value::Object(block.metadata.clone()).to_string().as_bytes());
    }
    let data = &turn.data;
    let overrides = serde_json::json!({
        "tools": data.tools,
        "tool_config": data.tool_config,
        "inference_config": data.inference_config,
        "openai_inference_config": data.openai_inference_config,
        "claude_inference_config": data.claude_inference_config,
        "structured_output": data.structured_output,
    });
    write(overrides.to_string().as_bytes());

    format!("{:x}", hasher.finalize())
}

/// A stream of replayed or freshly produced blocks.
pub type BlockStream = Pin<Box<dyn Stream<Item = Block> + Send>>;

/// An engine wrapper that serves repeated requests from a cache.
pub struct CachingEngine<E> {
    inner: E,
    cache: Arc<dyn InferenceCache>,
    namespace: String,
}

impl<E> std::fmt::Debug for CachingEngine<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingEngine")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl<E: Engine> CachingEngine<E> {
    /// Wraps `inner`. `namespace` separates model spaces sharing a cache.
    pub fn new(inner: E, cache: Arc<dyn InferenceCache>, namespace: impl Into<String>) -> Self {
        Self {
            inner,
            cache,
            namespace: namespace.into(),
        }
    }

    /// Runs (or replays) the inference and streams only the new blocks.
    /// The stream ends once every block has been delivered.
    ///
    /// # Errors
    ///
    /// Whatever the wrapped engine returns on a miss.
    pub async fn start(&self, ctx: &InferenceContext, turn: Turn) -> Result<BlockStream, GeppettoError> {
        let seen = turn.blocks.len();
        let out = self.run_inference(ctx, turn).await?;
        let fresh: Vec<Block> = out.blocks.into_iter().skip(seen).collect();
        Ok(Box::pin(futures::stream::iter(fresh)))
    }

    fn replay(&self, ctx: &InferenceContext, mut turn: Turn, entry: CacheEntry) -> Turn {
        let text: String = entry.messages.iter().filter_map(Block::text).collect();
        turn.append_blocks(entry.messages.into_iter().map(|mut block| {
            block.id.clear();
            block.turn_id = None;
            block
        }));
        let meta = EventMetadata {
            run_id: turn.run_id.clone(),
            turn_id: turn.id.clone(),
            ..EventMetadata::default()
        };
        ctx.publish_event(&Event::start(meta.fresh()));
        ctx.publish_event(&Event::final_text(text, meta));
        turn
    }
}

impl<E: Engine> Engine for CachingEngine<E> {
    async fn run_inference(&self, ctx: &InferenceContext, turn: Turn) -> Result<Turn, GeppettoError> {
        let key = fingerprint(&self.namespace, &turn);
        match self.cache.get(&key) {
            Ok(Some(entry)) => {
                debug!(key = %key, blocks = entry.messages.len(), "cache hit");
                return Ok(self.replay(ctx, turn, entry));
            }
            Ok(None) => debug!(key = %key, "cache miss"),
            Err(e) => warn!(key = %key, error = %e, "cache read failed, running inference"),
        }

        let input = turn.blocks.clone();
        let seen = input.len();
        let out = self.inner.run_inference(ctx, turn).await?;
        if ctx.is_cancelled() {
            debug!(key = %key, "context cancelled, not caching");
            return Ok(out);
        }

        let entry = CacheEntry {
            messages: out.blocks.get(seen..).unwrap_or_default().to_vec(),
            input,
            created: Utc::now(),
        };
        if let Err(e) = self.cache.put(&key, &entry) {
            warn!(key = %key, error = %e, "cache write failed");
        }
        Ok(out)
    }
}

/// Wraps `engine` in the cache selected by `settings.chat.cache_type`.
///
/// # Errors
///
/// The disk cache directory cannot be determined or created.
pub fn wrap_engine(
    engine: Box<dyn DynEngine>,
    settings: &StepSettings,
) -> Result<Box<dyn DynEngine>, GeppettoError> {
    let chat = &settings.chat;
    let namespace = format!(
        "{}:{}",
        settings.api_type(),
        chat.engine.as_deref().unwrap_or_default()
    );
    let cache: Arc<dyn InferenceCache> = match chat.cache_type {
        CacheType::None => return Ok(engine),
        CacheType::Memory => Arc::new(MemoryCache::new(
            chat.cache_max_entries.unwrap_or(memory::DEFAULT_MAX_ENTRIES),
        )),
        CacheType::Disk => {
            let dir = match &chat.cache_directory {
                Some(dir) => dir.clone(),
                None => DiskCache::default_directory().ok_or_else(|| {
                    GeppettoError::InvalidRequest("cannot determine home directory for disk cache".into())
                })?,
            };
            let mut cache = DiskCache::new(dir)?;
            if let Some(max) = chat.cache_max_entries {
                cache = cache.with_max_entries(max);
            }
            if let Some(max) = chat.cache_max_size {
                cache = cache.with_max_size(max);
            }
            Arc::new(cache)
        }
    };
    debug!(cache = ?chat.cache_type, namespace = %namespace, "wrapping engine with cache");
    Ok(Box::new(CachingEngine::new(engine, cache, namespace)))
}
