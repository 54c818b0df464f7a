//! Mapper-side storage of split payloads.
//!
//! A payload is the encoded combiners one mapper produced for one output
//! split. Stores cut payloads into blocks of at most `block_size` bytes;
//! block `i` covers bytes `[i * block_size, (i + 1) * block_size)`.

use async_trait::async_trait;
use barks_common::{Result, ShuffleError};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::RwLock;

/// Identifies the payload one mapper produced for one reducer.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct SplitBlockId {
    pub input_split: u32,
    pub output_split: u32,
}

impl SplitBlockId {
    pub fn new(input_split: u32, output_split: u32) -> Self {
        Self {
            input_split,
            output_split,
        }
    }
}

/// Number of blocks needed for `len` bytes.
pub fn blocks_for(len: usize, block_size: usize) -> u32 {
    len.div_ceil(block_size) as u32
}

#[async_trait]
pub trait BlockStore: Send + Sync {
    fn block_size(&self) -> usize;

    /// Store a payload, returning its block count.
    async fn put_split(&self, id: SplitBlockId, payload: Vec<u8>) -> Result<u32>;

    /// Read one block.
    async fn get_block(&self, id: &SplitBlockId, index: u32) -> Result<Vec<u8>>;

    /// Block count of a stored payload, `None` if nothing is stored under `id`.
    async fn block_count(&self, id: &SplitBlockId) -> Result<Option<u32>>;

    async fn remove_split(&self, id: &SplitBlockId) -> Result<()>;
}

fn missing_block(id: &SplitBlockId, index: u32) -> ShuffleError {
    ShuffleError::protocol_error(format!(
        "block {} of split {}->{} does not exist",
        index, id.input_split, id.output_split
    ))
}

/// In-memory block store
#[derive(Clone)]
pub struct MemoryBlockStore {
    block_size: usize,
    splits: Arc<RwLock<HashMap<SplitBlockId, Vec<Vec<u8>>>>>,
}

impl MemoryBlockStore {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            splits: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    async fn put_split(&self, id: SplitBlockId, payload: Vec<u8>) -> Result<u32> {
        let blocks: Vec<Vec<u8>> = payload
            .chunks(self.block_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        let count = blocks.len() as u32;
        self.splits.write().await.insert(id, blocks);
        Ok(count)
    }

    async fn get_block(&self, id: &SplitBlockId, index: u32) -> Result<Vec<u8>> {
        let splits = self.splits.read().await;
        splits
            .get(id)
            .and_then(|blocks| blocks.get(index as usize))
            .cloned()
            .ok_or_else(|| missing_block(id, index))
    }

    async fn block_count(&self, id: &SplitBlockId) -> Result<Option<u32>> {
        Ok(self
            .splits
            .read()
            .await
            .get(id)
            .map(|blocks| blocks.len() as u32))
    }

    async fn remove_split(&self, id: &SplitBlockId) -> Result<()> {
        self.splits.write().await.remove(id);
        Ok(())
    }
}

/// File-based block store, one file per payload.
#[derive(Debug, Clone)]
pub struct FileBlockStore {
    root_dir: PathBuf,
    block_size: usize,
}

impl FileBlockStore {
    pub fn new<P: AsRef<Path>>(root_dir: P, block_size: usize) -> Result<Self> {
        let path = root_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&path).map_err(|e| {
            ShuffleError::io_error_with_source(format!("cannot create {}", path.display()), e)
        })?;
        Ok(Self {
            root_dir: path,
            block_size: block_size.max(1),
        })
    }

    fn split_path(&self, id: &SplitBlockId) -> PathBuf {
        self.root_dir
            .join(format!("split_{}_{}.data", id.input_split, id.output_split))
    }

    /// Remove every payload and the directory itself.
    pub async fn remove_all(&self) -> Result<()> {
        if fs::try_exists(&self.root_dir).await? {
            fs::remove_dir_all(&self.root_dir).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BlockStore for FileBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    async fn put_split(&self, id: SplitBlockId, payload: Vec<u8>) -> Result<u32> {
        let path = self.split_path(&id);
        let mut file = File::create(&path).await?;
        file.write_all(&payload).await?;
        file.sync_data().await?;
        Ok(blocks_for(payload.len(), self.block_size))
    }

    async fn get_block(&self, id: &SplitBlockId, index: u32) -> Result<Vec<u8>> {
        let path = self.split_path(id);
        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(missing_block(id, index));
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();
        let offset = index as u64 * self.block_size as u64;
        if offset >= len {
            return Err(missing_block(id, index));
        }
        let size = (len - offset).min(self.block_size as u64) as usize;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut block = vec![0; size];
        file.read_exact(&mut block).await?;
        Ok(block)
    }

    async fn block_count(&self, id: &SplitBlockId) -> Result<Option<u32>> {
        match fs::metadata(self.split_path(id)).await {
            Ok(metadata) => Ok(Some(blocks_for(metadata.len() as usize, self.block_size))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_split(&self, id: &SplitBlockId) -> Result<()> {
        let path = self.split_path(id);
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }
}
