use crate::block_error::BlockError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;

type SaveFn<B> = dyn Fn(&B) -> Result<Vec<u8>, BlockError> + Send + Sync;
type LoadFn<B> = dyn Fn(&[u8]) -> Result<B, BlockError> + Send + Sync;

/// User hooks turning a block into bytes and back.
pub struct BlockCodec<B> {
    save: Arc<SaveFn<B>>,
    load: Arc<LoadFn<B>>,
}

impl<B> Clone for BlockCodec<B> {
    fn clone(&self) -> Self {
        BlockCodec {
            save: Arc::clone(&self.save),
            load: Arc::clone(&self.load),
        }
    }
}

impl<B> fmt::Debug for BlockCodec<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCodec").finish_non_exhaustive()
    }
}

impl<B> BlockCodec<B> {
    pub fn new<S, L>(save: S, load: L) -> Self
    where
        S: Fn(&B) -> Result<Vec<u8>, BlockError> + Send + Sync + 'static,
        L: Fn(&[u8]) -> Result<B, BlockError> + Send + Sync + 'static,
    {
        BlockCodec {
            save: Arc::new(save),
            load: Arc::new(load),
        }
    }

    pub fn save(&self, block: &B) -> Result<Vec<u8>, BlockError> {
        (self.save)(block)
    }

    pub fn load(&self, bytes: &[u8]) -> Result<B, BlockError> {
        (self.load)(bytes)
    }
}

impl<B: Serialize + DeserializeOwned + 'static> BlockCodec<B> {
    /// `bincode` both ways.
    pub fn bincode() -> Self {
        BlockCodec::new(
            |b: &B| Ok(bincode::serialize(b)?),
            |bytes: &[u8]| Ok(bincode::deserialize(bytes)?),
        )
    }
}
