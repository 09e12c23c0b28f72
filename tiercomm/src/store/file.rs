use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::{Result, TierCommError};
use crate::store::RendezvousStore;

/// Rendezvous store on a shared filesystem: one file per key.
///
/// Writes go to a temporary file that is renamed into place, so readers
/// never observe a partial value. Readers poll until the file appears.
pub struct FileStore {
    dir: PathBuf,
    poll: Duration,
}

impl FileStore {
    /// Use `dir` (created if missing) as the key space.
    pub async fn open(dir: impl AsRef<Path>, poll: Duration) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            TierCommError::store_with_source(format!("create {}", dir.display()), e)
        })?;
        Ok(Self { dir, poll })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(encode_key(key))
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let target = self.path_for(key);
        let tmp = self.dir.join(format!(
            ".{}.{}.{:016x}.tmp",
            encode_key(key),
            std::process::id(),
            rand::random::<u64>()
        ));
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| TierCommError::store_with_source(format!("write {key:?}"), e))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| TierCommError::store_with_source(format!("publish {key:?}"), e))?;
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key);
        loop {
            match tokio::fs::read(&path).await {
                Ok(v) => return Ok(v),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tokio::time::sleep(self.poll).await;
                }
                Err(e) => {
                    return Err(TierCommError::store_with_source(format!("read {key:?}"), e));
                }
            }
        }
    }
}

impl RendezvousStore for FileStore {
    fn put<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.write(key, value))
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(self.read(key))
    }
}

/// Hex-encode a key so any byte sequence maps to a valid file name.
fn encode_key(key: &str) -> String {
    key.bytes().map(|b| format!("{b:02x}")).collect()
}
