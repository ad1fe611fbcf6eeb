//! Seam for unpacking downloaded engine archives. The actual 7z/zip
//! handling lives outside this tool; the default implementation only
//! reports where the archive landed.

use std::path::Path;

use prd_fs::SpringDir;
use tracing::info;

pub trait EngineExtractor {
    fn extract(
        &self,
        archive: &Path,
        version: &str,
        platform: &str,
        dir: &SpringDir,
    ) -> anyhow::Result<()>;
}

pub struct NoopExtractor;

impl EngineExtractor for NoopExtractor {
    fn extract(
        &self,
        archive: &Path,
        version: &str,
        platform: &str,
        dir: &SpringDir,
    ) -> anyhow::Result<()> {
        info!(
            archive = %archive.display(),
            target = %dir.engine_dir(platform, version).display(),
            "engine archive downloaded; extraction is handled externally"
        );
        Ok(())
    }
}
