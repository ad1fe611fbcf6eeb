//! Driver for downloading rapid packages: descriptor fetch, pool filter,
//! then either the streamer or a batch of plain pool GETs.

use std::collections::HashSet;

use prd_fetch::{Category, Download, DownloadError, EngineTuning, HttpEngine, Result, Session, State};
use prd_fs::SpringDir;
use prd_hash::Md5Digest;
use tracing::{debug, info};

use crate::sdp::{filter_downloaded, parse_sdp, FileEntry, Sdp};
use crate::streamer::download_stream;

/// Parallelism for the batch pool-GET fallback; pool objects are small, so
/// this is mostly about keeping connections busy.
const POOL_BATCH_PARALLEL: usize = 100;

pub struct RapidDownloader<'s> {
    session: &'s Session,
    dir: SpringDir,
    rate_per_sec: u32,
    use_streamer: bool,
    tuning: EngineTuning,
}

impl<'s> RapidDownloader<'s> {
    pub fn new(
        session: &'s Session,
        dir: SpringDir,
        rate_per_sec: u32,
        use_streamer: bool,
    ) -> RapidDownloader<'s> {
        RapidDownloader {
            session,
            dir,
            rate_per_sec,
            use_streamer,
            tuning: EngineTuning::default(),
        }
    }

    pub fn with_tuning(mut self, tuning: EngineTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Download the packages in `jobs`. Each job pairs the index of its
    /// user-facing record in `records` with the package metadata; the record
    /// reaches `Finished` only when every file of the package is in the
    /// pool, verified.
    pub async fn download(&self, records: &mut [Download], jobs: &[(usize, Sdp)]) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let mut parsed = self.ensure_descriptors(jobs).await?;

        prd_fs::create_pool_dirs(&self.dir.pool_dir())
            .map_err(DownloadError::IoWrite)?;
        let present: HashSet<Md5Digest> = prd_fs::list_pool(&self.dir.pool_dir())
            .map_err(DownloadError::IoWrite)?
            .into_iter()
            .map(|(_, digest)| digest)
            .collect();

        // figure out which packages still need bytes
        let mut to_fetch: Vec<usize> = Vec::new();
        for (job_idx, files) in parsed.iter_mut().enumerate() {
            let (slot, sdp) = &jobs[job_idx];
            if filter_downloaded(files, &present) {
                to_fetch.push(job_idx);
            } else {
                debug!(tag = %sdp.shortname, "package already complete in pool");
                records[*slot].state = State::Finished;
            }
        }
        if to_fetch.is_empty() {
            return Ok(());
        }

        if self.use_streamer {
            for &job_idx in &to_fetch {
                let (slot, sdp) = &jobs[job_idx];
                if let Err(e) = download_stream(self.session, &self.dir, sdp, &parsed[job_idx]).await
                {
                    // a broken stream may mean a stale descriptor; drop it
                    // so the next run starts over
                    let _ = std::fs::remove_file(sdp.sdp_path(&self.dir));
                    return Err(e);
                }
                records[*slot].state = State::Finished;
            }
        } else {
            self.download_pool_http(&to_fetch, jobs, &parsed).await?;
            // completion of deduplicated objects is shared: the engine run
            // succeeding means every unique object is in the pool, verified
            for &job_idx in &to_fetch {
                records[jobs[job_idx].0].state = State::Finished;
            }
        }
        Ok(())
    }

    /// Make sure every package descriptor is on disk and parses; fetch the
    /// missing ones in one engine run.
    async fn ensure_descriptors(&self, jobs: &[(usize, Sdp)]) -> Result<Vec<Vec<FileEntry>>> {
        let mut parsed: Vec<Option<Vec<FileEntry>>> = jobs.iter().map(|_| None).collect();
        let mut fetch_slots = Vec::new();
        let mut fetch_recs = Vec::new();
        for (job_idx, (_, sdp)) in jobs.iter().enumerate() {
            let path = sdp.sdp_path(&self.dir);
            if path.exists() {
                if let Ok(files) = parse_sdp(&path) {
                    parsed[job_idx] = Some(files);
                    continue;
                }
            }
            let mut rec = Download::new(&path, sdp.descriptor_url(), Category::None);
            rec.add_mirror(sdp.descriptor_url());
            fetch_slots.push(job_idx);
            fetch_recs.push(rec);
        }
        if !fetch_recs.is_empty() {
            info!(count = fetch_recs.len(), "fetching package descriptors");
            let parallel = fetch_recs.len().min(10);
            HttpEngine::with_tuning(self.session, self.tuning.clone())
                .download(&mut fetch_recs, parallel, self.rate_per_sec)
                .await?;
            for job_idx in fetch_slots {
                let path = jobs[job_idx].1.sdp_path(&self.dir);
                parsed[job_idx] = Some(parse_sdp(&path)?);
            }
        }
        Ok(parsed.into_iter().map(|p| p.expect("all parsed")).collect())
    }

    /// Batch fallback: one HTTP record per unique missing pool object.
    /// Several packages can reference the same object; it is fetched once
    /// and all of them see its completion.
    async fn download_pool_http(
        &self,
        to_fetch: &[usize],
        jobs: &[(usize, Sdp)],
        parsed: &[Vec<FileEntry>],
    ) -> Result<()> {
        let mut queued: HashSet<Md5Digest> = HashSet::new();
        let mut pool_recs = Vec::new();
        for &job_idx in to_fetch {
            let (_, sdp) = &jobs[job_idx];
            for entry in parsed[job_idx].iter().filter(|f| f.fetch) {
                if !queued.insert(entry.md5) {
                    continue;
                }
                let hex = entry.md5.to_hex();
                let mut rec =
                    Download::new(self.dir.pool_path(&hex), entry.name.as_str(), Category::None);
                rec.add_mirror(sdp.pool_url(&hex));
                rec.approx_size = entry.size.max(1) as u64;
                rec.expect_gzip_md5(entry.md5);
                pool_recs.push(rec);
            }
        }
        info!(objects = pool_recs.len(), "fetching pool objects over http");
        HttpEngine::with_tuning(self.session, self.tuning.clone())
            .download(&mut pool_recs, POOL_BATCH_PARALLEL, self.rate_per_sec)
            .await
    }
}
