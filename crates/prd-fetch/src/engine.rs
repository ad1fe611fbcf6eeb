//! The parallel HTTP transfer engine.
//!
//! One orchestrating task drives every transfer of a run: it admits records,
//! starts attempts under a token-bucket rate limit, collects completions,
//! feeds failed attempts through a delayed retry queue, and watches the
//! shared abort flag. All disk writes and hashing happen on the I/O worker
//! pool; each transfer gets a pool handle so its writes apply in exactly the
//! order the network delivered them.
//!
//! Per record the state machine is `none -> downloading -> finished|failed`;
//! `downloading` is entered by the first write work unit, the terminal state
//! by the finalize or cleanup unit.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use prd_fs::StagedFile;
use prd_hash::Md5Digest;
use prd_hash::StreamHash;
use rand::seq::SliceRandom;
use tracing::{debug, error, info, warn};

use crate::backoff::retry_delay;
use crate::error::{DownloadError, Result};
use crate::io_pool::{Handle, IoPool, ResultFn};
use crate::progress::PackProgress;
use crate::record::{Download, DownloadType, HashKind, State};
use crate::session::Session;
use crate::throttle::Throttler;

/// Engine knobs with the production defaults. Tests shrink the delays.
#[derive(Debug, Clone)]
pub struct EngineTuning {
    /// First-retry backoff; doubles per retry.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// A server-supplied `Retry-After` longer than this aborts the run.
    pub retry_after_cap: Duration,
    /// Maximum network attempts per record.
    pub retry_limit: u32,
    /// Bounded wait per scheduler iteration.
    pub poll_interval: Duration,
    /// A transfer producing no bytes for this long counts as a (retryable)
    /// timeout.
    pub stall_timeout: Duration,
    /// Work-queue slots per I/O worker.
    pub queue_slots: usize,
}

impl Default for EngineTuning {
    fn default() -> Self {
        EngineTuning {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            retry_after_cap: Duration::from_secs(30),
            retry_limit: 10,
            poll_interval: Duration::from_millis(20),
            stall_timeout: Duration::from_secs(30),
            queue_slots: 1000,
        }
    }
}

/// Transfer-time view of one record, shared between the scheduler task and
/// the I/O workers.
struct JobShared {
    slot: usize,
    name: PathBuf,
    origin: String,
    mirrors: Vec<String>,
    hash_kind: HashKind,
    expected: Option<Md5Digest>,
    weight: u64,
    no_cache: bool,
    use_etags: bool,
    validate_tls: bool,
    checksum_sidecar: bool,
    handle: Handle,
    /// Latched by the first failing work unit; later units become no-ops.
    io_failed: AtomicBool,
    progress: AtomicU64,
    st: Mutex<JobState>,
}

struct JobState {
    file: Option<StagedFile>,
    hash: Option<Box<dyn StreamHash>>,
    state: State,
}

enum Attempt {
    /// Body received in full; verification and commit run on the strand.
    Done,
    /// HTTP 304, existing file kept.
    NotModified,
    /// Abort flag observed mid-transfer.
    Canceled,
    Failed {
        error: DownloadError,
        retry_after: Option<Duration>,
    },
}

pub struct HttpEngine<'s> {
    session: &'s Session,
    tuning: EngineTuning,
}

impl<'s> HttpEngine<'s> {
    pub fn new(session: &'s Session) -> HttpEngine<'s> {
        HttpEngine {
            session,
            tuning: EngineTuning::default(),
        }
    }

    pub fn with_tuning(session: &'s Session, tuning: EngineTuning) -> HttpEngine<'s> {
        HttpEngine { session, tuning }
    }

    /// Transfer every admissible HTTP record in `records`, with at most
    /// `max_parallel` requests in flight and at most `rate_per_sec` request
    /// starts per second (0 = unlimited).
    ///
    /// Returns `Ok` when the run completed; individual verification results
    /// are left in each record's `state`. Any non-retryable failure aborts
    /// the whole run, cancelling the other transfers.
    pub async fn download(
        &self,
        records: &mut [Download],
        max_parallel: usize,
        rate_per_sec: u32,
    ) -> Result<()> {
        // Admission: finished and non-HTTP records are not ours; a record
        // without mirrors poisons the run before any transfer starts.
        let mut admitted = Vec::new();
        for (slot, rec) in records.iter_mut().enumerate() {
            if rec.is_finished() || rec.dltype != DownloadType::Http {
                continue;
            }
            if rec.mirrors.is_empty() {
                rec.state = State::Failed;
                return Err(DownloadError::NoMirrors(rec.origin_name.clone()));
            }
            admitted.push(slot);
        }
        if admitted.is_empty() {
            debug!("nothing to download");
            return Ok(());
        }

        let pool = IoPool::new(pool_size(admitted.len()), self.tuning.queue_slots);
        let pack = PackProgress::new();
        let mut jobs: Vec<Arc<JobShared>> = admitted
            .into_iter()
            .map(|slot| {
                let rec = &records[slot];
                pack.add_total(rec.weight());
                Arc::new(JobShared {
                    slot,
                    name: rec.name.clone(),
                    origin: rec.origin_name.clone(),
                    mirrors: rec.mirrors.clone(),
                    hash_kind: rec.hash_kind,
                    expected: rec.expected_hash,
                    weight: rec.weight(),
                    no_cache: rec.no_cache,
                    use_etags: rec.use_etags,
                    validate_tls: rec.validate_tls,
                    checksum_sidecar: rec.write_checksum_sidecar,
                    handle: pool.handle(),
                    io_failed: AtomicBool::new(false),
                    progress: AtomicU64::new(rec.progress),
                    st: Mutex::new(JobState {
                        file: None,
                        hash: None,
                        state: rec.state,
                    }),
                })
            })
            .collect();

        // Interleave big and small files so bandwidth and file I/O spread
        // evenly instead of all large transfers pairing up at the tail.
        jobs.shuffle(&mut rand::thread_rng());

        // Failures inside this run raise a run-local flag; the session-wide
        // abort additionally cancels every run.
        let run_abort = Arc::new(AtomicBool::new(false));
        let mut result = self
            .run_scheduler(&jobs, &pool, &pack, &run_abort, max_parallel, rate_per_sec)
            .await;
        pool.finish().await;

        // I/O failures from the final drain surface through the abort flag.
        if result.is_ok() && (run_abort.load(Ordering::Relaxed) || self.session.abort_requested())
        {
            result = Err(DownloadError::Aborted);
        }

        for job in &jobs {
            cleanup_job(job);
            let mut st = job.st.lock().expect("job poisoned");
            let rec = &mut records[job.slot];
            rec.state = st.state;
            rec.progress = job.progress.load(Ordering::Relaxed);
            st.hash = None;
        }

        match &result {
            Ok(retried) => {
                info!(files = jobs.len(), retried_errors = retried, "transfer run complete")
            }
            Err(e) => warn!(files = jobs.len(), error = %e, "transfer run aborted"),
        }
        result.map(|_| ())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_scheduler(
        &self,
        jobs: &[Arc<JobShared>],
        pool: &IoPool,
        pack: &PackProgress,
        run_abort: &Arc<AtomicBool>,
        max_parallel: usize,
        rate_per_sec: u32,
    ) -> Result<u32> {
        let burst = Throttler::default_burst(rate_per_sec, max_parallel.max(1) as u32);
        let mut throttler = Throttler::new(rate_per_sec, burst);
        let mut pending: VecDeque<usize> = (0..jobs.len()).collect();
        let mut retries = vec![0u32; jobs.len()];
        let mut heap: BinaryHeap<Reverse<(Instant, usize)>> = BinaryHeap::new();
        let mut in_flight: FuturesUnordered<BoxFuture<'_, (usize, Attempt)>> =
            FuturesUnordered::new();
        let mut retried_errors = 0u32;

        loop {
            // collect everything that already finished
            while let Some(ready) = in_flight.next().now_or_never() {
                let Some((idx, attempt)) = ready else { break };
                self.attempt_done(
                    jobs,
                    pool,
                    run_abort,
                    idx,
                    attempt,
                    &mut retries,
                    &mut heap,
                    &mut retried_errors,
                )
                .await?;
            }

            throttler.refill();

            // due retries first, they already waited
            let now = Instant::now();
            while let Some(&Reverse((due, idx))) = heap.peek() {
                if due > now || !throttler.get_token() {
                    break;
                }
                heap.pop();
                in_flight.push(self.spawn_attempt(
                    pool,
                    pack,
                    run_abort,
                    jobs[idx].clone(),
                    retries[idx],
                ));
            }

            // fill up to max_parallel with fresh records; waiting retries
            // count against the limit
            while in_flight.len() + heap.len() < max_parallel
                && !pending.is_empty()
                && throttler.get_token()
            {
                let idx = pending.pop_front().expect("checked non-empty");
                in_flight.push(self.spawn_attempt(pool, pack, run_abort, jobs[idx].clone(), 0));
            }

            if in_flight.is_empty() && heap.is_empty() && pending.is_empty() {
                break;
            }

            // bounded wait for the next completion
            if in_flight.is_empty() {
                tokio::time::sleep(self.tuning.poll_interval).await;
            } else if let Ok(Some((idx, attempt))) =
                tokio::time::timeout(self.tuning.poll_interval, in_flight.next()).await
            {
                self.attempt_done(
                    jobs,
                    pool,
                    run_abort,
                    idx,
                    attempt,
                    &mut retries,
                    &mut heap,
                    &mut retried_errors,
                )
                .await?;
            }

            pool.pull_results();
            if run_abort.load(Ordering::Relaxed) || self.session.abort_requested() {
                return Err(DownloadError::Aborted);
            }
        }
        Ok(retried_errors)
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_done(
        &self,
        jobs: &[Arc<JobShared>],
        pool: &IoPool,
        run_abort: &Arc<AtomicBool>,
        idx: usize,
        attempt: Attempt,
        retries: &mut [u32],
        heap: &mut BinaryHeap<Reverse<(Instant, usize)>>,
        retried_errors: &mut u32,
    ) -> Result<()> {
        let job = &jobs[idx];
        let result = match attempt {
            Attempt::Done | Attempt::NotModified | Attempt::Canceled => Ok(()),
            Attempt::Failed { error, retry_after } => {
                *retried_errors += 1;
                if !error.is_retryable() {
                    error!(origin = %job.origin, %error, "aborting transfer run");
                    Err(error)
                } else {
                    retries[idx] += 1;
                    let attempt_no = retries[idx];
                    if attempt_no >= self.tuning.retry_limit {
                        error!(
                            origin = %job.origin,
                            attempts = attempt_no,
                            "retry limit reached, aborting"
                        );
                        Err(DownloadError::RetryLimit(attempt_no))
                    } else if retry_after.is_some_and(|d| d > self.tuning.retry_after_cap) {
                        error!(
                            origin = %job.origin,
                            ?retry_after,
                            "server asked to wait longer than the cap, aborting"
                        );
                        Err(error)
                    } else {
                        let delay = match retry_after {
                            Some(d) if d > Duration::ZERO => d,
                            _ => retry_delay(attempt_no, self.tuning.base_delay, self.tuning.max_delay),
                        };
                        warn!(origin = %job.origin, %error, retry = attempt_no, ?delay, "will retry");
                        heap.push(Reverse((Instant::now() + delay, idx)));
                        Ok(())
                    }
                }
            }
        };
        // Whatever happened, drop this attempt's partial state on the strand
        // so a retry starts from a fresh staged file.
        submit_cleanup(pool, job, run_abort).await;
        result
    }

    fn spawn_attempt<'a>(
        &'a self,
        pool: &'a IoPool,
        pack: &'a PackProgress,
        run_abort: &'a Arc<AtomicBool>,
        job: Arc<JobShared>,
        retry_num: u32,
    ) -> BoxFuture<'a, (usize, Attempt)> {
        async move {
            let slot = job.slot;
            let attempt = self.run_attempt(pool, pack, run_abort, &job, retry_num).await;
            (slot, attempt)
        }
        .boxed()
    }

    async fn run_attempt(
        &self,
        pool: &IoPool,
        pack: &PackProgress,
        abort: &Arc<AtomicBool>,
        job: &Arc<JobShared>,
        retry_num: u32,
    ) -> Attempt {
        let mirror = job
            .mirrors
            .choose(&mut rand::thread_rng())
            .cloned()
            .expect("admission requires mirrors");
        debug!(origin = %job.origin, %mirror, retry_num, "starting transfer");

        // Stage the file and set up the running hash on the record's strand.
        submit_guarded(pool, job, abort, |job| {
            let mut st = job.st.lock().expect("job poisoned");
            let file = StagedFile::open(&job.name)?;
            st.file = Some(file);
            st.hash = job.hash_kind.new_hash();
            Ok(())
        })
        .await;

        let client = self.session.client(job.validate_tls);
        let mut req = client
            .get(&mirror)
            .header("X-Prd-Retry-Num", retry_num.to_string());
        if job.no_cache {
            req = req.header(reqwest::header::CACHE_CONTROL, "no-cache");
        }
        if job.use_etags {
            let name = job.name.clone();
            if let Ok(Some(etag)) =
                tokio::task::spawn_blocking(move || prd_fs::read_etag(&name)).await
            {
                req = req.header(reqwest::header::IF_NONE_MATCH, etag);
            }
        }

        let mut resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                return Attempt::Failed {
                    error: DownloadError::from_transport(&e),
                    retry_after: None,
                }
            }
        };

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_MODIFIED {
            // the existing file is current; never overwrite it with the
            // empty staged one
            submit_guarded(pool, job, abort, |job| {
                let mut st = job.st.lock().expect("job poisoned");
                if let Some(file) = st.file.take() {
                    file.discard();
                }
                st.hash = None;
                st.state = State::Finished;
                Ok(())
            })
            .await;
            return Attempt::NotModified;
        }
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let error = if status.as_u16() == 429 {
                DownloadError::RateLimited(retry_after)
            } else {
                DownloadError::HttpStatus(status.as_u16())
            };
            return Attempt::Failed { error, retry_after };
        }

        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let total = resp.content_length().unwrap_or(0);

        let mut done = 0u64;
        loop {
            if abort.load(Ordering::Relaxed) || self.session.abort_requested() {
                return Attempt::Canceled;
            }
            let bytes = match tokio::time::timeout(self.tuning.stall_timeout, resp.chunk()).await {
                Err(_) => {
                    return Attempt::Failed {
                        error: DownloadError::TransportRetryable(format!(
                            "no data for {:?}",
                            self.tuning.stall_timeout
                        )),
                        retry_after: None,
                    }
                }
                Ok(Err(e)) => {
                    return Attempt::Failed {
                        error: DownloadError::from_transport(&e),
                        retry_after: None,
                    }
                }
                Ok(Ok(None)) => break,
                Ok(Ok(Some(bytes))) => bytes,
            };
            done += bytes.len() as u64;
            // Bytes is already a cheap shared buffer; the closure owns it
            // until the worker has written it out.
            submit_guarded(pool, job, abort, move |job| {
                let mut st = job.st.lock().expect("job poisoned");
                let st = &mut *st;
                st.state = State::Downloading;
                if let Some(hash) = st.hash.as_mut() {
                    hash.update(&bytes);
                }
                if let Some(file) = st.file.as_mut() {
                    file.write(&bytes)?;
                }
                Ok(())
            })
            .await;

            let old = job.progress.swap(done, Ordering::Relaxed);
            pack.update(job.weight, total, old, done);
            if total > 0 {
                self.session.observer().progress(pack.done(), pack.total());
            }
        }

        // Verify and commit on the strand, after the last write.
        submit_guarded(pool, job, abort, move |job| {
            let mut st = job.st.lock().expect("job poisoned");
            let st = &mut *st;
            let digest = st.hash.as_mut().map(|h| h.finish());
            if let (Some(expected), Some(actual)) = (job.expected, digest) {
                if actual != expected {
                    st.state = State::Failed;
                    if let Some(file) = st.file.take() {
                        file.discard();
                    }
                    return Err(DownloadError::HashMismatch {
                        name: job.origin.clone(),
                        expected,
                        actual,
                    });
                }
            }
            if let Some(file) = st.file.take() {
                file.commit()?;
            }
            st.state = State::Finished;
            if job.checksum_sidecar {
                if let Some(actual) = digest {
                    if let Err(e) = prd_fs::write_checksum_sidecar(&job.name, &actual) {
                        warn!(name = %job.name.display(), error = %e, "checksum sidecar not written");
                    }
                }
            }
            if job.use_etags {
                if let Some(etag) = &etag {
                    if let Err(e) = prd_fs::write_etag(&job.name, etag) {
                        warn!(name = %job.name.display(), error = %e, "etag sidecar not written");
                    }
                }
            }
            Ok(())
        })
        .await;
        Attempt::Done
    }
}

/// GET a URL into memory through the session client. Used for the JSON
/// search service and other small documents.
pub async fn fetch_url(session: &Session, url: &str) -> Result<Vec<u8>> {
    debug!(%url, "fetching into memory");
    let resp = session
        .client(true)
        .get(url)
        .send()
        .await
        .map_err(|e| DownloadError::from_transport(&e))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(DownloadError::HttpStatus(status.as_u16()));
    }
    let body = resp
        .bytes()
        .await
        .map_err(|e| DownloadError::from_transport(&e))?;
    Ok(body.to_vec())
}

fn pool_size(job_count: usize) -> usize {
    if job_count < 10 {
        1
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(16)
    }
}

fn cleanup_job(job: &JobShared) {
    let mut st = job.st.lock().expect("job poisoned");
    if let Some(file) = st.file.take() {
        if st.state == State::Downloading {
            st.state = State::Failed;
        }
        file.discard();
    }
}

async fn submit_cleanup(pool: &IoPool, job: &Arc<JobShared>, abort: &Arc<AtomicBool>) {
    submit_guarded(pool, job, abort, |job| {
        cleanup_job(job);
        Ok(())
    })
    .await;
}

/// Queue `f` on the job's strand with the failure-wrapping convention: once
/// one unit fails, later units become no-ops and a single result closure
/// raises the shared abort flag on the orchestrating task.
async fn submit_guarded<F>(pool: &IoPool, job: &Arc<JobShared>, abort: &Arc<AtomicBool>, f: F)
where
    F: FnOnce(&JobShared) -> Result<()> + Send + 'static,
{
    let handle = job.handle;
    let job = job.clone();
    let abort = abort.clone();
    pool.submit(
        handle,
        Box::new(move || {
            if job.io_failed.load(Ordering::Relaxed) {
                return None;
            }
            match f(&job) {
                Ok(()) => None,
                Err(e) => {
                    job.io_failed.store(true, Ordering::Relaxed);
                    let origin = job.origin.clone();
                    Some(Box::new(move || {
                        error!(%origin, error = %e, "transfer i/o failed");
                        abort.store(true, Ordering::Relaxed);
                    }) as ResultFn)
                }
            }
        }),
    )
    .await;
}
