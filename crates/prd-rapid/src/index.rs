//! The rapid package index: a master list of repos, and per-repo `versions`
//! files naming every published package.
//!
//! Both artifacts are small gzipped CSV files that change rarely; they are
//! cached under `<springdir>/rapid/` and only re-fetched (with ETag
//! revalidation) once the cached copy is older than [`REPO_RECHECK`]. A
//! cached file that no longer parses is deleted so the next update starts
//! clean.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use flate2::read::GzDecoder;
use prd_fetch::{Category, Download, DownloadError, EngineTuning, HttpEngine, Result, Session};
use prd_fs::{is_older_than, SpringDir};
use tracing::{debug, info};

use crate::sdp::Sdp;

pub const DEFAULT_REPO_MASTER: &str = "https://repos.springrts.com/repos.gz";

/// Cached index files younger than this are trusted without a request.
pub const REPO_RECHECK: Duration = Duration::from_secs(15 * 60);

pub struct RapidIndex<'s> {
    session: &'s Session,
    dir: SpringDir,
    repo_master_url: String,
    rate_per_sec: u32,
    tuning: EngineTuning,
    sdps: Vec<Sdp>,
}

impl<'s> RapidIndex<'s> {
    pub fn new(
        session: &'s Session,
        dir: SpringDir,
        repo_master_url: impl Into<String>,
        rate_per_sec: u32,
    ) -> RapidIndex<'s> {
        RapidIndex {
            session,
            dir,
            repo_master_url: repo_master_url.into(),
            rate_per_sec,
            tuning: EngineTuning::default(),
            sdps: Vec::new(),
        }
    }

    pub fn with_tuning(mut self, tuning: EngineTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn sdps(&self) -> &[Sdp] {
        &self.sdps
    }

    pub fn find(&self, term: &str) -> Vec<&Sdp> {
        self.sdps.iter().filter(|s| s.matches(term)).collect()
    }

    /// Refresh the index far enough to answer the given search terms: the
    /// repo master always, the `versions` files only for repos a term's
    /// `<tag>:` prefix selects (or all repos for untagged terms).
    pub async fn update(&mut self, terms: &[String]) -> Result<()> {
        let repos = self.load_repo_master().await?;

        let mut wanted: Vec<&(String, String)> = Vec::new();
        let tags: Vec<&str> = terms
            .iter()
            .filter_map(|t| t.split_once(':').map(|(tag, _)| tag))
            .collect();
        let tagged_only = !terms.is_empty() && tags.len() == terms.len();
        for repo in &repos {
            if !tagged_only || tags.iter().any(|t| *t == repo.0) {
                wanted.push(repo);
            }
        }
        debug!(
            repos = repos.len(),
            selected = wanted.len(),
            "updating versions"
        );

        // fetch every stale versions file in one engine run
        let mut records = Vec::new();
        for (_, url) in &wanted {
            let path = self.dir.versions_path(url);
            if is_older_than(&path, REPO_RECHECK) {
                records.push(cache_record(&path, format!("{url}/versions.gz")));
            }
        }
        if !records.is_empty() {
            let parallel = records.len().min(10);
            HttpEngine::with_tuning(self.session, self.tuning.clone())
                .download(&mut records, parallel, self.rate_per_sec)
                .await?;
        }

        self.sdps.clear();
        for (shortname, url) in wanted {
            let path = self.dir.versions_path(url);
            match parse_versions(&path, url) {
                Ok(mut sdps) => self.sdps.append(&mut sdps),
                Err(e) => {
                    let _ = std::fs::remove_file(&path);
                    info!(repo = %shortname, error = %e, "unparsable versions file removed");
                    return Err(e);
                }
            }
        }
        debug!(packages = self.sdps.len(), "index updated");
        Ok(())
    }

    async fn load_repo_master(&self) -> Result<Vec<(String, String)>> {
        let path = self.dir.rapid_cache_path(&self.repo_master_url);
        if !is_older_than(&path, REPO_RECHECK) {
            if let Ok(repos) = parse_repos(&path) {
                return Ok(repos);
            }
        }
        let mut records = vec![cache_record(&path, self.repo_master_url.clone())];
        HttpEngine::with_tuning(self.session, self.tuning.clone())
            .download(&mut records, 1, self.rate_per_sec)
            .await?;
        match parse_repos(&path) {
            Ok(repos) => Ok(repos),
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                Err(e)
            }
        }
    }
}

fn cache_record(path: &Path, url: String) -> Download {
    let mut rec = Download::new(path, url.clone(), Category::None);
    rec.add_mirror(url);
    rec.no_cache = true;
    rec.use_etags = true;
    rec
}

/// Parse the repo master: gzipped `<shortname>,<url>[,...]` lines.
fn parse_repos(path: &Path) -> Result<Vec<(String, String)>> {
    let mut repos = Vec::new();
    for line in read_gz_lines(path)? {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split(',');
        match (fields.next(), fields.next()) {
            (Some(shortname), Some(url)) if !url.is_empty() => {
                repos.push((shortname.to_string(), url.to_string()));
            }
            _ => {
                return Err(DownloadError::Parse(format!(
                    "{}: invalid repo line '{line}'",
                    path.display()
                )))
            }
        }
    }
    Ok(repos)
}

/// Parse a `versions` file: gzipped
/// `<tag>,<md5>,<deps_pipe_separated>,<descriptive_name>` lines.
fn parse_versions(path: &Path, base_url: &str) -> Result<Vec<Sdp>> {
    let mut sdps = Vec::new();
    for line in read_gz_lines(path)? {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let mut fields = line.splitn(4, ',');
        let (Some(tag), Some(md5), Some(deps), Some(name)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(DownloadError::Parse(format!(
                "{}: invalid versions line '{line}'",
                path.display()
            )));
        };
        if md5.len() != 32 || !md5.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DownloadError::Parse(format!(
                "{}: bad package hash in '{line}'",
                path.display()
            )));
        }
        sdps.push(Sdp {
            shortname: tag.to_string(),
            md5: md5.to_ascii_lowercase(),
            name: name.to_string(),
            depends: deps
                .split('|')
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .collect(),
            base_url: base_url.to_string(),
        });
    }
    Ok(sdps)
}

fn read_gz_lines(path: &Path) -> Result<impl Iterator<Item = Result<String>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| DownloadError::Parse(format!("{}: {e}", path.display())))?;
    let reader = BufReader::new(GzDecoder::new(file));
    let display = path.display().to_string();
    Ok(reader
        .lines()
        .map(move |l| l.map_err(|e| DownloadError::Parse(format!("{display}: {e}")))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn write_gz(path: &Path, text: &str) {
        let mut enc = GzEncoder::new(std::fs::File::create(path).unwrap(), Compression::default());
        enc.write_all(text.as_bytes()).unwrap();
        enc.finish().unwrap();
    }

    #[test]
    fn parses_repo_master_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repos.gz");
        write_gz(
            &path,
            "ba,https://repos.springrts.com/ba\nzk,https://zero-k.info/rapid,extra\n",
        );
        let repos = parse_repos(&path).unwrap();
        assert_eq!(
            repos,
            vec![
                ("ba".to_string(), "https://repos.springrts.com/ba".to_string()),
                ("zk".to_string(), "https://zero-k.info/rapid".to_string()),
            ]
        );
    }

    #[test]
    fn rejects_malformed_repo_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repos.gz");
        write_gz(&path, "just-a-name\n");
        assert!(parse_repos(&path).is_err());
    }

    #[test]
    fn parses_versions_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("versions.gz");
        let md5 = "52a86b5de454a39db2546017c2e6948d";
        write_gz(
            &path,
            &format!(
                "nota:revision:1,{md5},,NOTA test-1\n\
                 ba:stable,{md5},dep one|dep two,Balanced Annihilation, with comma\n"
            ),
        );
        let sdps = parse_versions(&path, "https://repo").unwrap();
        assert_eq!(sdps.len(), 2);
        assert_eq!(sdps[0].shortname, "nota:revision:1");
        assert_eq!(sdps[0].name, "NOTA test-1");
        assert!(sdps[0].depends.is_empty());
        assert_eq!(sdps[1].depends, vec!["dep one", "dep two"]);
        assert_eq!(sdps[1].name, "Balanced Annihilation, with comma");
        assert_eq!(sdps[1].base_url, "https://repo");
    }

    #[test]
    fn rejects_bad_package_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("versions.gz");
        write_gz(&path, "tag,nothex,,Name\n");
        assert!(parse_versions(&path, "https://repo").is_err());
    }
}
