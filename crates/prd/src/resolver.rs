//! Search and download orchestration.
//!
//! `search` resolves user-supplied names into candidate download records via
//! the rapid index and the HTTP search service; `add` selects records for
//! download; `start` runs the preflight checks, expands dependencies, then
//! drives the rapid and HTTP pipelines and reports an exit code.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use prd_fetch::{
    fetch_url, Category, Download, DownloadError, DownloadType, HttpEngine, Result, Session,
};
use prd_fs::{escape_filename, SpringDir};
use prd_hash::Md5Digest;
use prd_rapid::{RapidDownloader, RapidIndex, Sdp};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::extract::EngineExtractor;

/// One user request: a category and a name to resolve.
#[derive(Debug, Clone)]
pub struct SearchItem {
    pub category: Category,
    pub name: String,
    pub found: bool,
}

impl SearchItem {
    pub fn new(category: Category, name: impl Into<String>) -> SearchItem {
        SearchItem {
            category,
            name: name.into(),
            found: false,
        }
    }
}

/// Engine category of the running platform.
pub fn platform_engine_category() -> Category {
    if cfg!(all(target_os = "windows", target_pointer_width = "64")) {
        Category::EngineWindows64
    } else if cfg!(target_os = "windows") {
        Category::EngineWindows
    } else if cfg!(target_os = "macos") {
        Category::EngineMacosx
    } else if cfg!(target_pointer_width = "64") {
        Category::EngineLinux64
    } else {
        Category::EngineLinux
    }
}

pub fn platform_name() -> &'static str {
    match platform_engine_category() {
        Category::EngineWindows64 => "windows64",
        Category::EngineWindows => "windows32",
        Category::EngineMacosx => "macosx",
        Category::EngineLinux64 => "linux64",
        _ => "linux32",
    }
}

#[derive(Debug, Deserialize)]
struct SearchEntry {
    category: String,
    springname: String,
    filename: String,
    mirrors: Vec<String>,
    md5: Option<String>,
    size: Option<u64>,
    version: Option<String>,
    depends: Option<Vec<String>>,
}

pub struct Resolver<'s> {
    session: &'s Session,
    config: Config,
    dir: SpringDir,
    fetch_depends: bool,
    index: RapidIndex<'s>,
    results: Vec<Download>,
    /// Package metadata for rapid results, keyed by index into `results`.
    rapid_meta: HashMap<usize, Sdp>,
    /// Indices of results picked for download.
    selected: Vec<usize>,
}

impl<'s> Resolver<'s> {
    pub fn new(
        session: &'s Session,
        config: Config,
        dir: SpringDir,
        fetch_depends: bool,
    ) -> Resolver<'s> {
        let index = RapidIndex::new(
            session,
            dir.clone(),
            config.repo_master.clone(),
            config.max_reqs_per_sec,
        );
        Resolver {
            session,
            config,
            dir,
            fetch_depends,
            index,
            results: Vec::new(),
            rapid_meta: HashMap::new(),
            selected: Vec::new(),
        }
    }

    pub fn results(&self) -> &[Download] {
        &self.results
    }

    /// Pick a search result for download.
    pub fn add(&mut self, id: usize) -> bool {
        if id >= self.results.len() {
            error!(id, "no such search result");
            return false;
        }
        self.selected.push(id);
        true
    }

    /// Queue a raw URL download (selected immediately, no search involved).
    pub fn add_url(&mut self, url: &str) {
        let basename = url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("download");
        let mut rec = Download::new(
            self.dir.root().join(escape_filename(basename)),
            url,
            Category::Http,
        );
        rec.add_mirror(url);
        self.selected.push(self.results.len());
        self.results.push(rec);
    }

    /// Resolve every item into download records. Games and untyped names go
    /// to the rapid index first, with the HTTP search service as fallback;
    /// maps and engines go straight to the search service. Returns the total
    /// number of records found so far.
    pub async fn search(&mut self, items: &mut [SearchItem]) -> Result<usize> {
        let mut rapid_items = Vec::new();
        let mut http_items = Vec::new();
        for (i, item) in items.iter_mut().enumerate() {
            if item.category == Category::Engine {
                item.category = platform_engine_category();
            }
            match item.category {
                Category::Http => {
                    return Err(DownloadError::Parse(
                        "cannot search for a raw URL".to_string(),
                    ))
                }
                Category::Game | Category::None => {
                    rapid_items.push(i);
                    http_items.push(i);
                }
                _ => http_items.push(i),
            }
        }

        if !rapid_items.is_empty() {
            let terms: Vec<String> = rapid_items.iter().map(|&i| items[i].name.clone()).collect();
            self.index.update(&terms).await?;
            for &i in &rapid_items {
                let matches: Vec<Sdp> =
                    self.index.find(&items[i].name).into_iter().cloned().collect();
                for sdp in matches {
                    debug!(tag = %sdp.shortname, name = %sdp.name, "rapid match");
                    let mut rec = Download::new(&sdp.name, items[i].name.as_str(), Category::Game);
                    rec.dltype = DownloadType::Rapid;
                    rec.version = sdp.shortname.clone();
                    rec.depends = sdp.depends.clone();
                    self.rapid_meta.insert(self.results.len(), sdp);
                    self.results.push(rec);
                    items[i].found = true;
                }
            }
        }

        for &i in &http_items {
            if items[i].found {
                continue;
            }
            let recs = self.http_search(&items[i]).await?;
            if !recs.is_empty() {
                items[i].found = true;
            }
            self.results.extend(recs);
        }
        Ok(self.results.len())
    }

    async fn http_search(&self, item: &SearchItem) -> Result<Vec<Download>> {
        let mut url = format!("{}?", self.config.search_url);
        if item.category != Category::None {
            url.push_str(&format!(
                "category={}&",
                urlencode(item.category.as_str())
            ));
        }
        url.push_str(&format!("springname={}", urlencode(&item.name)));

        let body = fetch_url(self.session, &url).await?;
        let entries: Vec<SearchEntry> = serde_json::from_slice(&body)
            .map_err(|e| DownloadError::Parse(format!("search result: {e}")))?;

        let mut out = Vec::new();
        for entry in entries {
            let Some(category) = Category::from_str(&entry.category) else {
                warn!(category = %entry.category, "unknown category in search result");
                continue;
            };
            let Some(subdir) = category.subdir() else {
                continue;
            };
            let dest = self
                .dir
                .category_dir(subdir)
                .join(escape_filename(&entry.filename));
            let mut rec = Download::new(dest, entry.springname.as_str(), category);
            for mirror in entry.mirrors {
                rec.add_mirror(mirror);
            }
            if let Some(digest) = entry.md5.as_deref().and_then(Md5Digest::from_hex) {
                rec.expect_md5(digest);
            }
            rec.size = entry.size;
            if let Some(version) = entry.version {
                rec.version = version;
            }
            if let Some(depends) = entry.depends {
                rec.depends = depends;
            }
            out.push(rec);
        }
        debug!(name = %item.name, results = out.len(), "search service answered");
        Ok(out)
    }

    /// Download everything selected with [`add`](Self::add). Exit codes:
    /// 0 success, 1 nothing to do, 2 any record failed, 5 insufficient disk
    /// space, 6 unresolvable dependency.
    pub async fn start(mut self, extractor: &dyn EngineExtractor) -> u8 {
        let dlsize: u64 = self
            .selected
            .iter()
            .filter_map(|&i| self.results[i].size)
            .sum();
        // anything below 1 GiB free invites fragmentation-slow installs
        let needed = dlsize / (1024 * 1024) + 1024;
        match self.dir.free_space_mb() {
            Ok(free) if free < needed => {
                error!(
                    free_mb = free,
                    needed_mb = needed,
                    dir = %self.dir.root().display(),
                    "insufficient free disk space"
                );
                return 5;
            }
            Err(e) => warn!(error = %e, "could not determine free disk space"),
            _ => {}
        }

        if self.fetch_depends {
            if let Err(code) = self.resolve_depends().await {
                return code;
            }
        }

        if self.selected.is_empty() {
            info!("nothing to do");
            return 1;
        }

        // move the selected records into the working set
        let mut order: Vec<usize> = Vec::new();
        let mut seen = HashSet::new();
        for &id in &self.selected {
            if seen.insert(id) {
                order.push(id);
            }
        }
        let mut dls: Vec<Download> = Vec::with_capacity(order.len());
        let mut rapid_jobs: Vec<(usize, Sdp)> = Vec::new();
        for id in order {
            if let Some(sdp) = self.rapid_meta.remove(&id) {
                rapid_jobs.push((dls.len(), sdp));
            }
            let placeholder = Download::new(PathBuf::new(), "", Category::None);
            dls.push(std::mem::replace(&mut self.results[id], placeholder));
        }

        if !rapid_jobs.is_empty() {
            let rapid = RapidDownloader::new(
                self.session,
                self.dir.clone(),
                self.config.max_reqs_per_sec,
                self.config.use_streamer,
            );
            if let Err(e) = rapid.download(&mut dls, &rapid_jobs).await {
                error!(error = %e, "rapid download failed");
            }
        }

        // Sequential HTTP transfers: map and engine archives are large and
        // mirrors throttle per connection anyway.
        let engine = HttpEngine::new(self.session);
        if let Err(e) = engine
            .download(&mut dls, 1, self.config.max_reqs_per_sec)
            .await
        {
            error!(error = %e, "http download failed");
        }

        for rec in dls
            .iter()
            .filter(|r| r.is_finished() && r.category.is_engine())
        {
            if let Err(e) = extractor.extract(&rec.name, &rec.version, platform_name(), &self.dir)
            {
                error!(version = %rec.version, error = %e, "engine extraction failed");
            }
        }

        let mut code = 0;
        for rec in &dls {
            if !rec.is_finished() {
                error!(origin = %rec.origin_name, "download failed");
                code = 2;
            }
        }
        code
    }

    /// Transitively search for everything the selected records depend on.
    /// New records join the selection; a dependency nothing can resolve
    /// fails the run with exit code 6.
    async fn resolve_depends(&mut self) -> std::result::Result<(), u8> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut frontier: Vec<String> = Vec::new();
        for &id in &self.selected {
            let rec = &self.results[id];
            seen.insert(rec.origin_name.clone());
            seen.insert(rec.name.display().to_string());
            frontier.extend(rec.depends.iter().cloned());
        }

        loop {
            let mut item_list: Vec<SearchItem> = frontier
                .drain(..)
                .filter(|dep| seen.insert(dep.clone()))
                .map(|dep| SearchItem::new(Category::None, dep))
                .collect();
            if item_list.is_empty() {
                return Ok(());
            }

            let before = self.results.len();
            if let Err(e) = self.search(&mut item_list).await {
                error!(error = %e, "dependency search failed");
                return Err(6);
            }
            for item in &item_list {
                if !item.found {
                    error!(name = %item.name, "failed to find dependency");
                    return Err(6);
                }
            }

            let mut new_names = Vec::new();
            for (offset, rec) in self.results[before..].iter().enumerate() {
                self.selected.push(before + offset);
                new_names.push(rec.origin_name.clone());
                new_names.push(rec.name.display().to_string());
                frontier.extend(rec.depends.iter().cloned());
            }
            info!(new = self.results.len() - before, "dependencies resolved");
            seen.extend(new_names);
        }
    }
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}
