//! File-backed artifact cache keyed by upstream URL.
//!
//! Artifacts are written to a temp file next to their final path while the
//! bytes are streamed to the client, then renamed into place once the
//! upstream body is complete. A reader therefore never sees a partial file
//! at a final path. Concurrent misses for the same key share one upstream
//! fetch through a [`FlightMap`]; callers arriving mid-download read the
//! temp file as it grows.

pub mod flight;
pub mod humanize;

use crate::error::{OffgridError, Result};
use crate::upstream::Download;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use std::fmt;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

pub use flight::{FlightGuard, FlightMap, Progress, Role};
pub use humanize::{human_readable_duration, human_readable_size};

/// Bytes of an artifact being populated, in upstream order.
pub type ArtifactStream = BoxStream<'static, Result<Bytes>>;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// How cache keys are derived from upstream URLs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheLayout {
    /// `<root>/<scheme>_<host>[_<port>]/<path>`; different origins never collide.
    #[default]
    Origin,
    /// `<root>/<path>`; identical paths on different origins share one file.
    Path,
}

impl FromStr for CacheLayout {
    type Err = OffgridError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "origin" => Ok(Self::Origin),
            "path" => Ok(Self::Path),
            other => Err(OffgridError::Config(format!(
                "CACHE_LAYOUT must be 'origin' or 'path', got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for CacheLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Origin => f.write_str("origin"),
            Self::Path => f.write_str("path"),
        }
    }
}

/// Result of a cache lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedFile {
    pub exists: bool,
    pub path: PathBuf,
    pub size: Option<u64>,
    pub human_size: Option<String>,
}

/// What [`CacheStore::fetch_through`] produced.
pub enum Artifact {
    /// Complete file already on disk.
    Cached(CachedFile),
    /// Upstream body being written to disk; the stream follows the file as it grows.
    Streaming {
        content_type: Option<String>,
        content_length: Option<u64>,
        body: ArtifactStream,
    },
}

#[derive(Clone, Debug)]
pub struct CacheStore {
    root: PathBuf,
    layout: CacheLayout,
    flights: FlightMap,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>, layout: CacheLayout) -> Self {
        Self {
            root: root.into(),
            layout,
            flights: FlightMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an upstream URL to its final path under the cache root.
    ///
    /// # Errors
    /// [`OffgridError::InvalidPath`] when the URL cannot be parsed, has an
    /// empty path, or a path segment that would escape the cache root.
    pub fn cache_key_for(&self, upstream_url: &str) -> Result<PathBuf> {
        let url = Url::parse(upstream_url)
            .map_err(|e| OffgridError::InvalidPath(format!("{upstream_url}: {e}")))?;

        let relative = Path::new(url.path().trim_start_matches('/'));
        let safe = relative.components().next().is_some()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(OffgridError::InvalidPath(format!(
                "{upstream_url}: path cannot be mapped into the cache"
            )));
        }

        let mut key = self.root.clone();
        if self.layout == CacheLayout::Origin {
            key.push(origin_segment(&url));
        }
        key.push(relative);
        Ok(key)
    }

    /// Check whether a complete artifact for `upstream_url` is on disk.
    pub async fn lookup(&self, upstream_url: &str) -> Result<CachedFile> {
        let path = self.cache_key_for(upstream_url)?;
        Ok(stat(path).await)
    }

    /// Temp path beside `final_path`, with parent directories created.
    pub async fn prepare_paths_for(&self, final_path: &Path) -> Result<(PathBuf, PathBuf)> {
        let parent = final_path.parent().ok_or_else(|| {
            OffgridError::InvalidPath(format!("{} has no parent directory", final_path.display()))
        })?;
        tokio::fs::create_dir_all(parent).await?;

        let file_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let marker = format!(
            "{}-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S%f"),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let temp_path = parent.join(format!("{file_name}.{marker}.tmp"));

        Ok((temp_path, final_path.to_path_buf()))
    }

    /// Tee `source` into the cache while yielding its chunks unchanged.
    ///
    /// The final path appears only after the last chunk has been written and
    /// synced. Any source or write error ends the stream with
    /// [`OffgridError::DownloadFailed`] and removes the temp file; dropping
    /// the stream before the end does the same.
    pub async fn populate_while_streaming<S, E>(
        &self,
        upstream_url: &str,
        source: S,
    ) -> Result<ArtifactStream>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
        E: fmt::Display,
    {
        let final_path = self.cache_key_for(upstream_url)?;
        self.populate(upstream_url, final_path, source).await
    }

    /// Serve `upstream_url` from disk, or fetch it once and populate.
    ///
    /// On a miss the upstream body is written by a background task, so the
    /// download runs at upstream pace whatever the requesting client does.
    /// Every caller, the one that started the fetch included, tails the temp
    /// file as it grows. Callers arriving mid-download join the same flight.
    pub async fn fetch_through<F, Fut>(&self, upstream_url: &str, fetch: F) -> Result<Artifact>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Download>>,
    {
        let cached = self.lookup(upstream_url).await?;
        if cached.exists {
            debug!("Cache HIT for {}", upstream_url);
            return Ok(Artifact::Cached(cached));
        }

        let guard = loop {
            match self.flights.join(&cached.path) {
                Role::Leader(guard) => break guard,
                Role::Joiner(progress) => {
                    if let Some(artifact) = follow(upstream_url, &cached.path, progress).await {
                        return Ok(artifact);
                    }
                }
            }
        };

        let cached = stat(cached.path).await;
        if cached.exists {
            debug!("Cache HIT for {} after another download finished", upstream_url);
            guard.finish(cached.size.unwrap_or_default());
            return Ok(Artifact::Cached(cached));
        }

        debug!("Cache MISS for {}", upstream_url);
        let download = fetch().await?;
        let (temp_path, final_path) = self.prepare_paths_for(&cached.path).await?;
        let file = File::create(&temp_path).await?;
        let reader = match File::open(&temp_path).await {
            Ok(reader) => reader,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(e.into());
            }
        };

        guard.start(
            temp_path.clone(),
            download.content_type.clone(),
            download.content_length,
        );
        let progress = guard.subscribe();
        let writer = Populate::new(
            upstream_url,
            download.body,
            file,
            temp_path,
            final_path,
            Some(guard),
        );
        tokio::spawn(stream::unfold(writer, Populate::step).for_each(|_| async {}));

        Ok(Artifact::Streaming {
            content_type: download.content_type,
            content_length: download.content_length,
            body: Tail::new(upstream_url, reader, progress).into_stream(),
        })
    }

    /// Remove cached files. Missing files count as removed.
    ///
    /// Returns `false` if any removal failed; every path is still attempted.
    pub async fn delete_artifacts<I, P>(&self, paths: I) -> bool
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut all_removed = true;
        for path in paths {
            let path = path.as_ref();
            match tokio::fs::remove_file(path).await {
                Ok(()) => info!("Removed cached file {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to remove {}: {}", path.display(), e);
                    all_removed = false;
                }
            }
        }
        all_removed
    }

    /// Create directories (and parents). Returns `false` if any failed.
    pub async fn create_directories<I, P>(&self, dirs: I) -> bool
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut all_created = true;
        for dir in dirs {
            let dir = dir.as_ref();
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                warn!("Failed to create directory {}: {}", dir.display(), e);
                all_created = false;
            }
        }
        all_created
    }

    async fn populate<S, E>(
        &self,
        upstream_url: &str,
        final_path: PathBuf,
        source: S,
    ) -> Result<ArtifactStream>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
        E: fmt::Display,
    {
        let (temp_path, final_path) = self.prepare_paths_for(&final_path).await?;
        let file = File::create(&temp_path).await?;
        let state = Populate::new(upstream_url, source, file, temp_path, final_path, None);
        Ok(stream::unfold(state, Populate::step).boxed())
    }
}

/// Safe directory name for an origin, e.g. `https_files.pythonhosted.org`.
fn origin_segment(url: &Url) -> String {
    let mut segment = format!("{}_{}", url.scheme(), url.host_str().unwrap_or("unknown"));
    if let Some(port) = url.port() {
        segment.push_str(&format!("_{port}"));
    }
    segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

async fn stat(path: PathBuf) -> CachedFile {
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => CachedFile {
            exists: true,
            size: Some(meta.len()),
            human_size: Some(human_readable_size(meta.len())),
            path,
        },
        _ => CachedFile {
            exists: false,
            path,
            size: None,
            human_size: None,
        },
    }
}

/// Attach to a running flight.
///
/// `None` means the flight ended without leaving a file and the caller
/// should try again.
async fn follow(
    upstream_url: &str,
    final_path: &Path,
    mut progress: watch::Receiver<Progress>,
) -> Option<Artifact> {
    let started = progress
        .wait_for(|p| *p != Progress::Starting)
        .await
        .ok()?
        .clone();

    match started {
        Progress::Writing {
            temp_path,
            content_type,
            content_length,
            ..
        } => {
            let file = match File::open(&temp_path).await {
                Ok(file) => file,
                // Renamed or discarded since the progress was read
                Err(_) => return settled_artifact(final_path).await,
            };
            debug!("Streaming {} from an in-flight download", upstream_url);
            Some(Artifact::Streaming {
                content_type,
                content_length,
                body: Tail::new(upstream_url, file, progress).into_stream(),
            })
        }
        Progress::Done { .. } => settled_artifact(final_path).await,
        Progress::Starting | Progress::Failed(_) => None,
    }
}

async fn settled_artifact(final_path: &Path) -> Option<Artifact> {
    let cached = stat(final_path.to_path_buf()).await;
    cached.exists.then_some(Artifact::Cached(cached))
}

/// State threaded through the populate stream.
///
/// Each chunk is written as soon as it arrives but yielded one read later,
/// so the rename has already happened when the consumer gets the last chunk.
/// Consumers that stop polling after a known content length still leave a
/// complete artifact behind. The same lag applies to the byte count
/// published to a flight, so tailing readers never finish before the rename.
struct Populate {
    url: String,
    source: BoxStream<'static, std::result::Result<Bytes, String>>,
    file: Option<File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    written: u64,
    /// Written to disk, not yet yielded
    pending: Option<Bytes>,
    /// Error to report after `pending` has been yielded
    failure: Option<OffgridError>,
    finished: bool,
    committed: bool,
    flight: Option<FlightGuard>,
}

impl Populate {
    fn new<S, E>(
        url: &str,
        source: S,
        file: File,
        temp_path: PathBuf,
        final_path: PathBuf,
        flight: Option<FlightGuard>,
    ) -> Self
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
        E: fmt::Display,
    {
        debug!("Populating {} via {}", final_path.display(), temp_path.display());
        Self {
            url: url.to_string(),
            source: source.map(|chunk| chunk.map_err(|e| e.to_string())).boxed(),
            file: Some(file),
            temp_path,
            final_path,
            written: 0,
            pending: None,
            failure: None,
            finished: false,
            committed: false,
            flight,
        }
    }

    async fn step(mut self) -> Option<(Result<Bytes>, Self)> {
        if let Some(err) = self.failure.take() {
            return Some((Err(err), self));
        }
        if self.finished {
            return None;
        }

        loop {
            match self.source.next().await {
                Some(Ok(chunk)) => {
                    if let Err(e) = self.write(&chunk).await {
                        let reason = format!("writing {}: {}", self.temp_path.display(), e);
                        let err = self.fail(reason);
                        self.abandon().await;
                        return self.yield_pending_then(err);
                    }
                    if let Some(flight) = &self.flight {
                        flight.advance(self.written - chunk.len() as u64);
                    }
                    if let Some(previous) = self.pending.replace(chunk) {
                        return Some((Ok(previous), self));
                    }
                }
                Some(Err(reason)) => {
                    let err = self.fail(reason);
                    self.abandon().await;
                    return self.yield_pending_then(err);
                }
                None => {
                    if let Err(e) = self.commit().await {
                        let reason = format!("finalizing {}: {}", self.final_path.display(), e);
                        let err = self.fail(reason);
                        self.abandon().await;
                        return self.yield_pending_then(err);
                    }
                    return match self.pending.take() {
                        Some(last) => Some((Ok(last), self)),
                        None => None,
                    };
                }
            }
        }
    }

    fn yield_pending_then(mut self, err: OffgridError) -> Option<(Result<Bytes>, Self)> {
        match self.pending.take() {
            Some(previous) => {
                self.failure = Some(err);
                Some((Ok(previous), self))
            }
            None => Some((Err(err), self)),
        }
    }

    async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(file) => {
                file.write_all(chunk).await?;
                // Hand the bytes to the OS so tailing readers can see them
                file.flush().await?;
                self.written += chunk.len() as u64;
                Ok(())
            }
            None => Err(std::io::Error::other("temp file already closed")),
        }
    }

    async fn commit(&mut self) -> std::io::Result<()> {
        self.finished = true;
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&self.temp_path, &self.final_path).await?;
        self.committed = true;
        if let Some(flight) = &self.flight {
            flight.finish(self.written);
        }
        info!(
            "Cached {} ({}) at {}",
            self.url,
            human_readable_size(self.written),
            self.final_path.display()
        );
        Ok(())
    }

    fn fail(&mut self, reason: String) -> OffgridError {
        self.finished = true;
        if let Some(flight) = &self.flight {
            flight.fail(reason.clone());
        }
        OffgridError::DownloadFailed {
            url: self.url.clone(),
            reason,
        }
    }

    async fn abandon(&mut self) {
        self.file.take();
        if let Err(e) = tokio::fs::remove_file(&self.temp_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Failed to remove temp file {}: {}", self.temp_path.display(), e);
        }
    }
}

impl Drop for Populate {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some(flight) = &self.flight {
            flight.fail("download abandoned");
        }
        self.file.take();
        if std::fs::remove_file(&self.temp_path).is_ok() {
            debug!(
                "Discarded partial download of {} after {} bytes",
                self.url, self.written
            );
        }
    }
}

const TAIL_CHUNK: u64 = 64 * 1024;

/// Reader following a file that a [`Populate`] is still writing.
///
/// Reads never pass the published byte count; the stream ends once the
/// flight is done and everything has been read.
struct Tail {
    url: String,
    file: File,
    read: u64,
    progress: watch::Receiver<Progress>,
    closed: bool,
    done: bool,
}

impl Tail {
    fn new(url: &str, file: File, progress: watch::Receiver<Progress>) -> Self {
        Self {
            url: url.to_string(),
            file,
            read: 0,
            progress,
            closed: false,
            done: false,
        }
    }

    fn into_stream(self) -> ArtifactStream {
        stream::unfold(self, Tail::step).boxed()
    }

    async fn step(mut self) -> Option<(Result<Bytes>, Self)> {
        if self.done {
            return None;
        }

        loop {
            let (readable, finished, failure) = match &*self.progress.borrow_and_update() {
                Progress::Starting => (0, false, None),
                Progress::Writing { readable, .. } => (*readable, false, None),
                Progress::Done { size } => (*size, true, None),
                Progress::Failed(reason) => (0, true, Some(reason.clone())),
            };

            if let Some(reason) = failure {
                return self.fail(reason);
            }

            if self.read < readable {
                let want = (readable - self.read).min(TAIL_CHUNK) as usize;
                let mut buf = vec![0u8; want];
                return match self.file.read(&mut buf).await {
                    Ok(0) => {
                        let reason = format!("cache file ended at {} of {} bytes", self.read, readable);
                        self.fail(reason)
                    }
                    Ok(n) => {
                        buf.truncate(n);
                        self.read += n as u64;
                        Some((Ok(Bytes::from(buf)), self))
                    }
                    Err(e) => self.fail(format!("reading in-flight download: {e}")),
                };
            }

            if finished {
                return None;
            }
            if self.closed {
                return self.fail("download stopped without finishing".to_string());
            }
            if self.progress.changed().await.is_err() {
                self.closed = true;
            }
        }
    }

    fn fail(mut self, reason: String) -> Option<(Result<Bytes>, Self)> {
        self.done = true;
        let err = OffgridError::DownloadFailed {
            url: self.url.clone(),
            reason,
        };
        Some((Err(err), self))
    }
}
