use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, LOCATION};
use reqwest::{redirect, Body, Certificate, Client, RequestBuilder, Response};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, Credentials};
use crate::error::{Result, WebDavError};
use crate::models::FileEntry;
use crate::webdav_xml_parser::{parse_propfind_response, strip_base_path};

use super::common::build_user_agent;
use super::paths::PathResolver;
use super::progress::TransferProgress;
use super::status::{check_status, DavMethod, ExpectedStatus};
use super::transfer::{
    copy_chunked, response_reader, CompletionGuard, TransferCallbacks, TransferOptions, CHUNK_SIZE,
};

/// Redirects `ls` follows before giving up
pub const MAX_LS_REDIRECTS: usize = 5;

const PUT_EXPECTED: [u16; 3] = [200, 201, 204];

/// HTTP client plus credentials; cheap to clone into background tasks
#[derive(Clone)]
struct Transport {
    http: Client,
    credentials: Option<Credentials>,
}

impl Transport {
    fn request(&self, method: DavMethod, url: &str) -> RequestBuilder {
        let request = self.http.request(method.to_reqwest(), url);
        match &self.credentials {
            Some(Credentials::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            Some(Credentials::Header(value)) => request.header(AUTHORIZATION, value.as_str()),
            None => request,
        }
    }

    /// Sends one request and enforces the status contract. No retries.
    async fn send(
        &self,
        method: DavMethod,
        url: &str,
        path: &str,
        expected: impl Into<ExpectedStatus>,
        build: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> Result<Response> {
        debug!("📤 {} {}", method, url);
        let response = build(self.request(method, url)).send().await?;
        let status = response.status();
        debug!(
            "📥 {} {} -> {} {}",
            method,
            url,
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        );
        check_status(method, path, expected, status.as_u16())?;
        Ok(response)
    }

    async fn download_into<W>(
        &self,
        url: &str,
        path: &str,
        writer: &mut W,
        options: TransferOptions,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let response = match self.send(DavMethod::Get, url, path, 200u16, |r| r).await {
            Ok(response) => response,
            Err(e) => return Err(options.fail(e)),
        };
        Self::stream_body(response, path, writer, options).await
    }

    async fn stream_body<W>(
        response: Response,
        path: &str,
        writer: &mut W,
        options: TransferOptions,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let expected_len = response.content_length();
        info!("⬇️ Downloading {} ({:?} bytes)", path, expected_len);

        copy_chunked(
            response_reader(response),
            writer,
            options.expected_len(expected_len),
        )
        .await
    }

    /// Downloads into a local file. The file is only created or truncated
    /// once the server has answered 200, and it is flushed and closed before
    /// the caller's completion callback sees the outcome.
    async fn download_to_file(
        &self,
        url: &str,
        path: &str,
        local_path: &Path,
        progress: Option<Arc<TransferProgress>>,
        mut callbacks: TransferCallbacks,
    ) -> Result<u64> {
        let outer = CompletionGuard::new(callbacks.on_complete.take());
        let mut options = TransferOptions::new().callbacks(callbacks);
        if let Some(progress) = progress {
            options = options.progress(progress);
        }

        let response = match self.send(DavMethod::Get, url, path, 200u16, |r| r).await {
            Ok(response) => response,
            Err(e) => return Err(options.fail(e)),
        };

        let mut file = match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(local_path)
            .await
        {
            Ok(file) => file,
            Err(e) => {
                drop(response);
                return Err(options.fail(e.into()));
            }
        };

        let result = Self::stream_body(response, path, &mut file, options).await;
        drop(file);

        outer.complete(result.is_ok());
        result
    }

    async fn upload_body(&self, url: &str, path: &str, body: Body, len: Option<u64>) -> Result<()> {
        self.send(DavMethod::Put, url, path, PUT_EXPECTED, |r| {
            let r = match len {
                Some(len) => r.header(CONTENT_LENGTH, len),
                None => r,
            };
            r.body(body)
        })
        .await?;
        Ok(())
    }

    /// Streams a local file with every chunk reported to `progress`
    async fn upload_tracked(
        &self,
        url: &str,
        path: &str,
        local_path: &Path,
        progress: Arc<TransferProgress>,
        callbacks: TransferCallbacks,
    ) -> Result<u64> {
        let completion = CompletionGuard::new(callbacks.on_complete);
        let on_progress = Mutex::new(callbacks.on_progress);

        let result: Result<u64> = async {
            let file = File::open(local_path).await?;
            let len = file.metadata().await?.len();
            progress.set_total_length(Some(len));
            info!("⬆️ Uploading {} ({} bytes)", path, len);

            let gate = progress.gate().clone();
            let counter = Arc::clone(&progress);
            let stream = ReaderStream::with_capacity(file, CHUNK_SIZE)
                .then(move |chunk| {
                    let gate = gate.clone();
                    async move {
                        gate.wait_open().await;
                        chunk
                    }
                })
                .inspect_ok(move |chunk| {
                    counter.add_bytes(chunk.len() as u64);
                    let mut on_progress = on_progress.lock().unwrap_or_else(|p| p.into_inner());
                    if let Some(callback) = on_progress.as_mut() {
                        callback(chunk.len() as u64);
                    }
                });

            self.upload_body(url, path, Body::wrap_stream(stream), Some(len)).await?;

            let sent = progress.bytes_transferred();
            if sent != len {
                return Err(WebDavError::ShortTransfer {
                    expected: len,
                    actual: sent,
                });
            }
            Ok(sent)
        }
        .await;

        progress.finish(result.is_ok());
        match &result {
            Ok(sent) => info!("Upload of {} complete: {} bytes", path, sent),
            Err(e) => warn!("Upload of {} failed: {}", path, e),
        }
        completion.complete(result.is_ok());
        result
    }
}

/// WebDAV client session.
///
/// Holds the base URL and a current working directory; relative operation
/// paths resolve against it. `cd` needs `&mut self`, so directory changes are
/// serialized per client by the borrow checker.
#[derive(Clone)]
pub struct WebDavClient {
    transport: Transport,
    config: ClientConfig,
    paths: PathResolver,
}

impl WebDavClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let mut builder = Client::builder()
            .redirect(redirect::Policy::none())
            .user_agent(build_user_agent());

        if let Some(timeout) = config.timeout() {
            builder = builder.timeout(timeout);
        }

        if let Some(path) = &config.ca_cert_path {
            let pem = std::fs::read(path).map_err(|e| {
                WebDavError::Config(format!("cannot read CA certificate {}: {}", path.display(), e))
            })?;
            let cert = Certificate::from_pem(&pem)
                .map_err(|e| {
                    WebDavError::Config(format!("invalid CA certificate {}: {}", path.display(), e))
                })?;
            builder = builder.add_root_certificate(cert);
        }

        if !config.verify_tls {
            warn!("TLS certificate verification is disabled for {}", config.server_url);
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder
            .build()
            .map_err(|e| WebDavError::Config(format!("cannot build HTTP client: {}", e)))?;

        let paths = PathResolver::new(&config.server_url, &config.base_path());
        info!("WebDAV client ready for {}", config.server_url);

        Ok(Self {
            transport: Transport {
                http,
                credentials: config.credentials.clone(),
            },
            config,
            paths,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn base_url(&self) -> &str {
        self.paths.base_url()
    }

    pub fn cwd(&self) -> &str {
        self.paths.cwd()
    }

    /// Request URL for an operation path
    pub fn url_for(&self, path: &str) -> String {
        self.paths.resolve(path)
    }

    pub fn cd(&mut self, path: &str) {
        self.paths.change_directory(path);
        debug!("cwd is now {}", self.paths.cwd());
    }

    async fn send(
        &self,
        method: DavMethod,
        path: &str,
        expected: impl Into<ExpectedStatus>,
        build: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> Result<Response> {
        let url = self.paths.resolve(path);
        self.transport.send(method, &url, path, expected, build).await
    }

    /// Creates a collection. With `safe`, an existing one (301/405) is not an error.
    pub async fn mkdir(&self, path: &str, safe: bool) -> Result<()> {
        Self::mkdir_at(&self.transport, &self.paths, path, safe).await
    }

    async fn mkdir_at(
        transport: &Transport,
        paths: &PathResolver,
        path: &str,
        safe: bool,
    ) -> Result<()> {
        let expected: ExpectedStatus = if safe {
            [201u16, 301, 405].into()
        } else {
            201u16.into()
        };
        let url = paths.resolve(path);
        transport.send(DavMethod::Mkcol, &url, path, expected, |r| r).await?;
        Ok(())
    }

    /// Creates every missing collection along `path`.
    ///
    /// Walks a copy of the session's directory state, so the working
    /// directory is unchanged afterwards whether the walk succeeds, fails or
    /// is dropped midway.
    pub async fn mkdirs(&self, path: &str) -> Result<()> {
        let mut dirs: Vec<String> = path
            .split('/')
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect();
        if dirs.is_empty() {
            return Ok(());
        }
        if path.starts_with('/') {
            dirs[0] = format!("/{}", dirs[0]);
        }

        let mut walk = self.paths.clone();
        for dir in &dirs {
            match Self::mkdir_at(&self.transport, &walk, dir, true).await {
                Ok(()) => debug!(
                    "Created collection {}{}",
                    walk.cwd(),
                    dir.trim_start_matches('/')
                ),
                Err(e) if e.status_code() == Some(409) => return Err(e),
                Err(WebDavError::Operation(e)) => {
                    debug!("Ignoring {} for existing collection {}", e.actual, dir)
                }
                Err(e) => return Err(e),
            }
            walk.change_directory(dir);
        }
        Ok(())
    }

    /// Removes a collection. With `safe`, a missing one (404) is not an error.
    pub async fn rmdir(&self, path: &str, safe: bool) -> Result<()> {
        let path = format!("{}/", path.trim().trim_end_matches('/'));
        let expected: ExpectedStatus = if safe { [204u16, 404].into() } else { 204u16.into() };
        self.send(DavMethod::Delete, &path, expected, |r| r).await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.send(DavMethod::Delete, path, 204u16, |r| r).await?;
        Ok(())
    }

    /// True unless the server answers HEAD with 404
    pub async fn exists(&self, path: &str) -> Result<bool> {
        let response = self.send(DavMethod::Head, path, [200u16, 301, 404], |r| r).await?;
        Ok(response.status().as_u16() != 404)
    }

    /// Lists a collection with a depth-1 PROPFIND, following up to
    /// [`MAX_LS_REDIRECTS`] permanent redirects.
    pub async fn ls(&self, path: &str) -> Result<Vec<FileEntry>> {
        let base_path = self.paths.base_path();
        let mut path = path.to_string();

        for _ in 0..=MAX_LS_REDIRECTS {
            let url = self.paths.resolve(&path);
            let response = self
                .transport
                .send(DavMethod::Propfind, &url, &path, [207u16, 301], |r| r.header("Depth", "1"))
                .await?;

            if response.status().as_u16() == 301 {
                let target = Self::redirect_path(&response, &url, base_path)
                    .ok_or_else(|| WebDavError::MissingLocation { path: path.clone() })?;
                info!("↪️ Listing {} redirected to {}", path, target);
                path = target;
                continue;
            }

            let body = response.bytes().await?;
            return parse_propfind_response(&body, base_path);
        }

        Err(WebDavError::TooManyRedirects {
            path,
            limit: MAX_LS_REDIRECTS,
        })
    }

    /// Absolute operation path of a 301 target, relative to the base path
    fn redirect_path(response: &Response, request_url: &str, base_path: &str) -> Option<String> {
        let location = response.headers().get(LOCATION)?.to_str().ok()?;
        let target = url::Url::parse(request_url).ok()?.join(location).ok()?;
        let path = strip_base_path(target.path(), base_path);
        Some(if path.is_empty() { "/".to_string() } else { path })
    }

    /// Uploads a local file as a streamed request body
    pub async fn upload(&self, local_path: impl AsRef<Path>, remote_path: &str) -> Result<()> {
        let file = File::open(local_path.as_ref()).await?;
        let len = file.metadata().await?.len();
        info!(
            "⬆️ Uploading {} to {} ({} bytes)",
            local_path.as_ref().display(),
            remote_path,
            len
        );
        let body = Body::wrap_stream(ReaderStream::with_capacity(file, CHUNK_SIZE));
        let url = self.paths.resolve(remote_path);
        self.transport.upload_body(&url, remote_path, body, Some(len)).await
    }

    /// Uploads everything `reader` yields
    pub async fn upload_from<R>(&self, reader: R, remote_path: &str) -> Result<()>
    where
        R: AsyncRead + Send + Sync + 'static,
    {
        let body = Body::wrap_stream(ReaderStream::with_capacity(reader, CHUNK_SIZE));
        let url = self.paths.resolve(remote_path);
        self.transport.upload_body(&url, remote_path, body, None).await
    }

    pub async fn upload_bytes(&self, data: impl Into<Bytes>, remote_path: &str) -> Result<()> {
        let data: Bytes = data.into();
        let len = data.len() as u64;
        let url = self.paths.resolve(remote_path);
        self.transport.upload_body(&url, remote_path, Body::from(data), Some(len)).await
    }

    /// Downloads into a local file, returning the number of bytes written
    pub async fn download(&self, remote_path: &str, local_path: impl AsRef<Path>) -> Result<u64> {
        let url = self.paths.resolve(remote_path);
        self.transport
            .download_to_file(
                &url,
                remote_path,
                local_path.as_ref(),
                None,
                TransferCallbacks::new(),
            )
            .await
    }

    /// Downloads into any async writer
    pub async fn download_to<W>(&self, remote_path: &str, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        self.download_with(remote_path, writer, TransferCallbacks::new()).await
    }

    /// Downloads into any async writer, reporting through `callbacks`
    pub async fn download_with<W>(
        &self,
        remote_path: &str,
        writer: &mut W,
        callbacks: TransferCallbacks,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let url = self.paths.resolve(remote_path);
        self.transport
            .download_into(&url, remote_path, writer, TransferOptions::new().callbacks(callbacks))
            .await
    }

    /// Starts a download on a separate task and returns its progress at once.
    ///
    /// Must be called from within a tokio runtime.
    pub fn background_download(
        &self,
        remote_path: &str,
        local_path: impl Into<PathBuf>,
        callbacks: TransferCallbacks,
    ) -> Arc<TransferProgress> {
        let progress = Arc::new(TransferProgress::new(None));
        let transport = self.transport.clone();
        let url = self.paths.resolve(remote_path);
        let path = remote_path.to_string();
        let local_path = local_path.into();
        let task_progress = Arc::clone(&progress);

        let handle = tokio::spawn(async move {
            transport
                .download_to_file(&url, &path, &local_path, Some(task_progress), callbacks)
                .await
        });
        progress.attach_task(handle);
        progress
    }

    /// Like [`background_download`](Self::background_download), into any owned writer
    pub fn background_download_to<W>(
        &self,
        remote_path: &str,
        mut writer: W,
        callbacks: TransferCallbacks,
    ) -> Arc<TransferProgress>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let progress = Arc::new(TransferProgress::new(None));
        let transport = self.transport.clone();
        let url = self.paths.resolve(remote_path);
        let path = remote_path.to_string();
        let options = TransferOptions::new()
            .progress(Arc::clone(&progress))
            .callbacks(callbacks);

        let handle = tokio::spawn(async move {
            transport.download_into(&url, &path, &mut writer, options).await
        });
        progress.attach_task(handle);
        progress
    }

    /// Starts an upload on a separate task and returns its progress at once.
    ///
    /// Must be called from within a tokio runtime.
    pub fn background_upload(
        &self,
        local_path: impl Into<PathBuf>,
        remote_path: &str,
        callbacks: TransferCallbacks,
    ) -> Arc<TransferProgress> {
        let progress = Arc::new(TransferProgress::new(None));
        let transport = self.transport.clone();
        let url = self.paths.resolve(remote_path);
        let path = remote_path.to_string();
        let local_path = local_path.into();
        let task_progress = Arc::clone(&progress);

        let handle = tokio::spawn(async move {
            transport
                .upload_tracked(&url, &path, &local_path, task_progress, callbacks)
                .await
        });
        progress.attach_task(handle);
        progress
    }
}

impl std::fmt::Debug for WebDavClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebDavClient")
            .field("base_url", &self.paths.base_url())
            .field("cwd", &self.paths.cwd())
            .finish()
    }
}
