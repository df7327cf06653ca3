//! Download engine
//!
//! The scheduler that multiplexes many jobs over many transports on one
//! control thread. Jobs are enqueued with [`DownloadEngine::submit`] and
//! driven to a terminal item state by [`DownloadEngine::run_until_idle`],
//! which cooperatively interleaves connects, writes and reads of all
//! outstanding jobs so one stalling upstream never blocks a ready one.

use crate::config::EngineConfig;
use crate::error::{EngineError, PolicyErrorKind, Result, TransportErrorKind};
use crate::http::{BodyFraming, RequestPlan, ResponseHead, ResponseParser};
use crate::item::{DownloadItem, ItemStatus, SinkVerdict};
use crate::pool::ConnectionPool;
use crate::transport::{Connector, TcpConnector, Transport, TransportKey};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use url::Url;

const READ_BUF_SIZE: usize = 16 * 1024;

/// One request to fetch a URL into an item
pub struct Job {
    url: Url,
    item: Arc<DownloadItem>,
    proxy: Option<Url>,
    resume_offset: u64,
    redirect_budget: Option<usize>,
    origin_host: Option<String>,
}

impl Job {
    /// Create a job for an absolute http/https URL.
    ///
    /// Fails synchronously, before any I/O, on anything unparsable.
    pub fn new(url: &str, item: Arc<DownloadItem>) -> Result<Self> {
        let url = Url::parse(url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(EngineError::invalid_input(
                "url",
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(EngineError::invalid_input("url", "missing host"));
        }
        Ok(Self {
            url,
            item,
            proxy: None,
            resume_offset: 0,
            redirect_budget: None,
            origin_host: None,
        })
    }

    /// Route this job through an HTTP proxy, overriding the engine default
    pub fn via_proxy(mut self, proxy: &str) -> Result<Self> {
        let proxy = Url::parse(proxy)?;
        if proxy.scheme() != "http" {
            return Err(EngineError::invalid_input(
                "proxy",
                "only http:// proxies are supported",
            ));
        }
        self.proxy = Some(proxy);
        Ok(self)
    }

    /// Resume from a byte offset; emits a `Range` header
    pub fn resume_from(mut self, offset: u64) -> Self {
        self.resume_offset = offset;
        self
    }

    /// Override the engine's redirect budget for this job
    pub fn redirect_budget(mut self, hops: usize) -> Self {
        self.redirect_budget = Some(hops);
        self
    }

    /// Present a different hostname in `Host` and SNI than the dialed one
    pub fn origin_host(mut self, host: impl Into<String>) -> Self {
        self.origin_host = Some(host.into());
        self
    }

    pub fn item(&self) -> &Arc<DownloadItem> {
        &self.item
    }
}

/// Retry backoff with exponential growth and jitter
#[derive(Debug, Clone)]
struct RetryPolicy {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms.saturating_mul(2u64.pow(attempt.min(10)));
        let capped = base.min(self.max_delay_ms);
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * self.jitter_factor;
        Duration::from_millis((capped as f64 * (1.0 + jitter)).max(0.0) as u64)
    }
}

/// What one successful upstream conversation produced
enum Outcome {
    /// Item reached a terminal success state
    Done,
    /// Follow this URL next, same item, same budget
    Redirect(Url),
}

/// The scheduler driving all outstanding jobs over pooled transports.
///
/// One engine instance belongs to one control thread: `submit` and
/// `run_until_idle` are not meant to race from multiple threads. Separate
/// engines on separate threads are fine.
pub struct DownloadEngine {
    config: EngineConfig,
    pool: ConnectionPool,
    connector: Arc<dyn Connector>,
    default_proxy: Option<Url>,
    pending: Mutex<Vec<Job>>,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl DownloadEngine {
    /// Create an engine dialing real TCP/TLS transports
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(TcpConnector))
    }

    /// Create an engine with a custom transport opener (tests, local
    /// maintenance sockets)
    pub fn with_connector(config: EngineConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let default_proxy = match config.http.proxy_url {
            Some(ref raw) => Some(Url::parse(raw)?),
            None => None,
        };
        Ok(Self {
            pool: ConnectionPool::new(config.pool.clone()),
            retry: RetryPolicy {
                initial_delay_ms: config.http.retry_delay_ms,
                max_delay_ms: config.http.max_retry_delay_ms,
                jitter_factor: 0.25,
            },
            connector,
            default_proxy,
            pending: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Enqueue a job. Never blocks and performs no I/O.
    pub fn submit(&self, job: Job) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        tracing::debug!(url = %job.url, "job submitted");
        self.pending.lock().push(job);
        Ok(())
    }

    /// Drive every outstanding job until none remains.
    ///
    /// The only blocking call in the public surface: it parks the calling
    /// task and multiplexes all jobs' connect/read/write progress
    /// internally. Returns once every submitted item reached a terminal
    /// state (or the engine was shut down).
    pub async fn run_until_idle(&self) {
        let mut inflight = FuturesUnordered::new();
        loop {
            for job in self.pending.lock().drain(..) {
                inflight.push(self.drive_job(job));
            }
            if inflight.next().await.is_none() && self.pending.lock().is_empty() {
                break;
            }
        }
    }

    /// Fail outstanding jobs and drop all pooled transports. Subsequent
    /// `submit` calls are refused.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.pool.clear();
    }

    /// Drive one job to a terminal item state, recording failures on the
    /// item. Never propagates errors: the item is the observable result.
    async fn drive_job(&self, job: Job) {
        let item = Arc::clone(&job.item);

        let fut = self.drive_job_inner(&job);
        let result = match self.config.http.job_deadline() {
            Some(deadline) => tokio::select! {
                _ = self.shutdown.cancelled() => Err(EngineError::Cancelled),
                r = tokio::time::timeout(deadline, fut) => {
                    r.unwrap_or_else(|_| Err(EngineError::timeout("job deadline exceeded")))
                }
            },
            None => tokio::select! {
                _ = self.shutdown.cancelled() => Err(EngineError::Cancelled),
                r = fut => r,
            },
        };

        match result {
            Ok(()) => tracing::debug!(url = %job.url, "job finished"),
            Err(e) => {
                tracing::debug!(url = %job.url, error = %e, "job failed");
                item.fail(e.reason());
            }
        }
    }

    async fn drive_job_inner(&self, job: &Job) -> Result<()> {
        // Reusing a finished item at its final size is a no-op resume.
        match job.item.status() {
            ItemStatus::Complete if job.resume_offset == job.item.bytes_checked() => {
                return Ok(());
            }
            ItemStatus::Inited => {}
            _ => {
                job.item.setup();
            }
        }

        let proxy = job.proxy.as_ref().or(self.default_proxy.as_ref());
        let mut budget = job
            .redirect_budget
            .unwrap_or(self.config.http.max_redirects);
        let mut current_url = job.url.clone();

        loop {
            match self.attempt_fetch(&current_url, proxy, job).await? {
                Outcome::Done => return Ok(()),
                Outcome::Redirect(next) => {
                    if budget == 0 {
                        return Err(EngineError::Policy {
                            kind: PolicyErrorKind::TooManyRedirects,
                        });
                    }
                    budget -= 1;
                    tracing::debug!(from = %current_url, to = %next, left = budget, "following redirect");
                    current_url = next;
                }
            }
        }
    }

    /// Fetch one URL, transparently retrying on a fresh transport while no
    /// byte of the response has been consumed.
    async fn attempt_fetch(
        &self,
        url: &Url,
        proxy: Option<&Url>,
        job: &Job,
    ) -> Result<Outcome> {
        let key = endpoint_for(url, proxy)?;
        let mut retries_left = self.config.http.max_retries;
        let mut attempt: u32 = 0;
        let mut try_pool = true;

        loop {
            let pooled = if try_pool { self.pool.acquire(&key) } else { None };
            let reused = pooled.is_some();
            let checkout: Result<Transport> = match pooled {
                Some(t) => Ok(t),
                None => {
                    self.connector
                        .open(&key, job.origin_host.as_deref(), &self.config.http)
                        .await
                }
            };

            let mut consumed = false;
            let error = match checkout {
                Ok(mut transport) => {
                    match self
                        .converse(&mut transport, url, proxy, job, &mut consumed)
                        .await
                    {
                        Ok((outcome, reusable)) => {
                            if reusable && self.config.http.persistent_connections {
                                self.pool.release(transport);
                            } else {
                                self.pool.invalidate(transport);
                            }
                            return Ok(outcome);
                        }
                        Err(e) => {
                            self.pool.invalidate(transport);
                            e
                        }
                    }
                }
                Err(e) => e,
            };

            if consumed || !error.is_retryable() {
                return Err(error);
            }
            if reused {
                // A dead pooled transport does not count against the retry
                // budget; dial a fresh one right away.
                tracing::debug!(peer = %key, "pooled transport failed on reuse, dialing fresh");
                try_pool = false;
                continue;
            }
            if retries_left == 0 {
                return Err(error);
            }
            retries_left -= 1;
            let delay = self.retry.delay_for_attempt(attempt);
            attempt += 1;
            tracing::debug!(peer = %key, error = %error, delay_ms = delay.as_millis() as u64, "retrying after transport failure");
            tokio::time::sleep(delay).await;
            try_pool = false;
        }
    }

    /// One request/response exchange on an established transport.
    ///
    /// Returns the outcome and whether the transport finished in a state
    /// clean enough to pool. `consumed` flips once any response byte
    /// arrived; past that point the caller must not retry transparently.
    async fn converse(
        &self,
        transport: &mut Transport,
        url: &Url,
        proxy: Option<&Url>,
        job: &Job,
        consumed: &mut bool,
    ) -> Result<(Outcome, bool)> {
        let plan = RequestPlan {
            url,
            proxy,
            range_from: job.resume_offset,
            user_agent: &self.config.user_agent,
            origin_host: job.origin_host.as_deref(),
            keep_alive: self.config.http.persistent_connections,
        };
        let request = plan.serialize();
        transport.write_all(request.as_bytes()).await?;
        transport.flush().await?;

        // Header phase: accumulate reads until the head completes.
        let mut parser = ResponseParser::new();
        let mut buf = vec![0u8; READ_BUF_SIZE];
        let head = loop {
            let n = self.timed_read(transport, &mut buf).await?;
            if n == 0 {
                return Err(EngineError::transport(
                    TransportErrorKind::UnexpectedEof,
                    "connection closed before response header",
                ));
            }
            *consumed = true;
            if let Some(head) = parser.feed(&buf[..n])? {
                break head;
            }
        };

        // Redirects continue the same job; the item is not touched.
        if head.is_redirect() {
            if let Some(location) = head.location() {
                let next = url
                    .join(location)
                    .map_err(|e| EngineError::parse(format!("bad Location target: {e}")))?;
                // Only a provably empty keep-alive response leaves the
                // transport in a reusable position.
                let reusable = head.keep_alive()
                    && head.content_length() == Some(0)
                    && !head.is_chunked()
                    && parser.take_leftover().is_empty();
                return Ok((Outcome::Redirect(next), reusable));
            }
            return Err(EngineError::parse(format!(
                "redirect status {} without Location",
                head.status
            )));
        }

        if !head.is_success() {
            // Callers inspect the status off the item afterwards.
            job.item.note_header(head.clone());
            return Err(EngineError::Policy {
                kind: PolicyErrorKind::HttpStatus(head.status),
            });
        }

        self.stream_body(transport, head, parser, job).await
    }

    /// Deliver a terminal 2xx response's body into the item.
    async fn stream_body(
        &self,
        transport: &mut Transport,
        head: ResponseHead,
        mut parser: ResponseParser,
        job: &Job,
    ) -> Result<(Outcome, bool)> {
        // A 200 to a ranged request means the upstream restarted from the
        // beginning; deliver the full body with counters starting at zero.
        let resume_from = if head.status == 206 {
            job.resume_offset
        } else {
            0
        };
        let size_hint = match head.status {
            206 => head
                .content_range_total()
                .or_else(|| head.content_length().map(|l| l + resume_from)),
            _ => head.content_length(),
        };

        let verdict = job.item.store_header(
            head.clone(),
            size_hint,
            head.content_range(),
            job.resume_offset == 0,
            resume_from,
        );
        match verdict {
            SinkVerdict::Continue => {}
            SinkVerdict::Abort => {
                return Err(EngineError::Policy {
                    kind: PolicyErrorKind::Aborted,
                })
            }
            SinkVerdict::Error => {
                return Err(EngineError::sink("item rejected response header"));
            }
        }

        // Bodyless statuses end right here regardless of framing headers.
        let mut framing = if matches!(head.status, 204 | 304) {
            BodyFraming::Length(0)
        } else {
            BodyFraming::for_response(&head)
        };

        let mut payload = Vec::with_capacity(READ_BUF_SIZE);
        let leftover = parser.take_leftover();
        let mut complete = framing.decode(&leftover, &mut payload)?;
        self.deliver(job, &payload)?;

        let mut buf = vec![0u8; READ_BUF_SIZE];
        while !complete {
            let n = self.timed_read(transport, &mut buf).await?;
            if n == 0 {
                if framing.eof_is_clean() {
                    break;
                }
                return Err(EngineError::transport(
                    TransportErrorKind::UnexpectedEof,
                    "connection closed mid-body",
                ));
            }
            payload.clear();
            complete = framing.decode(&buf[..n], &mut payload)?;
            self.deliver(job, &payload)?;
        }

        // Explicit end-of-body signal completes the item.
        if !job.item.store_data(&[]) {
            return Err(EngineError::sink("item sink failed on completion"));
        }

        // A close-delimited body consumed the connection by definition.
        let reusable = complete && head.keep_alive();
        Ok((Outcome::Done, reusable))
    }

    fn deliver(&self, job: &Job, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        if !job.item.store_data(payload) {
            return Err(EngineError::sink("item sink rejected body data"));
        }
        Ok(())
    }

    /// Read with the idle timeout applied; timing out invalidates the
    /// transport via the caller's error path.
    async fn timed_read(&self, transport: &mut Transport, buf: &mut [u8]) -> Result<usize> {
        match tokio::time::timeout(self.config.http.read_timeout(), transport.read(buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(EngineError::timeout(format!(
                "no data from {} within the read timeout",
                transport.key()
            ))),
        }
    }
}

/// Where to dial for a URL, honoring an optional HTTP proxy
fn endpoint_for(url: &Url, proxy: Option<&Url>) -> Result<TransportKey> {
    if let Some(proxy) = proxy {
        if url.scheme() == "https" {
            // Would need CONNECT tunneling, which this engine does not do.
            return Err(EngineError::invalid_input(
                "proxy",
                "https targets through an http proxy are not supported",
            ));
        }
        let host = proxy
            .host_str()
            .ok_or_else(|| EngineError::invalid_input("proxy", "missing host"))?;
        return Ok(TransportKey::new(
            host,
            proxy.port_or_known_default().unwrap_or(80),
            false,
        ));
    }
    let secure = url.scheme() == "https";
    let host = url
        .host_str()
        .ok_or_else(|| EngineError::invalid_input("url", "missing host"))?;
    let port = url
        .port_or_known_default()
        .unwrap_or(if secure { 443 } else { 80 });
    Ok(TransportKey::new(host, port, secure))
}
