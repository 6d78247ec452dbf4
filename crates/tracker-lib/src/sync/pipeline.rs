//! Statement pipeline facade
//!
//! Owns the delivery queue, backoff state, online flag, retry timer and
//! credential provider. Application code calls [`Pipeline::enqueue`] and
//! [`Pipeline::flush`]; everything else happens in the background.
//!
//! Batch sends are single-flight: a send gate serializes every attempt.
//! Threshold and timer sends skip their attempt when the gate is taken,
//! while `flush` waits for the in-flight send and continues from the
//! offset it left behind.

use super::backoff::Backoff;
use super::backup::BackupMirror;
use super::queue::{Batch, DeliveryQueue};
use super::scheduler::RetryScheduler;
use super::transport::{HttpTransport, Transport};
use crate::auth::{provider_from_config, CredentialProvider};
use crate::config::PipelineConfig;
use crate::error::{DeliveryError, FlushError, PipelineError};
use crate::health::{Component, HealthRegistry, HealthResponse};
use crate::models::{Record, Statement, StatementFactory};
use crate::observability::{init_tracing, PipelineMetrics, StructuredLogger};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::debug;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handle returned once a record is buffered
#[derive(Debug, Clone)]
pub struct EnqueueReceipt {
    position: usize,
    delivered: watch::Receiver<usize>,
}

impl EnqueueReceipt {
    /// Queue index of the buffered record
    pub fn position(&self) -> usize {
        self.position
    }

    /// Whether the primary collector has accepted the record
    pub fn is_delivered(&self) -> bool {
        *self.delivered.borrow() > self.position
    }

    /// Resolve once the primary collector has accepted the record
    pub async fn delivered(mut self) -> Result<(), PipelineError> {
        let position = self.position;
        self.delivered
            .wait_for(|offset| *offset > position)
            .await
            .map(|_| ())
            .map_err(|_| PipelineError::Closed)
    }
}

/// Outcome of a successful flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// Statements the primary collector accepted during this flush
    pub sent: usize,
    pub delivered_offset: usize,
    pub pending: usize,
    /// Number of records mirrored, `None` without a backup sink or buffer
    pub mirrored: Option<usize>,
}

/// Point-in-time view of the pipeline
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub queued: usize,
    pub delivered: usize,
    pub pending: usize,
    pub online: bool,
    pub retry_delay: Option<Duration>,
    pub batches_sent: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

/// Mutable delivery state, only touched under its lock
struct SenderState {
    queue: DeliveryQueue,
    backoff: Backoff,
    online: bool,
    batches_sent: u64,
    failures: u64,
    last_error: Option<String>,
}

struct Inner {
    config: PipelineConfig,
    factory: StatementFactory,
    credentials: Arc<dyn CredentialProvider>,
    transport: Arc<dyn Transport>,
    mirror: Option<BackupMirror>,
    state: Mutex<SenderState>,
    send_gate: Mutex<()>,
    scheduler: RetryScheduler,
    delivered_tx: watch::Sender<usize>,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
    health: HealthRegistry,
}

/// Buffered, batched statement delivery
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    /// Build a pipeline over HTTP with the credential selected by `config`
    pub async fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        if config.debug() {
            init_tracing(true);
        }

        let client = reqwest::Client::builder().build()?;
        let logger = StructuredLogger::new(config.actor().name.clone());
        let credentials = provider_from_config(config.auth(), client.clone(), logger);
        let transport = Arc::new(HttpTransport::new(
            client,
            config.endpoint().clone(),
            config.backup().cloned(),
        ));
        Ok(Self::with_parts(config, transport, credentials).await)
    }

    /// Build a pipeline over a caller-supplied transport and credential
    pub async fn with_parts(
        config: PipelineConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let logger = StructuredLogger::new(config.actor().name.clone());
        let metrics = PipelineMetrics::new();
        let health = HealthRegistry::new();

        health.track(Component::PrimarySink).await;
        health.track(Component::Credentials).await;
        let mirror = config.backup().map(|backup| {
            BackupMirror::new(
                backup.format,
                transport.clone(),
                credentials.clone(),
                logger.clone(),
            )
        });
        if mirror.is_some() {
            health.track(Component::BackupSink).await;
        }

        let online = credentials.is_available().await;
        if !online {
            health
                .degraded(Component::Credentials, "Not logged in")
                .await;
        }
        metrics.set_online(online);
        metrics.set_pending(0);
        metrics.set_retry_delay(None);

        logger.log_startup(
            env!("CARGO_PKG_VERSION"),
            config.endpoint().as_str(),
            config.batch_size(),
            mirror.is_some(),
        );

        let (delivered_tx, _) = watch::channel(0);
        let inner = Inner {
            factory: StatementFactory::new(config.actor().clone(), config.uri_prefix()),
            state: Mutex::new(SenderState {
                queue: DeliveryQueue::new(),
                backoff: Backoff::new(config.batch_timeout(), config.max_retry_delay()),
                online,
                batches_sent: 0,
                failures: 0,
                last_error: None,
            }),
            config,
            credentials,
            transport,
            mirror,
            send_gate: Mutex::new(()),
            scheduler: RetryScheduler::new(),
            delivered_tx,
            metrics,
            logger,
            health,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Start a statement for the configured actor and URI prefix
    pub fn statement(
        &self,
        verb: impl Into<String>,
        object_type: impl Into<String>,
        object_id: impl Into<String>,
    ) -> Statement {
        self.inner.factory.create(verb, object_type, object_id)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Buffer a record for delivery
    pub async fn enqueue<R: Record>(&self, record: R) -> EnqueueReceipt {
        self.enqueue_shared(Arc::new(record)).await
    }

    /// Buffer an already shared record for delivery.
    ///
    /// Returns as soon as the record is buffered. Starts a send when the
    /// pending count reaches the batch size while online, and always arms
    /// the retry timer.
    pub async fn enqueue_shared(&self, record: Arc<dyn Record>) -> EnqueueReceipt {
        let inner = &self.inner;
        let (position, threshold_reached) = {
            let mut state = inner.state.lock().await;
            let position = state.queue.push(record);
            let pending = state.queue.pending();
            inner.metrics.set_pending(pending);
            (position, state.online && pending >= inner.config.batch_size())
        };

        if threshold_reached {
            let sender = inner.clone();
            tokio::spawn(async move { sender.send_on_threshold().await });
        }
        inner.arm().await;

        EnqueueReceipt {
            position,
            delivered: inner.delivered_tx.subscribe(),
        }
    }

    /// Drain every pending batch and mirror the buffer to the backup sink.
    ///
    /// Waits for an in-flight send instead of racing it. Primary delivery
    /// stops at the first failed batch; the backup post runs concurrently
    /// and its failure never affects primary delivery.
    pub async fn flush(&self) -> Result<FlushReport, FlushError> {
        let inner = &self.inner;
        let ((sent, primary_error), mirrored) = tokio::join!(inner.drain(), inner.mirror());

        let backup_error = match &mirrored {
            Some(Err(err)) => Some(err.clone()),
            _ => None,
        };
        if let Some(error) = FlushError::from_outcomes(primary_error, backup_error) {
            inner.arm().await;
            return Err(error);
        }

        let (delivered_offset, pending) = {
            let state = inner.state.lock().await;
            (state.queue.offset(), state.queue.pending())
        };
        inner.arm().await;

        Ok(FlushReport {
            sent,
            delivered_offset,
            pending,
            mirrored: mirrored.and_then(Result::ok),
        })
    }

    /// Acquire the credential and go online
    pub async fn login(&self) -> Result<(), PipelineError> {
        let inner = &self.inner;
        if let Err(err) = inner.credentials.authorize().await {
            inner
                .health
                .unhealthy(Component::Credentials, err.to_string())
                .await;
            return Err(err.into());
        }

        inner.health.healthy(Component::Credentials).await;
        inner.set_online(true).await;
        inner.arm().await;
        Ok(())
    }

    /// Drop the credential, revoking it server-side where supported, and
    /// park delivery until the next login
    pub async fn logout(&self) -> Result<(), PipelineError> {
        let inner = &self.inner;
        inner.scheduler.cancel().await;
        inner.set_online(false).await;
        inner.credentials.logout().await?;
        let pending = inner.state.lock().await.queue.pending();
        inner
            .logger
            .log_logout(inner.credentials.kind().as_str(), pending);
        inner
            .health
            .unhealthy(Component::Credentials, "Logged out")
            .await;
        Ok(())
    }

    pub async fn is_online(&self) -> bool {
        self.inner.state.lock().await.online
    }

    /// Watch channel carrying the delivered offset
    pub fn delivered_offset(&self) -> watch::Receiver<usize> {
        self.inner.delivered_tx.subscribe()
    }

    pub async fn stats(&self) -> PipelineStats {
        let state = self.inner.state.lock().await;
        PipelineStats {
            queued: state.queue.len(),
            delivered: state.queue.offset(),
            pending: state.queue.pending(),
            online: state.online,
            retry_delay: state.backoff.delay(),
            batches_sent: state.batches_sent,
            failures: state.failures,
            last_error: state.last_error.clone(),
        }
    }

    pub async fn health(&self) -> HealthResponse {
        self.inner.health.snapshot().await
    }
}

impl Inner {
    /// Arm the retry timer if work is pending and a credential is held
    fn arm(self: &Arc<Self>) -> BoxFuture<'_, ()> {
        // Boxed: the timer task calls back into `on_timer`, which re-arms
        Box::pin(async move {
            let (pending, delay) = {
                let state = self.state.lock().await;
                (state.queue.pending(), state.backoff.next_interval())
            };
            if pending == 0 || !self.credentials.is_available().await {
                return;
            }

            let weak = Arc::downgrade(self);
            self.scheduler
                .arm(delay, move || async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_timer().await;
                    }
                })
                .await;
        })
    }

    async fn on_timer(self: Arc<Self>) {
        self.reevaluate_online().await;
        match self.send_gate.try_lock() {
            Ok(_gate) => {
                let _ = self.send_once().await;
            }
            Err(_) => debug!("Timer fired during an in-flight send"),
        }
        self.scheduler.clear().await;
        self.arm().await;
    }

    async fn send_on_threshold(self: Arc<Self>) {
        {
            let Ok(_gate) = self.send_gate.try_lock() else {
                debug!("Send already in flight, threshold send skipped");
                return;
            };
            // An earlier send may have drained the window while this task waited
            let still_due = {
                let state = self.state.lock().await;
                state.online && state.queue.pending() >= self.config.batch_size()
            };
            if still_due {
                let _ = self.send_once().await;
            }
        }
        self.arm().await;
    }

    /// Send pending batches until none remain or one fails
    async fn drain(&self) -> (usize, Option<DeliveryError>) {
        let _gate = self.send_gate.lock().await;
        self.reevaluate_online().await;

        let mut sent = 0;
        loop {
            match self.send_once().await {
                Ok(0) => break,
                Ok(count) => sent += count,
                Err(err) => return (sent, Some(err)),
            }
        }

        let state = self.state.lock().await;
        if !state.online && state.queue.pending() > 0 {
            return (
                sent,
                Some(DeliveryError::NoCredential(
                    "pipeline is offline".to_string(),
                )),
            );
        }
        (sent, None)
    }

    async fn mirror(&self) -> Option<Result<usize, DeliveryError>> {
        let mirror = self.mirror.as_ref()?;
        let snapshot = self.state.lock().await.queue.snapshot();
        if snapshot.is_empty() {
            return None;
        }

        let outcome = mirror.mirror(&snapshot).await.map(|_| snapshot.len());
        match &outcome {
            Ok(_) => self.health.healthy(Component::BackupSink).await,
            Err(err) => {
                self.health
                    .degraded(Component::BackupSink, err.to_string())
                    .await
            }
        }
        Some(outcome)
    }

    /// One batch attempt. Caller must hold the send gate.
    ///
    /// Returns the number of statements delivered, 0 when offline or idle.
    async fn send_once(&self) -> Result<usize, DeliveryError> {
        let batch = {
            let state = self.state.lock().await;
            if !state.online {
                return Ok(0);
            }
            match state.queue.next_batch(self.config.batch_size()) {
                Some(batch) => batch,
                None => return Ok(0),
            }
        };

        let statements = batch.statements();
        let started = Instant::now();
        let mut outcome = self.submit(statements.clone()).await;

        if matches!(&outcome, Err(err) if err.is_authorization()) {
            self.set_online(false).await;
            match self.credentials.refresh().await {
                Ok(true) => {
                    self.metrics.inc_token_refreshes();
                    self.health.healthy(Component::Credentials).await;
                    self.reevaluate_online().await;
                    outcome = self.submit(statements).await;
                }
                Ok(false) => {}
                Err(err) => {
                    self.health
                        .unhealthy(Component::Credentials, err.to_string())
                        .await;
                }
            }
        }

        match outcome {
            Ok(_) => {
                self.record_success(&batch, started.elapsed()).await;
                Ok(batch.len())
            }
            Err(err) => {
                self.record_failure(&batch, &err).await;
                Err(err)
            }
        }
    }

    async fn submit(&self, statements: Vec<Value>) -> Result<Vec<String>, DeliveryError> {
        let auth = self.credentials.current_auth_header().await?;
        self.transport
            .send_statements(statements, auth.as_deref())
            .await
    }

    async fn record_success(&self, batch: &Batch, elapsed: Duration) {
        // A logout while the batch was in flight keeps the pipeline parked
        let available = self.credentials.is_available().await;
        let (offset, pending, changed) = {
            let mut state = self.state.lock().await;
            state.queue.advance(batch);
            state.backoff.reset();
            state.batches_sent += 1;
            state.last_error = None;
            let changed = state.online != available;
            state.online = available;
            (state.queue.offset(), state.queue.pending(), changed)
        };

        self.delivered_tx.send_replace(offset);
        self.metrics.record_batch_sent(batch.len(), elapsed);
        self.metrics.set_pending(pending);
        self.metrics.set_retry_delay(None);
        self.metrics.set_online(available);
        if changed {
            self.logger.log_connectivity(available, pending);
        }
        self.logger.log_batch_delivered(batch.len(), offset, pending);
        self.health.healthy(Component::PrimarySink).await;
    }

    async fn record_failure(&self, batch: &Batch, err: &DeliveryError) {
        let (delay, pending, disconnected) = {
            let mut state = self.state.lock().await;
            let disconnected = state.online;
            state.online = false;
            state.failures += 1;
            state.last_error = Some(err.to_string());
            (state.backoff.on_failure(), state.queue.pending(), disconnected)
        };

        self.metrics.inc_batch_failures();
        self.metrics.set_retry_delay(Some(delay));
        self.metrics.set_online(false);
        if disconnected {
            self.logger.log_connectivity(false, pending);
        }
        self.logger
            .log_batch_failed(batch.len(), &err.to_string(), Some(delay));
        self.health
            .degraded(Component::PrimarySink, err.to_string())
            .await;
    }

    /// Align the online flag with credential availability
    async fn reevaluate_online(&self) {
        let available = self.credentials.is_available().await;
        self.set_online(available).await;
    }

    async fn set_online(&self, online: bool) {
        let (changed, pending) = {
            let mut state = self.state.lock().await;
            let changed = state.online != online;
            state.online = online;
            (changed, state.queue.pending())
        };
        if changed {
            self.metrics.set_online(online);
            self.logger.log_connectivity(online, pending);
        }
    }
}
