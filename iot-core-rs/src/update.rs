//! Firmware update pipeline
//!
//! ```text
//!   Idle ──start──► Started ──write──► Writing ──end──► Success
//!                      │                  │  │
//!                      └──────────────────┴──┴────────► Failed | Rejected
//! ```
//!
//! `start` takes the task lock from the coordinator before the first byte
//! is accepted and opens a write session on the slot that is not running.
//! The image header is validated before anything is written. `end` checks
//! integrity and only then moves the boot pointer.
//!
//! Every started session is completed exactly once: the write is aborted on
//! failure, the lock is released, and one terminal event is queued.

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{UpdatePolicy, ValidationMode};
use crate::context::LifecycleContext;
use crate::error::CoreError;
use crate::firmware::{FirmwareSlots, ImageHeader, Slot, SlotError, HEADER_LEN};
use crate::hal::Startable;
use crate::router::{handler, Access, Body, BodyError, Method, Request, Response, Router};
use crate::types::{Event, LockHolder};

pub const UPDATE_ROUTE: &str = "update";

/// Update failures
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("An update is already in progress")]
    Busy,

    #[error("Image rejected: {0}")]
    Rejected(String),

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Request has no content length")]
    MissingLength,

    #[error("Task lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("Task lock was reclaimed by the guard")]
    LockLost,

    #[error("Chunk of {chunk} bytes exceeds the {remaining} bytes remaining")]
    Overflow { chunk: usize, remaining: usize },

    #[error("Stream ended with {0} bytes missing")]
    Truncated(usize),

    #[error("Receive failed: {0}")]
    Body(#[from] BodyError),

    #[error("No update session")]
    NotStarted,

    #[error("Slot error: {0}")]
    Slot(#[from] SlotError),
}

impl UpdateError {
    /// Status code reported to the requester
    pub fn http_status(&self) -> u16 {
        match self {
            UpdateError::Busy => 409,
            UpdateError::Rejected(_) => 409,
            UpdateError::InvalidImage(_)
            | UpdateError::MissingLength
            | UpdateError::Overflow { .. }
            | UpdateError::Truncated(_)
            | UpdateError::Body(_) => 400,
            UpdateError::LockUnavailable(_) | UpdateError::LockLost => 503,
            UpdateError::NotStarted | UpdateError::Slot(_) => 500,
        }
    }
}

/// Pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    Started,
    Writing,
    Success,
    Failed,
    Rejected,
}

impl UpdateState {
    /// Value of the `status` field in the status document
    pub fn as_status(self) -> &'static str {
        match self {
            UpdateState::Idle => "idle",
            UpdateState::Started | UpdateState::Writing => "in_progress",
            UpdateState::Success => "updated",
            UpdateState::Failed => "failed",
            UpdateState::Rejected => "rejected",
        }
    }
}

/// One in-flight update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSession {
    pub target: Slot,
    pub content_length: usize,
    pub bytes_written: usize,
    pub bytes_remaining: usize,
    pub validated: bool,
    lock_held: bool,
}

#[derive(Debug)]
struct StatusRecord {
    state: UpdateState,
    bytes_written: usize,
    last_error: Option<String>,
}

/// Streams images into the inactive slot
pub struct UpdatePipeline {
    ctx: Arc<LifecycleContext>,
    policy: UpdatePolicy,
    slots: Mutex<Box<dyn FirmwareSlots>>,
    session: Mutex<Option<UpdateSession>>,
    status: Mutex<StatusRecord>,
    started: AtomicBool,
}

impl UpdatePipeline {
    pub fn new(ctx: Arc<LifecycleContext>, policy: UpdatePolicy, slots: Box<dyn FirmwareSlots>) -> Self {
        Self {
            ctx,
            policy,
            slots: Mutex::new(slots),
            session: Mutex::new(None),
            status: Mutex::new(StatusRecord {
                state: UpdateState::Idle,
                bytes_written: 0,
                last_error: None,
            }),
            started: AtomicBool::new(false),
        }
    }

    /// Confirm the running image if it booted on trial
    pub fn init(&self) -> Result<(), UpdateError> {
        let mut slots = self.slots.lock();
        if slots.pending_verify() {
            info!(
                "Update: Confirming {} in slot {}",
                slots.running_version(),
                slots.running_slot()
            );
            slots.mark_running_valid()?;
        }
        info!(
            "Update: Running {} from slot {} (boot slot {})",
            slots.running_version(),
            slots.running_slot(),
            slots.boot_slot()
        );
        Ok(())
    }

    pub fn state(&self) -> UpdateState {
        self.status.lock().state
    }

    pub fn session(&self) -> Option<UpdateSession> {
        self.session.lock().clone()
    }

    pub fn running_version(&self) -> String {
        self.slots.lock().running_version()
    }

    pub fn boot_slot(&self) -> Slot {
        self.slots.lock().boot_slot()
    }

    /// Status document served on `GET update`
    pub fn status_json(&self) -> Value {
        let version = self.running_version();
        let status = self.status.lock();
        let mut doc = json!({
            "version": version,
            "status": status.state.as_status(),
            "bytes_written": status.bytes_written,
        });
        if let Some(reason) = &status.last_error {
            doc["error"] = json!(reason);
        }
        doc
    }

    fn set_state(&self, state: UpdateState) {
        self.status.lock().state = state;
    }

    /// Check an image header against the running and last invalid versions
    pub fn validate(&self, header_bytes: &[u8]) -> Result<ImageHeader, UpdateError> {
        let header =
            ImageHeader::parse(header_bytes).map_err(|e| UpdateError::InvalidImage(e.to_string()))?;

        let (running, last_invalid) = {
            let slots = self.slots.lock();
            (slots.running_version(), slots.last_invalid_version())
        };

        let problem = if header.version == running {
            Some(format!("version {} is already running", header.version))
        } else if last_invalid.as_deref() == Some(header.version.as_str()) {
            Some(format!("version {} failed to boot before", header.version))
        } else {
            None
        };

        if let Some(reason) = problem {
            match self.policy.validation {
                ValidationMode::Strict => {
                    warn!("Update: Rejecting image: {}", reason);
                    return Err(UpdateError::Rejected(reason));
                }
                ValidationMode::Advisory => {
                    warn!("Update: {} (advisory, continuing)", reason);
                }
            }
        }

        debug!(
            "Update: Header ok, version {} with {} byte payload",
            header.version, header.payload_len
        );
        Ok(header)
    }

    /// Open a session: take the task lock, then open the inactive slot.
    ///
    /// Only [`UpdateError::Busy`] and [`UpdateError::InvalidImage`] leave no
    /// trace; any other failure completes the session before returning.
    pub async fn start(&self, content_length: usize) -> Result<UpdateSession, UpdateError> {
        if content_length < HEADER_LEN {
            return Err(UpdateError::InvalidImage(format!(
                "{} bytes is shorter than the image header",
                content_length
            )));
        }

        let target = {
            let mut session = self.session.lock();
            if session.is_some() {
                warn!("Update: Rejecting concurrent update");
                return Err(UpdateError::Busy);
            }
            let target = self.slots.lock().running_slot().other();
            *session = Some(UpdateSession {
                target,
                content_length,
                bytes_written: 0,
                bytes_remaining: content_length,
                validated: false,
                lock_held: false,
            });
            target
        };

        {
            let mut status = self.status.lock();
            status.state = UpdateState::Started;
            status.bytes_written = 0;
            status.last_error = None;
        }
        info!(
            "Update: Started, {} bytes into slot {}",
            content_length, target
        );

        if let Err(e) = self.ctx.submit(Event::UpdateRequested).await {
            warn!("Update: {}", e);
        }

        if let Err(e) = self.ctx.acquire_task_lock().await {
            return Err(self
                .fail(UpdateError::LockUnavailable(e.to_string()))
                .await);
        }
        self.update_session(|s| s.lock_held = true);

        let opened = self.slots.lock().begin(target);
        if let Err(e) = opened {
            return Err(self.fail(e.into()).await);
        }

        self.session().ok_or(UpdateError::NotStarted)
    }

    fn update_session(&self, f: impl FnOnce(&mut UpdateSession)) {
        if let Some(session) = self.session.lock().as_mut() {
            f(session);
        }
    }

    /// Mark the header as checked
    pub fn mark_validated(&self) {
        self.update_session(|s| s.validated = true);
    }

    /// Append `chunk` to the open session.
    ///
    /// `remaining` is decreased by exactly `chunk.len()` on success. A slot
    /// error aborts the write; the caller still completes the session.
    pub fn write(&self, chunk: &[u8], remaining: &mut usize) -> Result<(), UpdateError> {
        self.ensure_lock()?;
        if chunk.len() > *remaining {
            return Err(UpdateError::Overflow {
                chunk: chunk.len(),
                remaining: *remaining,
            });
        }

        let mut session = self.session.lock();
        let session = session.as_mut().ok_or(UpdateError::NotStarted)?;

        {
            let mut slots = self.slots.lock();
            for piece in chunk.chunks(self.policy.chunk_size.max(1)) {
                if let Err(e) = slots.write(piece) {
                    slots.abort();
                    drop(slots);
                    self.set_state(UpdateState::Failed);
                    return Err(e.into());
                }
            }
        }

        *remaining -= chunk.len();
        session.bytes_written += chunk.len();
        session.bytes_remaining = *remaining;

        let mut status = self.status.lock();
        status.state = UpdateState::Writing;
        status.bytes_written = session.bytes_written;
        Ok(())
    }

    /// Abort the slot session if the guard reclaimed the task lock
    fn ensure_lock(&self) -> Result<(), UpdateError> {
        if self.ctx.task_lock().is_held_by(LockHolder::UpdatePipeline) {
            return Ok(());
        }
        self.slots.lock().abort();
        self.set_state(UpdateState::Failed);
        Err(UpdateError::LockLost)
    }

    /// Finish the write, verify it, and point the next boot at it.
    ///
    /// The boot slot only moves while the pipeline still owns the task lock.
    pub fn end(&self) -> Result<ImageHeader, UpdateError> {
        let session = self.session().ok_or(UpdateError::NotStarted)?;
        if session.bytes_remaining > 0 {
            return Err(UpdateError::Truncated(session.bytes_remaining));
        }
        self.ensure_lock()?;

        let mut slots = self.slots.lock();
        let header = slots.finish()?;
        slots.set_boot(session.target)?;
        info!(
            "Update: {} verified, next boot from slot {}",
            header.version, session.target
        );
        Ok(header)
    }

    /// Close the session: abort on failure, release the lock, queue the
    /// terminal event. Returns the new version on success.
    pub async fn complete(&self, outcome: Result<ImageHeader, UpdateError>) -> Result<String, UpdateError> {
        match outcome {
            Ok(header) => {
                let Some(session) = self.session.lock().take() else {
                    warn!("Update: Completion without a session");
                    return Err(UpdateError::NotStarted);
                };
                self.release(&session).await;
                self.set_state(UpdateState::Success);
                info!("Update: {} installed, restart pending", header.version);
                self.emit(Event::UpdateCompleted {
                    version: header.version.clone(),
                })
                .await;
                Ok(header.version)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn fail(&self, error: UpdateError) -> UpdateError {
        let Some(session) = self.session.lock().take() else {
            return error;
        };
        self.slots.lock().abort();
        self.release(&session).await;

        {
            let mut status = self.status.lock();
            status.state = match error {
                UpdateError::Rejected(_) => UpdateState::Rejected,
                _ => UpdateState::Failed,
            };
            status.last_error = Some(error.to_string());
        }
        warn!(
            "Update: Failed after {} bytes: {}",
            session.bytes_written, error
        );
        self.emit(Event::UpdateFailed {
            reason: error.to_string(),
        })
        .await;
        error
    }

    async fn release(&self, session: &UpdateSession) {
        if session.lock_held && !self.ctx.release_task_lock().await {
            warn!("Update: Task lock was already reclaimed");
        }
    }

    async fn emit(&self, event: Event) {
        if let Err(e) = self.ctx.submit(event).await {
            warn!("Update: Terminal event not delivered: {}", e);
        }
    }

    /// Run a whole update from a streamed body
    pub async fn receive(&self, content_length: Option<usize>, body: Body) -> Result<String, UpdateError> {
        let content_length = content_length.ok_or(UpdateError::MissingLength)?;
        self.start(content_length).await?;
        let outcome = self.stream_into(content_length, body).await;
        self.complete(outcome).await
    }

    async fn stream_into(&self, content_length: usize, mut body: Body) -> Result<ImageHeader, UpdateError> {
        let recv_timeout = self.ctx.task_lock().guard_timeout();
        let mut remaining = content_length;
        let mut header_buf = Vec::with_capacity(HEADER_LEN);
        let mut validated = false;

        loop {
            let chunk = match tokio::time::timeout(recv_timeout, body.next()).await {
                Ok(Some(chunk)) => chunk?,
                Ok(None) => break,
                Err(_) => return Err(BodyError::Timeout.into()),
            };
            let mut data = &chunk[..];

            if !validated {
                let take = (HEADER_LEN - header_buf.len()).min(data.len());
                header_buf.extend_from_slice(&data[..take]);
                data = &data[take..];
                if header_buf.len() < HEADER_LEN {
                    continue;
                }

                let header = self.validate(&header_buf)?;
                if header.image_len() != content_length {
                    return Err(UpdateError::InvalidImage(format!(
                        "header describes {} bytes, request carries {}",
                        header.image_len(),
                        content_length
                    )));
                }
                validated = true;
                self.mark_validated();
                self.write(&header_buf, &mut remaining)?;
            }

            if !data.is_empty() {
                self.write(data, &mut remaining)?;
            }
        }

        if remaining > 0 {
            return Err(UpdateError::Truncated(remaining));
        }
        self.end()
    }

    async fn handle_upload(&self, request: Request) -> Response {
        match self.receive(request.content_length, request.body).await {
            Ok(version) => Response::success(format!("Firmware {} installed, restarting", version)),
            Err(e) => Response::failure(e.http_status(), e.to_string()),
        }
    }

    /// Register `POST update` and `GET update`
    pub fn register_routes(self: &Arc<Self>, router: &mut dyn Router) -> Result<(), CoreError> {
        let pipeline = self.clone();
        router.register_route(
            UPDATE_ROUTE,
            Method::Post,
            Access::Authenticated,
            handler(move |request| {
                let pipeline = pipeline.clone();
                async move { pipeline.handle_upload(request).await }
            }),
        )?;

        let pipeline = self.clone();
        router.register_route(
            UPDATE_ROUTE,
            Method::Get,
            Access::Authenticated,
            handler(move |_request| {
                let pipeline = pipeline.clone();
                async move { Response::ok(pipeline.status_json()) }
            }),
        )
    }
}

/// Update service as seen by the shutdown sweep
pub struct UpdateService(pub Arc<UpdatePipeline>);

impl Startable for UpdateService {
    fn name(&self) -> &str {
        "ota"
    }

    fn start(&mut self) -> Result<(), CoreError> {
        self.0.init()?;
        self.0.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CoreError> {
        if self.0.session.lock().is_some() {
            warn!("Update: Stopping with a write in flight, discarding it");
            self.0.slots.lock().abort();
        }
        self.0.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn started(&self) -> bool {
        self.0.started.load(Ordering::SeqCst)
    }
}
