//! Provisioning session
//!
//! Runs only when no network credentials are stored. A peer hands over the
//! network credentials through the secure handshake and posts the identity
//! record to the local `provision-data` route. The session persists both
//! and reports to the coordinator through events:
//!
//! - `ProvisioningStarted` when the session starts
//! - `ProvisioningSucceeded` once credentials and identity are both saved
//! - `ProvisioningFailed` when a peer exhausts its credential attempts and
//!   the policy says to escalate
//! - `ProvisioningFinished` when the session is torn down
//!
//! Events leave through one forwarding task, so the coordinator sees them in
//! the order the session produced them.

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ExhaustedCredentials, ProvisioningPolicy};
use crate::context::LifecycleContext;
use crate::error::CoreError;
use crate::router::{handler, Access, Method, Request, Response, Router};
use crate::storage::{save_json, KeyValueStore, StorageError, CREDENTIALS_KEY, IDENTITY_KEY};
use crate::types::{DeviceIdentity, Event, MacAddress, NetworkCredentials};

pub const PROVISION_ROUTE: &str = "provision-data";
pub const SERVICE_PREFIX: &str = "PROV_";
pub const SUCCESS_MESSAGE: &str = "successfully saved setup data";

pub const MAX_NAME_LEN: usize = 20;
pub const MAX_SERVER_URL_LEN: usize = 40;
pub const MAX_SSID_LEN: usize = 32;
pub const MAX_PASSWORD_LEN: usize = 64;
const MAX_PAYLOAD_LEN: usize = 1024;

/// Provisioning errors
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Empty field: {0}")]
    EmptyField(&'static str),

    #[error("Field {field} longer than {max} characters")]
    FieldTooLong { field: &'static str, max: usize },

    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Provisioning session already started")]
    AlreadyStarted,

    #[error("Provisioning session is not active")]
    NotActive,
}

#[derive(Debug, Deserialize)]
struct IdentityPayload {
    server_url: Option<String>,
    name: Option<String>,
    uuid: Option<String>,
    timezone: Option<String>,
}

fn require(
    field: &'static str,
    value: Option<String>,
    max: Option<usize>,
) -> Result<String, ProvisionError> {
    let value = value.ok_or(ProvisionError::MissingField(field))?;
    if value.is_empty() {
        return Err(ProvisionError::EmptyField(field));
    }
    if let Some(max) = max {
        if value.chars().count() > max {
            return Err(ProvisionError::FieldTooLong { field, max });
        }
    }
    Ok(value)
}

/// Parse and check an identity payload; all four fields are required
pub fn parse_identity(body: &[u8]) -> Result<DeviceIdentity, ProvisionError> {
    let payload: IdentityPayload = serde_json::from_slice(body)?;
    Ok(DeviceIdentity {
        server_url: require("server_url", payload.server_url, Some(MAX_SERVER_URL_LEN))?,
        friendly_name: require("name", payload.name, Some(MAX_NAME_LEN))?,
        unique_id: require("uuid", payload.uuid, None)?,
        timezone: require("timezone", payload.timezone, None)?,
    })
}

/// Check negotiated credentials against the radio's limits
pub fn validate_credentials(credentials: &NetworkCredentials) -> Result<(), ProvisionError> {
    if credentials.ssid.is_empty() {
        return Err(ProvisionError::EmptyField("ssid"));
    }
    if credentials.ssid.len() > MAX_SSID_LEN {
        return Err(ProvisionError::FieldTooLong {
            field: "ssid",
            max: MAX_SSID_LEN,
        });
    }
    if credentials.password.len() > MAX_PASSWORD_LEN {
        return Err(ProvisionError::FieldTooLong {
            field: "password",
            max: MAX_PASSWORD_LEN,
        });
    }
    Ok(())
}

/// What happens after a failed credential attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOutcome {
    /// Peer may try again
    Retry { remaining: u32 },
    /// Attempts exhausted; handshake security state was reset
    SecurityReset,
    /// Attempts exhausted; failure was reported to the coordinator
    Failed,
}

#[derive(Debug, Default)]
struct SessionState {
    started: bool,
    active: bool,
    failures: u32,
    security_resets: u32,
    credentials_saved: bool,
    identity_saved: bool,
    succeeded: bool,
    finished: bool,
}

/// Local configuration session
pub struct ProvisioningSession {
    ctx: Arc<LifecycleContext>,
    store: Arc<dyn KeyValueStore>,
    policy: ProvisioningPolicy,
    mac: MacAddress,
    state: Mutex<SessionState>,
    outbox: mpsc::UnboundedSender<Event>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

impl ProvisioningSession {
    pub fn new(
        ctx: Arc<LifecycleContext>,
        store: Arc<dyn KeyValueStore>,
        policy: ProvisioningPolicy,
        mac: MacAddress,
    ) -> Arc<Self> {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            ctx,
            store,
            policy,
            mac,
            state: Mutex::new(SessionState::default()),
            outbox,
            outbox_rx: Mutex::new(Some(outbox_rx)),
        })
    }

    /// Name the session advertises, e.g. `PROV_A1B2C3`
    pub fn service_name(&self) -> String {
        format!("{}{}", SERVICE_PREFIX, self.mac.suffix())
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn failures(&self) -> u32 {
        self.state.lock().failures
    }

    pub fn security_resets(&self) -> u32 {
        self.state.lock().security_resets
    }

    fn emit(&self, event: Event) {
        debug!("Provisioning: Queueing {}", event.kind());
        if self.outbox.send(event).is_err() {
            warn!("Provisioning: Event forwarder is gone");
        }
    }

    /// Begin advertising. Returns immediately; progress is reported as events.
    pub fn start(&self) -> Result<(), ProvisionError> {
        {
            let mut state = self.state.lock();
            if state.started {
                return Err(ProvisionError::AlreadyStarted);
            }
            state.started = true;
            state.active = true;
        }

        if let Some(mut rx) = self.outbox_rx.lock().take() {
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let Err(e) = ctx.submit(event).await {
                        warn!("Provisioning: {}", e);
                    }
                }
            });
        }

        info!(
            "Provisioning: Advertising as {} (max {} credential attempts)",
            self.service_name(),
            self.policy.max_credential_failures
        );
        self.emit(Event::ProvisioningStarted);
        Ok(())
    }

    /// Peer sent credentials; association is about to be attempted
    pub fn on_credentials_received(&self, credentials: &NetworkCredentials) {
        info!("Provisioning: Received credentials {:?}", credentials);
    }

    /// Association with the received credentials failed
    pub fn on_credential_failure(&self, auth: bool) -> CredentialOutcome {
        let mut state = self.state.lock();
        state.failures += 1;
        let max = self.policy.max_credential_failures;
        warn!(
            "Provisioning: Credential attempt {}/{} failed ({})",
            state.failures,
            max,
            if auth { "authentication" } else { "access point not found" }
        );

        if state.failures < max {
            return CredentialOutcome::Retry {
                remaining: max - state.failures,
            };
        }

        match self.policy.on_exhausted {
            ExhaustedCredentials::ResetAndWait => {
                state.failures = 0;
                state.security_resets += 1;
                info!("Provisioning: Attempts exhausted, resetting handshake security state");
                CredentialOutcome::SecurityReset
            }
            ExhaustedCredentials::Escalate => {
                state.active = false;
                drop(state);
                warn!("Provisioning: Attempts exhausted, giving up");
                self.emit(Event::ProvisioningFailed);
                CredentialOutcome::Failed
            }
        }
    }

    /// Association succeeded; persist the credentials
    pub fn on_credential_success(&self, credentials: &NetworkCredentials) -> Result<(), ProvisionError> {
        if !self.is_active() {
            return Err(ProvisionError::NotActive);
        }
        validate_credentials(credentials)?;
        save_json(self.store.as_ref(), CREDENTIALS_KEY, credentials)?;
        info!("Provisioning: Saved credentials for {}", credentials.ssid);

        let mut state = self.state.lock();
        state.failures = 0;
        state.credentials_saved = true;
        self.maybe_succeed(state);
        Ok(())
    }

    /// Handle a posted identity payload; nothing is written unless it is complete
    pub fn handle_payload(&self, body: &[u8]) -> Result<Value, ProvisionError> {
        if !self.is_active() {
            return Err(ProvisionError::NotActive);
        }
        let identity = parse_identity(body)?;
        save_json(self.store.as_ref(), IDENTITY_KEY, &identity)?;
        info!(
            "Provisioning: Saved identity \"{}\" (uuid={}, server={})",
            identity.friendly_name, identity.unique_id, identity.server_url
        );

        let mut state = self.state.lock();
        state.identity_saved = true;
        self.maybe_succeed(state);

        Ok(json!({ "message": SUCCESS_MESSAGE, "status": "Success" }))
    }

    fn maybe_succeed(&self, mut state: parking_lot::MutexGuard<'_, SessionState>) {
        if state.credentials_saved && state.identity_saved && !state.succeeded {
            state.succeeded = true;
            drop(state);
            info!("Provisioning: Device configured");
            self.emit(Event::ProvisioningSucceeded);
        }
    }

    /// Session torn down by the transport
    pub fn on_finished(&self) {
        let mut state = self.state.lock();
        state.active = false;
        if state.finished {
            return;
        }
        state.finished = true;
        drop(state);
        info!("Provisioning: Session finished");
        self.emit(Event::ProvisioningFinished);
    }

    async fn handle_request(&self, mut request: Request) -> Response {
        let body = match request.read_to_end(MAX_PAYLOAD_LEN).await {
            Ok(body) => body,
            Err(e) => return Response::failure(400, e.to_string()),
        };
        match self.handle_payload(&body) {
            Ok(doc) => Response::ok(doc),
            Err(ProvisionError::NotActive) => Response::failure(409, "provisioning is not active"),
            Err(e @ ProvisionError::Storage(_)) => Response::failure(500, e.to_string()),
            Err(e) => Response::failure(400, e.to_string()),
        }
    }

    /// Register the unauthenticated `provision-data` route
    pub fn register_routes(self: &Arc<Self>, router: &mut dyn Router) -> Result<(), CoreError> {
        let session = self.clone();
        router.register_route(
            PROVISION_ROUTE,
            Method::Post,
            Access::Public,
            handler(move |request| {
                let session = session.clone();
                async move { session.handle_request(request).await }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::TaskLock;
    use crate::queue::{event_queue, EventReceiver};
    use crate::storage::{load_json, MemoryStore};
    use crate::types::DeviceState;
    use std::time::Duration;
    use tokio::sync::watch;

    const PAYLOAD: &str =
        r#"{"server_url":"http://hub.local","name":"Desk Lamp","uuid":"u-42","timezone":"GMT+1"}"#;

    fn session(policy: ProvisioningPolicy) -> (Arc<ProvisioningSession>, Arc<MemoryStore>, EventReceiver) {
        let (tx, rx) = event_queue(16, Duration::from_millis(10));
        let (_state_tx, state_rx) = watch::channel(DeviceState::Initial);
        let ctx = Arc::new(LifecycleContext::new(
            tx,
            Arc::new(TaskLock::new(Duration::from_secs(90))),
            state_rx,
        ));
        let store = Arc::new(MemoryStore::new());
        let session = ProvisioningSession::new(
            ctx,
            store.clone(),
            policy,
            MacAddress([0x24, 0x6F, 0x28, 0xA1, 0xB2, 0xC3]),
        );
        (session, store, rx)
    }

    async fn drain(rx: &mut EventReceiver) -> Vec<Event> {
        let mut seen = Vec::new();
        while let Some(event) = rx.recv_timeout(Duration::from_millis(20)).await {
            seen.push(event);
        }
        seen
    }

    #[test]
    fn test_parse_identity() {
        let identity = parse_identity(PAYLOAD.as_bytes()).unwrap();
        assert_eq!(identity.friendly_name, "Desk Lamp");
        assert_eq!(identity.hostname(), "desk-lamp");

        let missing = r#"{"server_url":"http://hub.local","name":"Lamp","uuid":"u-42"}"#;
        assert!(matches!(
            parse_identity(missing.as_bytes()),
            Err(ProvisionError::MissingField("timezone"))
        ));

        let long_name = r#"{"server_url":"x","name":"a name far longer than twenty","uuid":"u","timezone":"GMT"}"#;
        assert!(matches!(
            parse_identity(long_name.as_bytes()),
            Err(ProvisionError::FieldTooLong { field: "name", max: 20 })
        ));

        let empty = r#"{"server_url":"","name":"Lamp","uuid":"u","timezone":"GMT"}"#;
        assert!(matches!(
            parse_identity(empty.as_bytes()),
            Err(ProvisionError::EmptyField("server_url"))
        ));

        assert!(matches!(
            parse_identity(b"not json"),
            Err(ProvisionError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_credential_limits() {
        assert!(validate_credentials(&NetworkCredentials::new("home", "")).is_ok());
        assert!(validate_credentials(&NetworkCredentials::new("", "pw")).is_err());
        assert!(validate_credentials(&NetworkCredentials::new("s".repeat(33), "pw")).is_err());
        assert!(validate_credentials(&NetworkCredentials::new("home", "p".repeat(65))).is_err());
    }

    #[tokio::test]
    async fn test_success_after_both_records() {
        let (session, store, mut rx) = session(ProvisioningPolicy::default());
        assert_eq!(session.service_name(), "PROV_A1B2C3");
        session.start().unwrap();
        assert!(matches!(session.start(), Err(ProvisionError::AlreadyStarted)));

        let credentials = NetworkCredentials::new("home", "hunter22");
        session.on_credentials_received(&credentials);
        session.on_credential_success(&credentials).unwrap();
        let response = session.handle_payload(PAYLOAD.as_bytes()).unwrap();
        assert_eq!(
            response,
            json!({"message": "successfully saved setup data", "status": "Success"})
        );
        // A repeated payload saves again but does not signal twice
        session.handle_payload(PAYLOAD.as_bytes()).unwrap();
        session.on_finished();
        session.on_finished();

        assert_eq!(
            drain(&mut rx).await,
            vec![
                Event::ProvisioningStarted,
                Event::ProvisioningSucceeded,
                Event::ProvisioningFinished
            ]
        );
        let saved: NetworkCredentials = load_json(store.as_ref(), CREDENTIALS_KEY).unwrap().unwrap();
        assert_eq!(saved, credentials);
        let identity: DeviceIdentity = load_json(store.as_ref(), IDENTITY_KEY).unwrap().unwrap();
        assert_eq!(identity.unique_id, "u-42");
    }

    #[tokio::test]
    async fn test_incomplete_payload_writes_nothing() {
        let (session, store, _rx) = session(ProvisioningPolicy::default());
        session.start().unwrap();
        let partial = r#"{"server_url":"http://hub.local","name":"Lamp"}"#;
        assert!(session.handle_payload(partial.as_bytes()).is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_payload_rejected_when_inactive() {
        let (session, store, _rx) = session(ProvisioningPolicy::default());
        assert!(matches!(
            session.handle_payload(PAYLOAD.as_bytes()),
            Err(ProvisionError::NotActive)
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_failures_reset_security_state() {
        let (session, _store, mut rx) = session(ProvisioningPolicy::default());
        session.start().unwrap();
        for attempt in 1..10 {
            assert_eq!(
                session.on_credential_failure(true),
                CredentialOutcome::Retry {
                    remaining: 10 - attempt
                }
            );
        }
        assert_eq!(session.on_credential_failure(true), CredentialOutcome::SecurityReset);
        assert_eq!(session.failures(), 0);
        assert_eq!(session.security_resets(), 1);
        assert!(session.is_active());
        assert_eq!(drain(&mut rx).await, vec![Event::ProvisioningStarted]);
    }

    #[tokio::test]
    async fn test_failures_escalate() {
        let policy = ProvisioningPolicy {
            max_credential_failures: 2,
            on_exhausted: ExhaustedCredentials::Escalate,
        };
        let (session, _store, mut rx) = session(policy);
        session.start().unwrap();
        assert_eq!(
            session.on_credential_failure(false),
            CredentialOutcome::Retry { remaining: 1 }
        );
        assert_eq!(session.on_credential_failure(true), CredentialOutcome::Failed);
        assert!(!session.is_active());
        assert_eq!(
            drain(&mut rx).await,
            vec![Event::ProvisioningStarted, Event::ProvisioningFailed]
        );
    }

    #[tokio::test]
    async fn test_storage_failure_is_server_error() {
        use crate::router::RouteTable;

        let (session, store, mut rx) = session(ProvisioningPolicy::default());
        session.start().unwrap();
        let mut table = RouteTable::default();
        session.register_routes(&mut table).unwrap();
        store.set_read_only(true);

        let credentials = NetworkCredentials::new("home", "hunter22");
        assert!(matches!(
            session.on_credential_success(&credentials),
            Err(ProvisionError::Storage(StorageError::ReadOnly))
        ));
        let response = table
            .handle(
                Request::new(Method::Post, "/api/v1/provision-data")
                    .with_body(PAYLOAD.as_bytes().to_vec(), 16),
            )
            .await;
        assert_eq!(response.status, 500);

        // Nothing was saved, so the session never reports success
        assert!(store.is_empty());
        assert!(session.is_active());
        assert_eq!(drain(&mut rx).await, vec![Event::ProvisioningStarted]);
    }

    #[tokio::test]
    async fn test_route_is_public() {
        use crate::router::RouteTable;

        let (session, _store, _rx) = session(ProvisioningPolicy::default());
        session.start().unwrap();
        let mut table = RouteTable::default().with_api_key("secret");
        session.register_routes(&mut table).unwrap();

        let response = table
            .handle(
                Request::new(Method::Post, "/api/v1/provision-data")
                    .with_body(PAYLOAD.as_bytes().to_vec(), 16),
            )
            .await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body["status"], "Success");

        let response = table
            .handle(Request::new(Method::Post, "/api/v1/provision-data").with_body(b"{}".to_vec(), 16))
            .await;
        assert_eq!(response.status, 400);
    }
}
