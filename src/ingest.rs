/// Polling loop: keeps the credential fresh, fetches device readings and
/// forwards them to the metric sink
use crate::authorize::Authorizer;
use crate::credential::{now_epoch_secs, CredentialStore};
use crate::device::DeviceApi;
use crate::error::{AuthError, FetchError};
use crate::metrics::map_device;
use crate::oauth::TokenEndpoint;
use crate::shutdown::Shutdown;
use crate::sink::MetricSink;
use crate::token::{AuthState, TokenManager};
use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Sleep between cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    /// While a token set is held
    pub authenticated: Duration,
    /// While waiting for authorization
    pub unauthenticated: Duration,
}

impl Default for Cadence {
    fn default() -> Self {
        Self {
            authenticated: Duration::from_secs(60),
            unauthenticated: Duration::from_secs(5),
        }
    }
}

/// How a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Points were mapped and written (possibly with per-device failures)
    Pushed,
    /// No code could be obtained or exchanged this cycle
    AuthorizationFailed,
    /// The token was due and the refresh failed; nothing was fetched
    RefreshFailed,
    /// Transport, status or parse failure on the device API
    FetchFailed,
}

/// What a cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub points_written: usize,
    pub devices_skipped: usize,
    pub write_failures: usize,
}

impl CycleReport {
    fn ended(outcome: CycleOutcome) -> Self {
        Self {
            outcome,
            points_written: 0,
            devices_skipped: 0,
            write_failures: 0,
        }
    }
}

/// The steady-state scheduler
///
/// Every cycle is isolated. Refresh, fetch, mapping and write failures are
/// logged and end (or narrow) the current cycle only; only
/// [`IngestionLoop::bootstrap`] can fail the run.
pub struct IngestionLoop<S: CredentialStore, E: TokenEndpoint> {
    tokens: TokenManager<S, E>,
    device: Box<dyn DeviceApi>,
    sink: Box<dyn MetricSink>,
    authorizer: Box<dyn Authorizer>,
    cadence: Cadence,
    shutdown: Shutdown,
}

impl<S: CredentialStore, E: TokenEndpoint> IngestionLoop<S, E> {
    pub fn new(
        tokens: TokenManager<S, E>,
        device: Box<dyn DeviceApi>,
        sink: Box<dyn MetricSink>,
        authorizer: Box<dyn Authorizer>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            tokens,
            device,
            sink,
            authorizer,
            cadence: Cadence::default(),
            shutdown,
        }
    }

    pub fn with_cadence(mut self, cadence: Cadence) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn tokens(&self) -> &TokenManager<S, E> {
        &self.tokens
    }

    /// Bring the credential to a usable state before polling starts
    ///
    /// Failing to obtain a code or to exchange it is fatal to the run. An
    /// expired token is refreshed right away; if that fails the loop deals
    /// with it like any other refresh failure.
    pub fn bootstrap(&mut self) -> Result<(), AuthError> {
        self.bootstrap_at(now_epoch_secs())
    }

    pub fn bootstrap_at(&mut self, now: u64) -> Result<(), AuthError> {
        match self.tokens.state_at(now) {
            AuthState::NoCode | AuthState::HaveCode => self.authorize_if_needed(now).map(|_| ()),
            AuthState::Expired => {
                if let Err(e) = self.tokens.refresh_at(now) {
                    warn!(error = %e, "startup refresh failed");
                }
                Ok(())
            }
            AuthState::Authenticated => {
                info!("restored valid token");
                Ok(())
            }
        }
    }

    /// Poll until shutdown
    pub fn run(&mut self) {
        info!("ingestion loop started");
        while !self.shutdown.is_requested() {
            let report = self.run_cycle();
            debug!(?report, "cycle finished");

            let pause = if self.tokens.view().access_token().is_some() {
                self.cadence.authenticated
            } else {
                self.cadence.unauthenticated
            };
            if !self.shutdown.sleep(pause) {
                break;
            }
        }
        info!("ingestion loop stopped");
    }

    pub fn run_cycle(&mut self) -> CycleReport {
        self.run_cycle_at(now_epoch_secs())
    }

    /// One cycle: authorize if needed, refresh if due, fetch, map, write
    pub fn run_cycle_at(&mut self, now: u64) -> CycleReport {
        let now = match self.authorize_if_needed(now) {
            Ok(now) => now,
            Err(e) => {
                warn!(error = %e, "authorization failed, retrying next cycle");
                return CycleReport::ended(CycleOutcome::AuthorizationFailed);
            }
        };

        if let Err(e) = self.tokens.ensure_fresh_at(now) {
            warn!(error = %e, "token not usable, skipping fetch");
            return CycleReport::ended(CycleOutcome::RefreshFailed);
        }

        let Some(access_token) = self.tokens.view().access_token() else {
            return CycleReport::ended(CycleOutcome::RefreshFailed);
        };

        let payload = match self.device.fetch(&access_token) {
            Ok(payload) => payload,
            Err(FetchError::Parse { source, body }) => {
                error!(error = %source, %body, "device API did not return JSON");
                return CycleReport::ended(CycleOutcome::FetchFailed);
            }
            Err(e) => {
                error!(error = %e, "failed to fetch device data");
                return CycleReport::ended(CycleOutcome::FetchFailed);
            }
        };

        let timestamp = Utc::now();
        let mut report = CycleReport::ended(CycleOutcome::Pushed);

        for device in &payload.body.devices {
            let points = match map_device(device, timestamp) {
                Ok(points) => points,
                Err(e) => {
                    warn!(error = %e, %device, "skipping device");
                    report.devices_skipped += 1;
                    continue;
                }
            };

            for point in &points {
                match self.sink.write(point) {
                    Ok(()) => report.points_written += 1,
                    Err(e) => {
                        error!(error = %e, measurement = %point.measurement, "error sending point");
                        report.write_failures += 1;
                    }
                }
            }
        }

        info!(
            devices = payload.body.devices.len(),
            points = report.points_written,
            skipped = report.devices_skipped,
            failed = report.write_failures,
            "pushed readings"
        );
        report
    }

    /// Obtain and exchange a code when none is held
    ///
    /// Returns `now` advanced by the time spent waiting for the user, so the
    /// token expiry is anchored to the exchange and not to the cycle start.
    fn authorize_if_needed(&mut self, now: u64) -> Result<u64, AuthError> {
        match self.tokens.state_at(now) {
            AuthState::NoCode => {
                let started = Instant::now();
                let code = self.authorizer.obtain_code(&self.shutdown)?;
                let now = now.saturating_add(started.elapsed().as_secs());
                self.tokens.accept_code(code);
                self.tokens.exchange_code_at(now)?;
                Ok(now)
            }
            AuthState::HaveCode => {
                self.tokens.exchange_code_at(now)?;
                Ok(now)
            }
            AuthState::Authenticated | AuthState::Expired => Ok(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{CredentialState, MemoryStore};
    use crate::device::DevicePayload;
    use crate::error::{Result, SinkError};
    use crate::metrics::MetricPoint;
    use crate::oauth::TokenResponse;
    use crate::sink::MemorySink;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::sync::Arc;

    #[derive(Default, Clone)]
    struct Endpoint {
        responses: Rc<RefCell<VecDeque<Result<TokenResponse>>>>,
        refreshes: Rc<RefCell<Vec<String>>>,
    }

    impl Endpoint {
        fn push(&self, access: &str, refresh: &str) {
            self.responses.borrow_mut().push_back(Ok(TokenResponse {
                access_token: access.to_string(),
                refresh_token: refresh.to_string(),
                expires_in: 10_800,
            }));
        }

        fn push_err(&self, err: AuthError) {
            self.responses.borrow_mut().push_back(Err(err));
        }

        fn next(&self) -> Result<TokenResponse> {
            self.responses
                .borrow_mut()
                .pop_front()
                .unwrap_or(Err(AuthError::NoRefreshToken))
        }
    }

    impl TokenEndpoint for Endpoint {
        fn exchange_code(&self, _code: &str) -> Result<TokenResponse> {
            self.next()
        }

        fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
            self.refreshes.borrow_mut().push(refresh_token.to_string());
            self.next()
        }
    }

    #[derive(Clone)]
    struct Device {
        body: Rc<RefCell<std::result::Result<String, u16>>>,
        tokens_seen: Rc<RefCell<Vec<String>>>,
    }

    impl Device {
        fn ok(body: &str) -> Self {
            Self {
                body: Rc::new(RefCell::new(Ok(body.to_string()))),
                tokens_seen: Rc::default(),
            }
        }

        fn status(status: u16) -> Self {
            Self {
                body: Rc::new(RefCell::new(Err(status))),
                tokens_seen: Rc::default(),
            }
        }
    }

    impl DeviceApi for Device {
        fn fetch(&self, access_token: &str) -> std::result::Result<DevicePayload, FetchError> {
            self.tokens_seen.borrow_mut().push(access_token.to_string());
            match &*self.body.borrow() {
                Ok(body) => DevicePayload::parse(body),
                Err(status) => Err(FetchError::Status {
                    status: *status,
                    body: "error".to_string(),
                }),
            }
        }
    }

    struct Codes(VecDeque<Result<String>>);

    impl Authorizer for Codes {
        fn obtain_code(&mut self, _shutdown: &Shutdown) -> Result<String> {
            self.0.pop_front().unwrap_or(Err(AuthError::CallbackTimeout))
        }
    }

    /// Hands out a code after keeping the user waiting.
    struct SlowCodes(Duration);

    impl Authorizer for SlowCodes {
        fn obtain_code(&mut self, _shutdown: &Shutdown) -> Result<String> {
            std::thread::sleep(self.0);
            Ok("late".to_string())
        }
    }

    /// Fails every write for one location.
    struct PickySink {
        inner: MemorySink,
        refuse: &'static str,
        attempts: Rc<Cell<usize>>,
    }

    impl MetricSink for PickySink {
        fn write(&self, point: &MetricPoint) -> std::result::Result<(), SinkError> {
            self.attempts.set(self.attempts.get() + 1);
            if point.tags.get("location").map(String::as_str) == Some(self.refuse) {
                return Err(SinkError::Rejected {
                    status: 500,
                    body: "nope".to_string(),
                });
            }
            self.inner.write(point)
        }
    }

    const OFFICE: &str = r#"{"body":{"devices":[{"station_name":"Office","dashboard_data":{"Temperature":21.5,"CO2":420,"Humidity":45,"Noise":38,"Pressure":1013.2}}]}}"#;

    const TWO_DEVICES_ONE_BROKEN: &str = r#"{"body":{"devices":[
        {"station_name":"Bedroom","dashboard_data":{"Temperature":19.0,"CO2":600,"Humidity":50}},
        {"station_name":"Office","dashboard_data":{"Temperature":21.5,"CO2":420,"Humidity":45,"Noise":38,"Pressure":1013.2}}
    ]}}"#;

    fn authenticated(expires_at: u64) -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_state(CredentialState::with_tokens(
            "A", "R", expires_at,
        )))
    }

    fn build(
        store: Arc<MemoryStore>,
        endpoint: Endpoint,
        device: Device,
        sink: Box<dyn MetricSink>,
        codes: Vec<Result<String>>,
    ) -> IngestionLoop<MemoryStore, Endpoint> {
        IngestionLoop::new(
            TokenManager::new(store, endpoint),
            Box::new(device),
            sink,
            Box::new(Codes(codes.into())),
            Shutdown::new(),
        )
    }

    #[test]
    fn test_cycle_pushes_points() {
        let sink = MemorySink::new();
        let device = Device::ok(OFFICE);
        let mut ingest = build(
            authenticated(5_000),
            Endpoint::default(),
            device.clone(),
            Box::new(sink.clone()),
            vec![],
        );

        let report = ingest.run_cycle_at(1_000);
        assert_eq!(report.outcome, CycleOutcome::Pushed);
        assert_eq!(report.points_written, 5);
        assert_eq!(*device.tokens_seen.borrow(), vec!["A".to_string()]);

        let points = sink.points();
        assert_eq!(points.len(), 5);
        assert!(points.iter().all(|p| p.timestamp == points[0].timestamp));
    }

    #[test]
    fn test_broken_device_does_not_block_others() {
        let sink = MemorySink::new();
        let mut ingest = build(
            authenticated(5_000),
            Endpoint::default(),
            Device::ok(TWO_DEVICES_ONE_BROKEN),
            Box::new(sink.clone()),
            vec![],
        );

        let report = ingest.run_cycle_at(1_000);
        assert_eq!(report.devices_skipped, 1);
        assert_eq!(report.points_written, 5);
        assert!(sink
            .points()
            .iter()
            .all(|p| p.tags["location"] == "Office"));
    }

    #[test]
    fn test_write_failures_are_isolated() {
        let attempts = Rc::new(Cell::new(0));
        let inner = MemorySink::new();
        let sink = PickySink {
            inner: inner.clone(),
            refuse: "Office",
            attempts: attempts.clone(),
        };
        let body = r#"{"body":{"devices":[
            {"station_name":"Office","dashboard_data":{"Temperature":21.5,"CO2":420,"Humidity":45,"Noise":38,"Pressure":1013.2}},
            {"station_name":"Kitchen","dashboard_data":{"Temperature":22,"CO2":500,"Humidity":55,"Noise":40,"Pressure":1012}}
        ]}}"#;
        let mut ingest = build(
            authenticated(5_000),
            Endpoint::default(),
            Device::ok(body),
            Box::new(sink),
            vec![],
        );

        let report = ingest.run_cycle_at(1_000);
        assert_eq!(report.write_failures, 5);
        assert_eq!(report.points_written, 5);
        assert_eq!(attempts.get(), 10);
        assert!(inner.points().iter().all(|p| p.tags["location"] == "Kitchen"));
    }

    #[test]
    fn test_fetch_error_skips_cycle_and_keeps_state() {
        let store = authenticated(5_000);
        let before = store.snapshot();
        let sink = MemorySink::new();
        let mut ingest = build(
            store.clone(),
            Endpoint::default(),
            Device::status(500),
            Box::new(sink.clone()),
            vec![],
        );

        let report = ingest.run_cycle_at(1_000);
        assert_eq!(report.outcome, CycleOutcome::FetchFailed);
        assert!(sink.points().is_empty());
        assert_eq!(store.snapshot(), before);
        assert_eq!(ingest.tokens().view().snapshot(), before);
    }

    #[test]
    fn test_malformed_json_skips_cycle() {
        let sink = MemorySink::new();
        let mut ingest = build(
            authenticated(5_000),
            Endpoint::default(),
            Device::ok("not json"),
            Box::new(sink.clone()),
            vec![],
        );

        assert_eq!(ingest.run_cycle_at(1_000).outcome, CycleOutcome::FetchFailed);
        assert!(sink.points().is_empty());
    }

    #[test]
    fn test_expired_token_is_refreshed_before_fetch() {
        let endpoint = Endpoint::default();
        endpoint.push("A2", "R2");
        let device = Device::ok(OFFICE);
        let mut ingest = build(
            authenticated(900),
            endpoint.clone(),
            device.clone(),
            Box::new(MemorySink::new()),
            vec![],
        );

        let report = ingest.run_cycle_at(1_000);
        assert_eq!(report.outcome, CycleOutcome::Pushed);
        assert_eq!(*endpoint.refreshes.borrow(), vec!["R".to_string()]);
        assert_eq!(*device.tokens_seen.borrow(), vec!["A2".to_string()]);
    }

    #[test]
    fn test_failed_refresh_skips_fetch() {
        let endpoint = Endpoint::default();
        endpoint.push_err(AuthError::ServerError {
            status: 503,
            body: String::new(),
        });
        let device = Device::ok(OFFICE);
        let mut ingest = build(
            authenticated(900),
            endpoint,
            device.clone(),
            Box::new(MemorySink::new()),
            vec![],
        );

        assert_eq!(ingest.run_cycle_at(1_000).outcome, CycleOutcome::RefreshFailed);
        assert!(device.tokens_seen.borrow().is_empty());
    }

    #[test]
    fn test_rejected_refresh_triggers_reauthorization() {
        let endpoint = Endpoint::default();
        endpoint.push_err(AuthError::Rejected {
            status: 400,
            body: r#"{"error":"invalid_grant"}"#.to_string(),
        });
        endpoint.push("A3", "R3");
        let device = Device::ok(OFFICE);
        let mut ingest = build(
            authenticated(900),
            endpoint,
            device.clone(),
            Box::new(MemorySink::new()),
            vec![Ok("fresh-code".to_string())],
        );

        assert_eq!(ingest.run_cycle_at(1_000).outcome, CycleOutcome::RefreshFailed);
        assert_eq!(ingest.tokens().state_at(1_000), AuthState::NoCode);
        assert!(device.tokens_seen.borrow().is_empty());

        assert_eq!(ingest.run_cycle_at(1_005).outcome, CycleOutcome::Pushed);
        assert_eq!(*device.tokens_seen.borrow(), vec!["A3".to_string()]);
    }

    #[test]
    fn test_steady_state_authorization_failure_is_not_fatal() {
        let mut ingest = build(
            Arc::new(MemoryStore::new()),
            Endpoint::default(),
            Device::ok(OFFICE),
            Box::new(MemorySink::new()),
            vec![],
        );

        let report = ingest.run_cycle_at(1_000);
        assert_eq!(report.outcome, CycleOutcome::AuthorizationFailed);
    }

    #[test]
    fn test_bootstrap_exchanges_code() {
        let endpoint = Endpoint::default();
        endpoint.push("A", "R");
        let store = Arc::new(MemoryStore::new());
        let mut ingest = build(
            store.clone(),
            endpoint,
            Device::ok(OFFICE),
            Box::new(MemorySink::new()),
            vec![Ok("code".to_string())],
        );

        ingest.bootstrap_at(1_000).unwrap();
        assert_eq!(store.snapshot().expires_at(), Some(11_200));
        assert_eq!(ingest.tokens().state_at(1_000), AuthState::Authenticated);
    }

    #[test]
    fn test_expiry_counts_from_after_the_authorization_wait() {
        let endpoint = Endpoint::default();
        endpoint.push("A", "R");
        let store = Arc::new(MemoryStore::new());
        let mut ingest = IngestionLoop::new(
            TokenManager::new(store.clone(), endpoint),
            Box::new(Device::ok(OFFICE)),
            Box::new(MemorySink::new()),
            Box::new(SlowCodes(Duration::from_millis(1_100))),
            Shutdown::new(),
        );

        ingest.bootstrap_at(1_000).unwrap();
        assert!(store.snapshot().expires_at().unwrap() >= 1_001 + 10_800 - 600);
    }

    #[test]
    fn test_cycle_reauthorization_uses_post_wait_time() {
        let endpoint = Endpoint::default();
        endpoint.push("A", "R");
        let store = Arc::new(MemoryStore::new());
        let mut ingest = IngestionLoop::new(
            TokenManager::new(store.clone(), endpoint),
            Box::new(Device::ok(OFFICE)),
            Box::new(MemorySink::new()),
            Box::new(SlowCodes(Duration::from_millis(1_100))),
            Shutdown::new(),
        );

        assert_eq!(ingest.run_cycle_at(1_000).outcome, CycleOutcome::Pushed);
        assert!(store.snapshot().expires_at().unwrap() >= 1_001 + 10_800 - 600);
    }

    #[test]
    fn test_bootstrap_fails_on_timeout() {
        let mut ingest = build(
            Arc::new(MemoryStore::new()),
            Endpoint::default(),
            Device::ok(OFFICE),
            Box::new(MemorySink::new()),
            vec![],
        );

        assert!(matches!(
            ingest.bootstrap_at(1_000),
            Err(AuthError::CallbackTimeout)
        ));
    }

    #[test]
    fn test_bootstrap_fails_on_rejected_exchange() {
        let endpoint = Endpoint::default();
        endpoint.push_err(AuthError::Rejected {
            status: 400,
            body: "invalid_grant".to_string(),
        });
        let mut ingest = build(
            Arc::new(MemoryStore::with_state(CredentialState::with_code("stale"))),
            endpoint,
            Device::ok(OFFICE),
            Box::new(MemorySink::new()),
            vec![],
        );

        assert!(ingest.bootstrap_at(1_000).is_err());
    }

    #[test]
    fn test_bootstrap_tolerates_failed_startup_refresh() {
        let endpoint = Endpoint::default();
        endpoint.push_err(AuthError::ServerError {
            status: 502,
            body: String::new(),
        });
        let mut ingest = build(
            authenticated(10),
            endpoint,
            Device::ok(OFFICE),
            Box::new(MemorySink::new()),
            vec![],
        );

        assert!(ingest.bootstrap_at(1_000).is_ok());
        assert_eq!(ingest.tokens().state_at(1_000), AuthState::Expired);
    }

    #[test]
    fn test_run_stops_on_shutdown() {
        let shutdown = Shutdown::new();
        let mut ingest = IngestionLoop::new(
            TokenManager::new(authenticated(u64::MAX), Endpoint::default()),
            Box::new(Device::ok(OFFICE)),
            Box::new(MemorySink::new()),
            Box::new(Codes(VecDeque::new())),
            shutdown.clone(),
        )
        .with_cadence(Cadence {
            authenticated: Duration::from_millis(10),
            unauthenticated: Duration::from_millis(10),
        });

        shutdown.request();
        ingest.run();
    }
}
