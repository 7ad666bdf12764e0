use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use pretense_harness::{
    run_test_listener_server, CertificateSource, Destination, FallbackAuthority, HarnessConfig,
    MintingCertificateSource, RecordingCoordinator, ServerOptions, SourceKind, TestCase,
    TestChain, TestReport, TestingMethod, UpstreamResigningSource,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

const STATUS_SCHEMA: &str = "pretense-runner-status-v1";
const STATUS_PREFIX: &str = "PRETENSE_STATUS\t";

const ENV_STATUS_PATH: &str = "PRETENSE_STATUS_PATH";
const ENV_BIND: &str = "PRETENSE_BIND";
const ENV_DESTINATION: &str = "PRETENSE_DESTINATION";
const ENV_CA_CERT_PATH: &str = "PRETENSE_CA_CERT_PATH";
const ENV_CA_KEY_PATH: &str = "PRETENSE_CA_KEY_PATH";
const ENV_TEST_ID: &str = "PRETENSE_TEST_ID";
const ENV_HOST_TO_TEST: &str = "PRETENSE_HOST_TO_TEST";
const ENV_TEST_CHAIN_PATH: &str = "PRETENSE_TEST_CHAIN_PATH";
const ENV_TEST_KEY_PATH: &str = "PRETENSE_TEST_KEY_PATH";
const ENV_TESTING_METHOD: &str = "PRETENSE_TESTING_METHOD";
const ENV_SOURCE: &str = "PRETENSE_SOURCE";
const ENV_UPSTREAM: &str = "PRETENSE_UPSTREAM";
const ENV_HANDSHAKE_TIMEOUT_MS: &str = "PRETENSE_HANDSHAKE_TIMEOUT_MS";
const ENV_IDLE_TIMEOUT_MS: &str = "PRETENSE_IDLE_TIMEOUT_MS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitClass {
    Ok,
    ConfigInvalid,
    MaterialInvalid,
    ListenerInitFailed,
    RuntimeFailed,
}

impl ExitClass {
    fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::ConfigInvalid => 20,
            Self::MaterialInvalid => 21,
            Self::ListenerInitFailed => 22,
            Self::RuntimeFailed => 23,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::ConfigInvalid => "config_invalid",
            Self::MaterialInvalid => "material_invalid",
            Self::ListenerInitFailed => "listener_init_failed",
            Self::RuntimeFailed => "runtime_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RunOutcome {
    class: ExitClass,
    detail: Option<String>,
    report: Option<TestReport>,
}

impl RunOutcome {
    fn ok(report: TestReport) -> Self {
        Self {
            class: ExitClass::Ok,
            detail: Some(format!("test {} finished as {}", report.test_id, report.status)),
            report: Some(report),
        }
    }

    fn error(class: ExitClass, detail: impl Into<String>) -> Self {
        Self {
            class,
            detail: Some(detail.into()),
            report: None,
        }
    }

    fn exit_code(&self) -> i32 {
        self.class.code()
    }

    fn status_record(&self) -> StatusRecord {
        let mut record = StatusRecord::new(
            "exit",
            if self.class == ExitClass::Ok {
                "ok"
            } else {
                "error"
            },
            self.exit_code(),
            self.class.label(),
            self.detail.clone(),
        );
        record.report = self.report.clone();
        record
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct StatusRecord {
    schema: &'static str,
    stage: &'static str,
    outcome: &'static str,
    exit_code: i32,
    exit_class: &'static str,
    unix_ms: u128,
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<TestReport>,
}

impl StatusRecord {
    fn new(
        stage: &'static str,
        outcome: &'static str,
        exit_code: i32,
        exit_class: &'static str,
        detail: Option<String>,
    ) -> Self {
        Self {
            schema: STATUS_SCHEMA,
            stage,
            outcome,
            exit_code,
            exit_class,
            unix_ms: now_unix_ms(),
            detail,
            report: None,
        }
    }
}

#[derive(Debug, Default)]
struct StatusEmitter {
    status_file: Option<Mutex<BufWriter<File>>>,
}

impl StatusEmitter {
    fn from_env() -> Self {
        let Some(path) = env_value(ENV_STATUS_PATH) else {
            return Self::default();
        };

        let status_file = match open_status_file(&path) {
            Ok(file) => Some(Mutex::new(BufWriter::new(file))),
            Err(error) => {
                tracing::warn!(%path, %error, "failed to open status stream file");
                None
            }
        };
        Self { status_file }
    }

    fn emit(&self, record: StatusRecord) {
        let json = match serde_json::to_string(&record) {
            Ok(value) => value,
            Err(error) => {
                tracing::error!(%error, "failed to serialize status record");
                return;
            }
        };

        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{STATUS_PREFIX}{json}");
        let _ = stderr.flush();

        if let Some(status_file) = self.status_file.as_ref() {
            if let Ok(mut writer) = status_file.lock() {
                let _ = writeln!(writer, "{json}");
                let _ = writer.flush();
            }
        }
    }
}

/// Everything one run needs, read from `PRETENSE_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RunnerSettings {
    harness: HarnessConfig,
    test_id: String,
    host_to_test: String,
    test_chain_path: String,
    test_key_path: String,
    testing_method: TestingMethod,
}

impl RunnerSettings {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let mut harness = HarnessConfig::default();

        if let Some(bind) = lookup(ENV_BIND) {
            harness.bind = bind
                .parse::<SocketAddr>()
                .map_err(|error| format!("{ENV_BIND} must be ip:port: {error}"))?;
        }
        let destination = required(&lookup, ENV_DESTINATION)?;
        harness.destination = Destination::parse(&destination)
            .map_err(|error| format!("{ENV_DESTINATION}: {error}"))?;

        harness.authority.ca_cert_pem_path = lookup(ENV_CA_CERT_PATH);
        harness.authority.ca_key_pem_path = lookup(ENV_CA_KEY_PATH);

        if let Some(kind) = lookup(ENV_SOURCE) {
            harness.source.kind = kind
                .parse::<SourceKind>()
                .map_err(|error| format!("{ENV_SOURCE}: {error}"))?;
        }
        harness.source.upstream = lookup(ENV_UPSTREAM);
        if let Some(timeout_ms) = parse_nonzero_u64(&lookup, ENV_HANDSHAKE_TIMEOUT_MS)? {
            harness.timeouts.handshake_timeout_ms = timeout_ms;
        }
        if let Some(timeout_ms) = parse_nonzero_u64(&lookup, ENV_IDLE_TIMEOUT_MS)? {
            harness.timeouts.idle_timeout_ms = timeout_ms;
        }
        harness.validate().map_err(|error| error.to_string())?;

        let testing_method = match lookup(ENV_TESTING_METHOD) {
            Some(raw) => raw
                .parse::<TestingMethod>()
                .map_err(|error| format!("{ENV_TESTING_METHOD}: {error}"))?,
            None => TestingMethod::TlsHandshake,
        };

        Ok(Self {
            harness,
            test_id: required(&lookup, ENV_TEST_ID)?,
            host_to_test: required(&lookup, ENV_HOST_TO_TEST)?,
            test_chain_path: required(&lookup, ENV_TEST_CHAIN_PATH)?,
            test_key_path: required(&lookup, ENV_TEST_KEY_PATH)?,
            testing_method,
        })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let status_emitter = StatusEmitter::from_env();
    status_emitter.emit(StatusRecord::new(
        "startup",
        "in_progress",
        0,
        "ok",
        Some("bootstrapping test listener".to_string()),
    ));

    let outcome = run_single_test(&status_emitter).await;
    status_emitter.emit(outcome.status_record());
    std::process::exit(outcome.exit_code());
}

async fn run_single_test(status_emitter: &StatusEmitter) -> RunOutcome {
    let settings = match RunnerSettings::from_lookup(env_value) {
        Ok(settings) => settings,
        Err(error) => return RunOutcome::error(ExitClass::ConfigInvalid, error),
    };

    let authority = match FallbackAuthority::new(settings.harness.authority.clone()) {
        Ok(authority) => Arc::new(authority),
        Err(error) => return RunOutcome::error(ExitClass::MaterialInvalid, error.to_string()),
    };
    let chain = match TestChain::from_pem_files(&settings.test_chain_path, &settings.test_key_path)
    {
        Ok(chain) => chain,
        Err(error) => {
            return RunOutcome::error(
                ExitClass::MaterialInvalid,
                format!("test {}: {error}", settings.test_id),
            )
        }
    };

    let coordinator = Arc::new(RecordingCoordinator::new(Arc::clone(&authority)));
    let test = TestCase::from_chain(&settings.test_id, &settings.host_to_test, &chain);
    if let Err(error) = coordinator.set_current_test(test, settings.testing_method) {
        return RunOutcome::error(ExitClass::RuntimeFailed, error.to_string());
    }

    let listener = match TcpListener::bind(settings.harness.bind).await {
        Ok(listener) => listener,
        Err(error) => {
            return RunOutcome::error(
                ExitClass::ListenerInitFailed,
                format!("bind {} failed: {error}", settings.harness.bind),
            )
        }
    };
    let local_addr = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| settings.harness.bind.to_string());
    status_emitter.emit(StatusRecord::new(
        "running",
        "ready",
        0,
        "ok",
        Some(format!(
            "listening on {local_addr} for test {} against {}",
            settings.test_id, settings.host_to_test
        )),
    ));

    let options = ServerOptions::from_config(&settings.harness);
    let result = match settings.harness.source.kind {
        SourceKind::Mint => {
            serve_until_reported(&coordinator, MintingCertificateSource, listener, options).await
        }
        SourceKind::Resign => {
            let source = UpstreamResigningSource::new(
                settings.harness.source.upstream.clone(),
                settings.harness.timeouts.upstream_connect_timeout(),
            );
            serve_until_reported(&coordinator, source, listener, options).await
        }
    };
    if let Err(error) = result {
        return RunOutcome::error(ExitClass::RuntimeFailed, error);
    }

    match coordinator.reports() {
        Ok(reports) => match reports.into_iter().next() {
            Some(report) => RunOutcome::ok(report),
            None => RunOutcome::error(
                ExitClass::RuntimeFailed,
                "listener stopped before the test reported",
            ),
        },
        Err(error) => RunOutcome::error(ExitClass::RuntimeFailed, error.to_string()),
    }
}

/// Serves until the coordinator records a report or the process is
/// interrupted.
async fn serve_until_reported<S: CertificateSource>(
    coordinator: &Arc<RecordingCoordinator>,
    source: S,
    listener: TcpListener,
    options: ServerOptions,
) -> Result<(), String> {
    let mut reports = coordinator.subscribe();
    let shutdown = async move {
        tokio::select! {
            _ = reports.recv() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupted before the test reported");
            }
        }
    };

    let summary = run_test_listener_server(
        Arc::clone(coordinator),
        Arc::new(source),
        listener,
        options,
        shutdown,
    )
    .await
    .map_err(|error| error.to_string())?;
    tracing::info!(
        accepted = summary.accepted_connections,
        failed = summary.failed_connections,
        "test listener finished"
    );
    Ok(())
}

fn env_value(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<String, String> {
    lookup(name).ok_or_else(|| format!("{name} must be set"))
}

fn parse_nonzero_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<u64>, String> {
    let Some(value) = lookup(name) else {
        return Ok(None);
    };
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("{name} must be a positive integer: {error}"))?;
    if parsed == 0 {
        return Err(format!("{name} must be greater than zero"));
    }
    Ok(Some(parsed))
}

fn open_status_file(path: &str) -> io::Result<File> {
    let path = std::path::Path::new(path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn now_unix_ms() -> u128 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis(),
        Err(_) => 0,
    }
}
