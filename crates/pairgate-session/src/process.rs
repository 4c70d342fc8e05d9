//! Handshake provider backed by an external helper process
//!
//! The helper is started as `<program> [args...] --phone <digits> --auth-dir <dir>`
//! and reports progress as one JSON object per line on stdout:
//!
//! ```text
//! {"event":"pairing_code","code":"ABCD1234"}
//! {"event":"qr","data":"2@..."}
//! {"event":"open"}
//! {"event":"close","reason":"logged_out"}
//! {"event":"error","message":"..."}
//! ```
//!
//! `start` returns once the first `pairing_code` line arrives. After that a
//! reader task forwards events until the helper exits or the handle is stopped.

use crate::handshake::{
    CloseReason, HandshakeError, HandshakeEvents, HandshakeHandle, HandshakeProvider,
    HandshakeResult, Pairing,
};
use crate::session::PairingCode;
use crate::storage::CredentialDir;
use futures::future::BoxFuture;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default time to wait for the helper's pairing code
pub const DEFAULT_CODE_TIMEOUT: Duration = Duration::from_secs(30);

/// One line of helper output
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
enum HelperEvent {
    PairingCode {
        code: String,
    },
    Qr {
        data: String,
    },
    Open,
    Close {
        #[serde(default)]
        reason: String,
    },
    Error {
        message: String,
    },
}

type HelperLines = Lines<BufReader<ChildStdout>>;

fn parse_line(line: &str) -> Option<HelperEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Ignoring malformed handshake helper output: {}", e);
            None
        }
    }
}

/// Deliver an event that arrived after (or alongside) pairing code issuance
fn dispatch(event: HelperEvent, events: &dyn HandshakeEvents) {
    match event {
        HelperEvent::Qr { data } => events.on_scannable_code(data),
        HelperEvent::Open => events.on_opened(),
        HelperEvent::Close { reason } => {
            events.on_closed(reason.parse().unwrap_or(CloseReason::ConnectionClosed))
        }
        HelperEvent::PairingCode { .. } => debug!("Ignoring repeated pairing code"),
        HelperEvent::Error { message } => warn!("Handshake helper reported: {}", message),
    }
}

/// Read helper output until the pairing code shows up
async fn wait_for_code(
    lines: &mut HelperLines,
    events: &dyn HandshakeEvents,
) -> HandshakeResult<String> {
    loop {
        let Some(line) = lines.next_line().await? else {
            return Err(HandshakeError::Exited);
        };
        match parse_line(&line) {
            Some(HelperEvent::PairingCode { code }) => return Ok(code),
            Some(HelperEvent::Error { message }) => return Err(HandshakeError::Rejected(message)),
            Some(HelperEvent::Close { reason }) => {
                let reason: CloseReason = reason.parse().unwrap_or(CloseReason::ConnectionClosed);
                if reason.is_authoritative() {
                    return Err(HandshakeError::Rejected(reason.to_string()));
                }
                events.on_closed(reason);
            }
            Some(other) => dispatch(other, events),
            None => {}
        }
    }
}

async fn forward_events(mut lines: HelperLines, events: Arc<dyn HandshakeEvents>) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(event) = parse_line(&line) {
                    dispatch(event, events.as_ref());
                }
            }
            Ok(None) => {
                debug!("Handshake helper closed its output");
                break;
            }
            Err(e) => {
                warn!("Failed to read handshake helper output: {}", e);
                break;
            }
        }
    }
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!("Handshake helper already gone: {}", e);
    }
}

/// Provider that runs one helper process per session
#[derive(Debug, Clone)]
pub struct ProcessProvider {
    program: String,
    args: Vec<String>,
    code_timeout: Duration,
}

impl ProcessProvider {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            code_timeout: DEFAULT_CODE_TIMEOUT,
        }
    }

    /// Builder pattern: set how long to wait for the pairing code
    pub fn with_code_timeout(mut self, timeout: Duration) -> Self {
        self.code_timeout = timeout;
        self
    }

    async fn launch(
        &self,
        phone_number: &str,
        dir: &CredentialDir,
        events: Arc<dyn HandshakeEvents>,
    ) -> HandshakeResult<Pairing> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--phone")
            .arg(phone_number)
            .arg("--auth-dir")
            .arg(dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let Some(stdout) = child.stdout.take() else {
            terminate(&mut child).await;
            return Err(HandshakeError::Exited);
        };
        let mut lines = BufReader::new(stdout).lines();

        let waited =
            tokio::time::timeout(self.code_timeout, wait_for_code(&mut lines, events.as_ref()))
                .await;
        let code = match waited {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                terminate(&mut child).await;
                return Err(e);
            }
            Err(_) => {
                terminate(&mut child).await;
                return Err(HandshakeError::Timeout(self.code_timeout));
            }
        };

        info!(
            session_id = %dir.session_id(),
            pid = child.id(),
            "Handshake helper issued pairing code"
        );

        let reader = tokio::spawn(forward_events(lines, events));
        Ok(Pairing {
            handle: Box::new(ProcessHandle {
                child: Some(child),
                reader: Some(reader),
            }),
            code: PairingCode::new(code),
        })
    }
}

impl HandshakeProvider for ProcessProvider {
    fn start<'a>(
        &'a self,
        phone_number: &'a str,
        dir: &'a CredentialDir,
        events: Arc<dyn HandshakeEvents>,
    ) -> BoxFuture<'a, HandshakeResult<Pairing>> {
        Box::pin(self.launch(phone_number, dir, events))
    }
}

/// Running helper process plus the task forwarding its events
struct ProcessHandle {
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
}

impl HandshakeHandle for ProcessHandle {
    fn stop(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            // Unregister the listener first so nothing is delivered while dying
            if let Some(reader) = self.reader.take() {
                reader.abort();
            }
            if let Some(mut child) = self.child.take() {
                terminate(&mut child).await;
                debug!("Handshake helper stopped");
            }
        })
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;
    use crate::storage::CredentialStore;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl HandshakeEvents for Recorder {
        fn on_scannable_code(&self, payload: String) {
            self.seen.lock().unwrap().push(format!("qr:{payload}"));
        }
        fn on_opened(&self) {
            self.seen.lock().unwrap().push("opened".into());
        }
        fn on_closed(&self, reason: CloseReason) {
            self.seen.lock().unwrap().push(format!("closed:{reason}"));
        }
    }

    async fn credential_dir() -> (CredentialDir, TempDir) {
        let dir = tempdir().unwrap();
        let store = CredentialStore::open(dir.path()).await.unwrap();
        let cred_dir = store.allocate(&SessionId::new()).await.unwrap();
        (cred_dir, dir)
    }

    fn shell(script: &str) -> ProcessProvider {
        ProcessProvider::new("sh", vec!["-c".into(), script.into()])
            .with_code_timeout(Duration::from_secs(5))
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(
            parse_line(r#"{"event":"pairing_code","code":"ABCD1234"}"#),
            Some(HelperEvent::PairingCode {
                code: "ABCD1234".into()
            })
        );
        assert_eq!(
            parse_line(r#"{"event":"close"}"#),
            Some(HelperEvent::Close { reason: "".into() })
        );
        assert_eq!(parse_line(r#"{"event":"open"}"#), Some(HelperEvent::Open));
        assert_eq!(parse_line("   "), None);
        assert_eq!(parse_line("connecting to network..."), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_helper_pairing_and_events() {
        let (dir, _tmp) = credential_dir().await;
        let recorder = Arc::new(Recorder::default());
        let provider = shell(
            r#"echo 'booting'
echo '{"event":"qr","data":"QR-1"}'
echo '{"event":"pairing_code","code":"abcd1234"}'
sleep 0.2
echo '{"event":"close","reason":"connection_lost"}'
echo '{"event":"open"}'
sleep 30"#,
        );

        let mut pairing = provider
            .start("15551234567", &dir, recorder.clone())
            .await
            .unwrap();
        assert_eq!(pairing.code.to_string(), "ABCD-1234");
        assert_eq!(recorder.seen(), vec!["qr:QR-1".to_string()]);

        for _ in 0..50 {
            if recorder.seen().contains(&"opened".to_string()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(
            recorder.seen(),
            vec![
                "qr:QR-1".to_string(),
                "closed:connection_lost".to_string(),
                "opened".to_string()
            ]
        );

        pairing.handle.stop().await;
        pairing.handle.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_helper_error_is_init_failure() {
        let (dir, _tmp) = credential_dir().await;
        let provider = shell(r#"echo '{"event":"error","message":"number not registered"}'"#);

        let result = provider
            .start("15551234567", &dir, Arc::new(Recorder::default()))
            .await;
        assert!(matches!(result, Err(HandshakeError::Rejected(m)) if m == "number not registered"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_helper_exit_without_code() {
        let (dir, _tmp) = credential_dir().await;
        let provider = shell("exit 0");

        let result = provider
            .start("15551234567", &dir, Arc::new(Recorder::default()))
            .await;
        assert!(matches!(result, Err(HandshakeError::Exited)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_helper_timeout() {
        let (dir, _tmp) = credential_dir().await;
        let provider = shell("sleep 30").with_code_timeout(Duration::from_millis(200));

        let result = provider
            .start("15551234567", &dir, Arc::new(Recorder::default()))
            .await;
        assert!(matches!(result, Err(HandshakeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_missing_helper() {
        let (dir, _tmp) = credential_dir().await;
        let provider = ProcessProvider::new("/nonexistent/pairgate-helper", vec![]);

        let result = provider
            .start("15551234567", &dir, Arc::new(Recorder::default()))
            .await;
        assert!(matches!(result, Err(HandshakeError::Io(_))));
    }
}
