//! Bridge session lifecycle: one monitor, one device, one front-end connection.

use super::protocol::{parse_request, BridgeCommand, BridgeError, BridgeReply, ErrorCode};
use crate::device::DeviceCapabilities;
use crate::NoiseLevelMonitor;
use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const IPC_LOOP_WAIT_MS: u64 = 50;
const RUNNING_NOTIFICATION_TITLE: &str = "NightShield";
const RUNNING_NOTIFICATION_MESSAGE: &str = "NightShield is running";

/// Command handler owning the monitor and device collaborators for one front-end.
pub struct BridgeSession {
    monitor: Arc<NoiseLevelMonitor>,
    device: Box<dyn DeviceCapabilities>,
    listening_requested: bool,
    stall_reported: bool,
}

impl BridgeSession {
    pub fn new(monitor: Arc<NoiseLevelMonitor>, device: Box<dyn DeviceCapabilities>) -> Self {
        Self {
            monitor,
            device,
            listening_requested: false,
            stall_reported: false,
        }
    }

    pub fn monitor(&self) -> &NoiseLevelMonitor {
        &self.monitor
    }

    /// Parse and execute one request line.
    pub fn handle_line(&mut self, line: &str) -> BridgeReply {
        match parse_request(line) {
            Ok(command) => self.handle_command(command),
            Err(err) => {
                tracing::debug!(code = ?err.code, message = %err.message, "rejected request");
                BridgeReply::Error(err)
            }
        }
    }

    pub fn handle_command(&mut self, command: BridgeCommand) -> BridgeReply {
        tracing::debug!(?command, "bridge command");
        match command {
            BridgeCommand::StartListening { record_time } => self.start_listening(record_time),
            BridgeCommand::EndListening => self.end_listening(),
            BridgeCommand::GetAudioLevel => BridgeReply::level(self.monitor.current_level()),
            BridgeCommand::EnableFlashLight => device_reply(self.device.set_torch(true)),
            BridgeCommand::DisableFlashLight => device_reply(self.device.set_torch(false)),
            BridgeCommand::PlayAlarm => device_reply(self.device.play_alarm()),
            BridgeCommand::StopAlarm => device_reply(self.device.stop_alarm()),
            BridgeCommand::SendNotification { title, message } => {
                device_reply(self.device.notify(&title, &message))
            }
        }
    }

    fn start_listening(&mut self, record_time: f64) -> BridgeReply {
        if self.monitor.is_listening() {
            return BridgeReply::ok(true);
        }
        if let Err(err) = self.device.acquire_wake_lock() {
            return device_reply(Err(err));
        }
        match self.monitor.start(record_time) {
            Ok(()) => {
                self.listening_requested = true;
                // Foreground notice while the microphone is in use.
                if let Err(err) = self
                    .device
                    .notify(RUNNING_NOTIFICATION_TITLE, RUNNING_NOTIFICATION_MESSAGE)
                {
                    tracing::warn!(error = %format!("{err:#}"), "running notification failed");
                }
                BridgeReply::ok(true)
            }
            Err(err) => {
                // Leave nothing half-started behind a failed start.
                if let Err(release_err) = self.device.release_wake_lock() {
                    tracing::warn!(error = %format!("{release_err:#}"), "wake lock release failed");
                }
                BridgeReply::Error(err.into())
            }
        }
    }

    fn end_listening(&mut self) -> BridgeReply {
        self.listening_requested = false;
        self.monitor.stop();
        device_reply(self.device.release_wake_lock())
    }

    /// Periodic check between commands: report a sampler that ended on its own
    /// or one that was stopped but still holds the input.
    pub fn poll_health(&mut self) {
        if self.listening_requested && !self.monitor.is_listening() {
            self.listening_requested = false;
            tracing::warn!("sampler stopped without endListening; input was lost");
        }
        if self.monitor.reap_stopped() {
            self.stall_reported = false;
        } else if !self.stall_reported {
            self.stall_reported = true;
            tracing::warn!("stopped sampler has not released the audio input");
        }
    }

    /// True while a stopped sampler is known to be stuck holding the input.
    pub fn sampler_stalled(&self) -> bool {
        self.stall_reported
    }

    /// Tear down on disconnect: stop sampling and drop the wake lock.
    pub fn close(&mut self) {
        self.listening_requested = false;
        if !self.monitor.shutdown() {
            tracing::warn!("sampler did not exit during bridge shutdown");
        }
        if let Err(err) = self.device.release_wake_lock() {
            tracing::warn!(error = %format!("{err:#}"), "wake lock release failed");
        }
    }
}

fn device_reply(result: Result<()>) -> BridgeReply {
    match result {
        Ok(()) => BridgeReply::ok(true),
        Err(err) => BridgeReply::Error(BridgeError::new(
            ErrorCode::DeviceFailure,
            format!("{err:#}"),
        )),
    }
}

fn spawn_line_reader<R>(mut reader: R, tx: Sender<String>) -> thread::JoinHandle<()>
where
    R: BufRead + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    // Invalid UTF-8 becomes a malformed request, not a dead reader.
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::debug!(%err, "bridge input read failed");
                    break;
                }
            }
        }
        tracing::debug!("bridge input reader exiting");
    })
}

/// Serve requests from `reader` until it closes, writing one reply per line.
pub fn serve<R, W>(session: &mut BridgeSession, reader: R, mut writer: W) -> Result<()>
where
    R: BufRead + Send + 'static,
    W: Write,
{
    let (line_tx, line_rx): (Sender<String>, Receiver<String>) = unbounded();
    let reader_handle = spawn_line_reader(reader, line_tx);

    let result = loop {
        match line_rx.recv_timeout(Duration::from_millis(IPC_LOOP_WAIT_MS)) {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let reply = session.handle_line(trimmed);
                let written = writeln!(writer, "{}", reply.to_json_line())
                    .and_then(|()| writer.flush())
                    .context("failed to write bridge reply");
                if let Err(err) = written {
                    break Err(err);
                }
            }
            Err(RecvTimeoutError::Timeout) => session.poll_health(),
            Err(RecvTimeoutError::Disconnected) => {
                tracing::debug!("bridge input closed");
                break Ok(());
            }
        }
    };

    session.close();
    if reader_handle.is_finished() {
        let _ = reader_handle.join();
    }
    result
}

/// Run the bridge over stdin/stdout until stdin closes.
pub fn run_ipc_mode(session: &mut BridgeSession) -> Result<()> {
    tracing::info!("bridge started on stdio");
    let result = serve(session, io::BufReader::new(io::stdin()), io::stdout());
    tracing::info!("bridge exiting");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SyntheticSource;
    use crate::device::HeadlessDevice;
    use crate::ipc::ReplyValue;
    use crate::device::Notification;
    use crate::MonitorError;
    use crossbeam_channel::Receiver;
    use serde_json::Value;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn synthetic_session(amplitude: i16) -> BridgeSession {
        let monitor = NoiseLevelMonitor::new(Arc::new(SyntheticSource::new(amplitude).unpaced()));
        BridgeSession::new(Arc::new(monitor), Box::new(HeadlessDevice::new()))
    }

    /// Headless device the test keeps a handle on after the session takes it.
    #[derive(Clone, Default)]
    struct SharedDevice(Arc<Mutex<HeadlessDevice>>);

    impl SharedDevice {
        fn inner(&self) -> std::sync::MutexGuard<'_, HeadlessDevice> {
            self.0.lock().expect("device lock")
        }
    }

    impl DeviceCapabilities for SharedDevice {
        fn set_torch(&mut self, on: bool) -> Result<()> {
            self.inner().set_torch(on)
        }

        fn play_alarm(&mut self) -> Result<()> {
            self.inner().play_alarm()
        }

        fn stop_alarm(&mut self) -> Result<()> {
            self.inner().stop_alarm()
        }

        fn notify(&mut self, title: &str, message: &str) -> Result<()> {
            self.inner().notify(title, message)
        }

        fn acquire_wake_lock(&mut self) -> Result<()> {
            self.inner().acquire_wake_lock()
        }

        fn release_wake_lock(&mut self) -> Result<()> {
            self.inner().release_wake_lock()
        }
    }

    /// Input whose reads block until the test sends on the gate.
    struct HangingSource {
        gate: Receiver<()>,
        reads: Arc<AtomicUsize>,
    }

    struct HangingStream {
        gate: Receiver<()>,
        reads: Arc<AtomicUsize>,
    }

    impl crate::audio::AudioSource for HangingSource {
        fn open(
            &self,
            _spec: &crate::audio::InputSpec,
        ) -> Result<Box<dyn crate::audio::InputStream>, MonitorError> {
            Ok(Box::new(HangingStream {
                gate: self.gate.clone(),
                reads: Arc::clone(&self.reads),
            }))
        }
    }

    impl crate::audio::InputStream for HangingStream {
        fn read_block(&mut self, _buf: &mut [i16]) -> Result<usize> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.gate
                .recv()
                .map(|()| 0)
                .map_err(|_| anyhow::anyhow!("gate closed"))
        }

        fn close(&mut self) {}
    }

    fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while !condition() {
            assert!(std::time::Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    struct UnavailableSource;

    impl crate::audio::AudioSource for UnavailableSource {
        fn open(
            &self,
            _spec: &crate::audio::InputSpec,
        ) -> Result<Box<dyn crate::audio::InputStream>, MonitorError> {
            Err(MonitorError::ResourceUnavailable(
                "record permission not granted".to_string(),
            ))
        }
    }

    fn reply_json(reply: &BridgeReply) -> Value {
        serde_json::from_str(&reply.to_json_line()).expect("reply is JSON")
    }

    #[test]
    fn start_get_end_round_trip() {
        let device = SharedDevice::default();
        let monitor = NoiseLevelMonitor::new(Arc::new(SyntheticSource::new(1000).unpaced()));
        let mut session = BridgeSession::new(Arc::new(monitor), Box::new(device.clone()));
        assert_eq!(device.inner().notifications_sent(), 0);
        assert_eq!(
            session.handle_line(r#"{"method":"getAudioLevel"}"#),
            BridgeReply::level(0.0)
        );
        assert_eq!(
            session.handle_line(r#"{"method":"startListening","recordTime":1}"#),
            BridgeReply::ok(true)
        );
        assert!(session.monitor().is_listening());
        assert!(device.inner().wake_lock_held());
        assert_eq!(
            device.inner().last_notification(),
            Some(&Notification {
                title: "NightShield".to_string(),
                message: "NightShield is running".to_string(),
            })
        );

        wait_until("window closed", || session.monitor().stats().windows_closed > 0);
        match session.handle_line(r#"{"method":"getAudioLevel"}"#) {
            BridgeReply::Ok(ReplyValue::Level(db)) => {
                assert!((db - 30.0).abs() < 1e-9, "level {db}")
            }
            other => panic!("unexpected reply {other:?}"),
        }

        assert_eq!(
            session.handle_line(r#"{"method":"endListening"}"#),
            BridgeReply::ok(true)
        );
        assert!(!session.monitor().is_listening());
        assert!(!device.inner().wake_lock_held());
        session.close();
    }

    #[test]
    fn start_while_listening_is_ok() {
        let mut session = synthetic_session(10);
        let start = r#"{"method":"startListening","recordTime":1000}"#;
        assert_eq!(session.handle_line(start), BridgeReply::ok(true));
        assert_eq!(session.handle_line(start), BridgeReply::ok(true));
        session.close();
    }

    #[test]
    fn invalid_record_time_is_reported() {
        let mut session = synthetic_session(10);
        let reply = session.handle_line(r#"{"method":"startListening","recordTime":-5}"#);
        assert_eq!(reply_json(&reply)["error"]["code"], "invalid_configuration");
        assert!(!session.monitor().is_listening());
    }

    #[test]
    fn unavailable_input_is_reported_and_level_stays_zero() {
        let monitor = NoiseLevelMonitor::new(Arc::new(UnavailableSource));
        let mut session = BridgeSession::new(Arc::new(monitor), Box::new(HeadlessDevice::new()));
        let reply = session.handle_line(r#"{"method":"startListening","recordTime":1000}"#);
        assert_eq!(reply_json(&reply)["error"]["code"], "resource_unavailable");
        assert_eq!(
            session.handle_line(r#"{"method":"getAudioLevel"}"#),
            BridgeReply::level(0.0)
        );
    }

    #[test]
    fn end_listening_when_idle_is_ok() {
        let mut session = synthetic_session(10);
        assert_eq!(
            session.handle_line(r#"{"method":"endListening"}"#),
            BridgeReply::ok(true)
        );
    }

    #[test]
    fn device_commands_are_forwarded() {
        let mut session = synthetic_session(10);
        for line in [
            r#"{"method":"enableFlashLight"}"#,
            r#"{"method":"playAlarm"}"#,
            r#"{"method":"sendNotification","title":"NightShield","message":"Noise detected"}"#,
            r#"{"method":"stopAlarm"}"#,
            r#"{"method":"disableFlashLight"}"#,
        ] {
            assert_eq!(session.handle_line(line), BridgeReply::ok(true), "{line}");
        }
        assert!(!session.monitor().is_listening());
    }

    #[test]
    fn serve_replies_once_per_non_empty_line() {
        let mut session = synthetic_session(10);
        let input = concat!(
            "{\"method\":\"getAudioLevel\"}\n",
            "\n",
            "{\"method\":\"bogus\"}\n",
            "garbage\n",
            "{\"method\":\"endListening\"}\n",
        );
        let mut output = Vec::new();
        serve(&mut session, Cursor::new(input.as_bytes().to_vec()), &mut output).expect("serve");

        let text = String::from_utf8(output).expect("utf8");
        let replies: Vec<Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(replies.len(), 4);
        assert_eq!(replies[0]["ok"], 0.0);
        assert_eq!(replies[1]["error"]["code"], "not_implemented");
        assert_eq!(replies[2]["error"]["code"], "invalid_request");
        assert_eq!(replies[3]["ok"], true);
    }

    #[test]
    fn serve_stops_monitor_when_input_closes() {
        let mut session = synthetic_session(10);
        let input = "{\"method\":\"startListening\",\"recordTime\":1000}\n";
        let mut output = Vec::new();
        serve(&mut session, Cursor::new(input.as_bytes().to_vec()), &mut output).expect("serve");
        assert!(!session.monitor().is_listening());
    }

    #[test]
    fn invalid_utf8_line_gets_a_reply_and_serving_continues() {
        let mut session = synthetic_session(10);
        let mut input = b"\xff\xfe{\"method\":\"getAudioLevel\"}\n".to_vec();
        input.extend_from_slice(b"{\"method\":\"getAudioLevel\"}\r\n");
        let mut output = Vec::new();
        serve(&mut session, Cursor::new(input), &mut output).expect("serve");

        let text = String::from_utf8(output).expect("utf8");
        let replies: Vec<Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["error"]["code"], "invalid_request");
        assert_eq!(replies[1]["ok"], 0.0);
    }

    #[test]
    fn poll_health_flags_a_stopped_sampler_that_keeps_the_input() {
        let (release, gate) = crossbeam_channel::unbounded();
        let reads = Arc::new(AtomicUsize::new(0));
        let monitor = NoiseLevelMonitor::new(Arc::new(HangingSource {
            gate,
            reads: Arc::clone(&reads),
        }))
        .with_stop_timeout(Duration::from_millis(50));
        let mut session = BridgeSession::new(Arc::new(monitor), Box::new(HeadlessDevice::new()));

        assert_eq!(
            session.handle_line(r#"{"method":"startListening","recordTime":1000}"#),
            BridgeReply::ok(true)
        );
        wait_until("read in progress", || reads.load(Ordering::SeqCst) == 1);
        assert_eq!(
            session.handle_line(r#"{"method":"endListening"}"#),
            BridgeReply::ok(true)
        );
        thread::sleep(Duration::from_millis(120));
        session.poll_health();
        assert!(session.sampler_stalled());

        release.send(()).expect("release hung read");
        wait_until("stall cleared", || {
            session.poll_health();
            !session.sampler_stalled()
        });
        session.close();
    }
}
