use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::error::AppError;
use crate::app::logcat::chain::HandlerChain;
use crate::app::logcat::parser::LogParser;

/// A restartable producer of log lines.
pub trait LineSource: Send + Sync {
    fn open(&self, trace_id: &str) -> Result<Box<dyn BufRead + Send>, AppError>;
}

pub struct LogStreamMonitor {
    source: Arc<dyn LineSource>,
    parser: Arc<LogParser>,
    chain: Arc<HandlerChain>,
    restart_delay: Duration,
}

pub struct LogMonitorHandle {
    stop: Arc<AtomicBool>,
    tailer: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl LogMonitorHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Stops and waits for the dispatcher. The tailer is detached if it is blocked on a read.
    pub fn join(mut self) {
        self.stop();
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }
        if let Some(tailer) = self.tailer.take() {
            if tailer.is_finished() {
                let _ = tailer.join();
            }
        }
    }
}

impl LogStreamMonitor {
    pub fn new(source: Arc<dyn LineSource>, parser: LogParser, chain: HandlerChain) -> Self {
        Self {
            source,
            parser: Arc::new(parser),
            chain: Arc::new(chain),
            restart_delay: Duration::from_millis(500),
        }
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn start(&self) -> Result<LogMonitorHandle, AppError> {
        let trace_id = Uuid::new_v4().to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<String>();

        let source = Arc::clone(&self.source);
        let tailer_stop = Arc::clone(&stop);
        let tailer_trace = trace_id.clone();
        let restart_delay = self.restart_delay;
        let tailer = std::thread::Builder::new()
            .name("logcat-tailer".to_string())
            .spawn(move || tail_loop(source, tx, tailer_stop, restart_delay, &tailer_trace))
            .map_err(|err| AppError::system(format!("Failed to spawn log tailer: {err}"), &trace_id))?;

        let parser = Arc::clone(&self.parser);
        let chain = Arc::clone(&self.chain);
        let dispatch_stop = Arc::clone(&stop);
        let dispatch_trace = trace_id.clone();
        let dispatcher = std::thread::Builder::new()
            .name("logcat-dispatch".to_string())
            .spawn(move || dispatch_loop(rx, parser, chain, dispatch_stop, &dispatch_trace))
            .map_err(|err| AppError::system(format!("Failed to spawn log dispatcher: {err}"), &trace_id))?;

        info!(trace_id = %trace_id, "log stream monitor started");
        Ok(LogMonitorHandle {
            stop,
            tailer: Some(tailer),
            dispatcher: Some(dispatcher),
        })
    }
}

fn tail_loop(
    source: Arc<dyn LineSource>,
    tx: Sender<String>,
    stop: Arc<AtomicBool>,
    restart_delay: Duration,
    trace_id: &str,
) {
    while !stop.load(Ordering::Relaxed) {
        let reader = match source.open(trace_id) {
            Ok(reader) => reader,
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "failed to open log source");
                std::thread::sleep(restart_delay);
                continue;
            }
        };
        let mut reader = reader;
        let mut forwarded = 0usize;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(decode_line(&buf)).is_err() {
                        return;
                    }
                    forwarded += 1;
                }
                Err(err) => {
                    warn!(trace_id = %trace_id, error = %err, "log source read failed");
                    break;
                }
            }
            if stop.load(Ordering::Relaxed) {
                return;
            }
        }
        info!(trace_id = %trace_id, forwarded, "log source ended, restarting");
        // A source that closes without producing anything is probably failing fast.
        if forwarded == 0 {
            std::thread::sleep(restart_delay);
        }
    }
}

/// Invalid UTF-8 becomes U+FFFD so one bad byte never costs the rest of the stream.
fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    while end > 0 && matches!(raw[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn dispatch_loop(
    rx: Receiver<String>,
    parser: Arc<LogParser>,
    chain: Arc<HandlerChain>,
    stop: Arc<AtomicBool>,
    trace_id: &str,
) {
    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(line) => {
                let event = parser.parse(&line);
                let invoked = chain.dispatch(&event);
                debug!(trace_id = %trace_id, invoked, "log line dispatched");
            }
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!(trace_id = %trace_id, "log dispatch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::logcat::chain::{HandlerSpec, LogHandler};
    use crate::app::models::LogEvent;
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Serves the same lines on every open and counts how often it was opened.
    struct ScriptedSource {
        lines: Vec<String>,
        opens: AtomicUsize,
    }

    impl LineSource for ScriptedSource {
        fn open(&self, _trace_id: &str) -> Result<Box<dyn BufRead + Send>, AppError> {
            let attempt = self.opens.fetch_add(1, Ordering::SeqCst);
            if attempt == 1 {
                return Err(AppError::dependency("device offline", "test"));
            }
            Ok(Box::new(Cursor::new(self.lines.join("\n").into_bytes())))
        }
    }

    struct Collect(Arc<Mutex<Vec<String>>>);

    impl LogHandler for Collect {
        fn handle(&self, event: &LogEvent) {
            if let Some(message) = &event.message {
                self.0.lock().expect("seen").push(message.clone());
            }
        }
    }

    fn wait_until(deadline: Duration, check: impl Fn() -> bool) -> bool {
        let started = Instant::now();
        while started.elapsed() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    /// Serves raw bytes on the first open and nothing afterwards.
    struct RawSource {
        bytes: Vec<u8>,
        opens: AtomicUsize,
    }

    impl LineSource for RawSource {
        fn open(&self, _trace_id: &str) -> Result<Box<dyn BufRead + Send>, AppError> {
            let bytes = if self.opens.fetch_add(1, Ordering::SeqCst) == 0 {
                self.bytes.clone()
            } else {
                Vec::new()
            };
            Ok(Box::new(Cursor::new(bytes)))
        }
    }

    #[test]
    fn decode_line_trims_line_endings() {
        assert_eq!(decode_line(b"abc\r\n"), "abc");
        assert_eq!(decode_line(b"abc"), "abc");
        assert_eq!(decode_line(b"a\xffb\n"), "a\u{fffd}b");
    }

    #[test]
    fn invalid_utf8_line_does_not_drop_the_rest_of_the_stream() {
        let mut bytes = b"2022-05-07 13:45:39.597  1310  1812 I Tag: first\n".to_vec();
        bytes.extend_from_slice(b"2022-05-07 13:45:39.598  1310  1812 I Tag: bad \xff\xfe\n");
        bytes.extend_from_slice(b"2022-05-07 13:45:39.599  1310  1812 I Tag: third\r\n");
        let source = Arc::new(RawSource {
            bytes,
            opens: AtomicUsize::new(0),
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let chain = HandlerChain::builder()
            .register(HandlerSpec::new("Collect", 1), Arc::new(Collect(Arc::clone(&seen))))
            .build();
        let monitor = LogStreamMonitor::new(source, LogParser::default(), chain)
            .with_restart_delay(Duration::from_millis(5));
        let handle = monitor.start().expect("start");

        assert!(wait_until(Duration::from_secs(5), || {
            seen.lock().expect("seen").len() >= 3
        }));
        handle.join();

        let seen = seen.lock().expect("seen");
        assert_eq!(seen[0], "first");
        assert_eq!(seen[1], "bad \u{fffd}\u{fffd}");
        assert_eq!(seen[2], "third");
    }

    #[test]
    fn restarts_source_after_eof_and_open_failure() {
        let source = Arc::new(ScriptedSource {
            lines: vec![
                "2022-05-07 13:45:39.597  1310  1812 I Tag: first".to_string(),
                "2022-05-07 13:45:39.598  1310  1812 I Tag: second".to_string(),
            ],
            opens: AtomicUsize::new(0),
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let chain = HandlerChain::builder()
            .register(HandlerSpec::new("Collect", 1), Arc::new(Collect(Arc::clone(&seen))))
            .build();
        let monitor = LogStreamMonitor::new(source.clone(), LogParser::default(), chain)
            .with_restart_delay(Duration::from_millis(5));
        let handle = monitor.start().expect("start");

        assert!(wait_until(Duration::from_secs(5), || {
            seen.lock().expect("seen").len() >= 4
        }));
        handle.join();

        assert!(source.opens.load(Ordering::SeqCst) >= 3);
        let seen = seen.lock().expect("seen");
        assert_eq!(&seen[..4], &["first", "second", "first", "second"]);
    }
}
