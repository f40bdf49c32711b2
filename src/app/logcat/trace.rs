use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::app::logcat::chain::LogHandler;
use crate::app::models::{LogEvent, TraceBlock};

#[derive(Default)]
struct AggregatorState {
    last: Option<LogEvent>,
    open_head: Option<LogEvent>,
    open_body: Vec<String>,
    heads: VecDeque<LogEvent>,
    bodies: VecDeque<String>,
}

impl AggregatorState {
    fn is_trace_line(&self, event: &LogEvent) -> bool {
        if event.message_starts_with("\tat") {
            return true;
        }
        event.message_starts_with("Caused by:")
            && self
                .last
                .as_ref()
                .map(|last| last.message_starts_with("\tat"))
                .unwrap_or(false)
    }

    fn close_open_block(&mut self) {
        let Some(head) = self.open_head.take() else {
            return;
        };
        let body = std::mem::take(&mut self.open_body).join("\n");
        debug!(lines = body.lines().count(), "trace block closed");
        self.heads.push_back(head);
        self.bodies.push_back(body);
    }
}

/// Collects contiguous stack-trace lines into [`TraceBlock`]s.
///
/// The line preceding the first `\tat` becomes the block head. Head and body queues
/// share one lock, so they always have the same length.
#[derive(Default)]
pub struct TraceAggregator {
    state: Mutex<AggregatorState>,
}

impl TraceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_trace_block(&self) -> Option<TraceBlock> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert_eq!(state.heads.len(), state.bodies.len());
        let head = state.heads.pop_front()?;
        let body = state.bodies.pop_front()?;
        Some(TraceBlock { head, body })
    }

    pub fn drain(&self) -> Vec<TraceBlock> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let heads = std::mem::take(&mut state.heads);
        let bodies = std::mem::take(&mut state.bodies);
        heads
            .into_iter()
            .zip(bodies)
            .map(|(head, body)| TraceBlock { head, body })
            .collect()
    }

    pub fn pending(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.heads.len()
    }
}

impl LogHandler for TraceAggregator {
    fn handle(&self, event: &LogEvent) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_trace_line(event) {
            if state.open_head.is_none() {
                let head = state.last.clone().unwrap_or_else(|| event.clone());
                if state.last.is_some() {
                    let first = head.message.clone().unwrap_or_default();
                    state.open_body.push(first);
                }
                state.open_head = Some(head);
            }
            let line = event.message.clone().unwrap_or_default();
            state.open_body.push(line);
        } else {
            state.close_open_block();
        }
        state.last = Some(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::logcat::parser::LogParser;
    use std::sync::Arc;

    fn feed(aggregator: &TraceAggregator, lines: &[String]) {
        let parser = LogParser::default();
        for line in lines {
            aggregator.handle(&parser.parse(line));
        }
    }

    fn system_err(time: &str, pid: &str, message: &str) -> String {
        format!("2022-04-12 {time} {pid} {pid} W System.err: {message}")
    }

    #[test]
    fn empty_aggregator_yields_nothing() {
        let aggregator = TraceAggregator::new();
        assert!(aggregator.take_trace_block().is_none());
        assert_eq!(aggregator.pending(), 0);
    }

    #[test]
    fn collects_blocks_with_caused_by() {
        let mut lines = vec![
            "2022-04-12 22:37:27.392 11115 11115 I TestService: TestService started at port 53110".to_string(),
            system_err("22:37:27.394", "11115", "java.lang.Exception: Toast callstack! strTip=Test thread start"),
            system_err("22:37:27.395", "11115", "\tat android.widget.Toast.show(Toast.java:130)"),
            system_err("22:37:27.395", "11115", "\tat android.os.Looper.loop(Looper.java:154)"),
            "2022-04-12 22:37:27.405 11115 11131 E EGL_adreno: tid 11131: eglSurfaceAttrib(1338): error 0x3009".to_string(),
            "2022-04-12 22:38:28.105 11185 11185 D AndroidRuntime: Shutting down VM".to_string(),
            system_err(
                "22:38:28.123",
                "11185",
                "java.lang.RuntimeException: Unable to start activity ComponentInfo{com.integreight.onesheeld/com.facebook.FacebookActivity}",
            ),
            system_err("22:38:28.123", "11185", "\tat android.app.ActivityThread.performLaunchActivity(ActivityThread.java:2698)"),
            system_err("22:38:28.123", "11185", "Caused by: java.lang.NullPointerException: Attempt to invoke virtual method"),
        ];
        lines.push(system_err(
            "22:38:28.123",
            "11185",
            "\tat com.facebook.internal.FacebookDialogFragment.onCreate(FacebookDialogFragment.java:62)",
        ));
        lines.push(system_err("22:38:28.123", "11185", "\t... 9 more"));
        lines.push("2022-04-12 22:38:28.127 11185 11196 I art     : Starting a blocking GC HeapTrim".to_string());

        let aggregator = TraceAggregator::new();
        feed(&aggregator, &lines);
        assert_eq!(aggregator.pending(), 2);

        let first = aggregator.take_trace_block().expect("first block");
        assert_eq!(first.head.timestamp.as_deref(), Some("2022-04-12 22:37:27.394"));
        assert_eq!(first.head.pid.as_deref(), Some("11115"));
        assert_eq!(first.head.level.as_deref(), Some("W"));
        assert_eq!(first.head.tag.as_deref(), Some("System.err"));
        assert_eq!(
            first.body,
            "java.lang.Exception: Toast callstack! strTip=Test thread start\n\
             \tat android.widget.Toast.show(Toast.java:130)\n\
             \tat android.os.Looper.loop(Looper.java:154)"
        );

        let second = aggregator.take_trace_block().expect("second block");
        assert_eq!(second.head.timestamp.as_deref(), Some("2022-04-12 22:38:28.123"));
        assert_eq!(second.head.pid.as_deref(), Some("11185"));
        assert!(second.body.starts_with("java.lang.RuntimeException: Unable to start activity"));
        assert!(second.body.contains("\nCaused by: java.lang.NullPointerException"));
        assert!(second.body.ends_with("FacebookDialogFragment.java:62)"));
        assert!(!second.body.contains("9 more"));
        assert!(second.mentions("com.integreight.onesheeld"));

        assert!(aggregator.take_trace_block().is_none());
    }

    #[test]
    fn caused_by_without_preceding_frame_is_ignored() {
        let aggregator = TraceAggregator::new();
        feed(
            &aggregator,
            &[
                system_err("10:00:00.000", "1", "something happened"),
                system_err("10:00:00.001", "1", "Caused by: nothing"),
                system_err("10:00:00.002", "1", "done"),
            ],
        );
        assert!(aggregator.take_trace_block().is_none());
    }

    #[test]
    fn open_block_is_not_visible_until_closed() {
        let aggregator = TraceAggregator::new();
        feed(
            &aggregator,
            &[
                system_err("10:00:00.000", "1", "java.lang.IllegalStateException"),
                system_err("10:00:00.001", "1", "\tat a.B.c(B.java:1)"),
            ],
        );
        assert_eq!(aggregator.pending(), 0);
        feed(&aggregator, &[system_err("10:00:00.002", "1", "next")]);
        let drained = aggregator.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].body, "java.lang.IllegalStateException\n\tat a.B.c(B.java:1)");
        assert_eq!(aggregator.pending(), 0);
    }

    #[test]
    fn keeps_working_after_a_panic_poisoned_the_lock() {
        let aggregator = Arc::new(TraceAggregator::new());
        let poisoner = Arc::clone(&aggregator);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.state.lock().expect("lock");
            panic!("handler panicked while holding the lock");
        })
        .join();
        assert!(aggregator.state.is_poisoned());

        feed(
            &aggregator,
            &[
                system_err("22:37:27.394", "11115", "java.lang.Exception: boom"),
                system_err("22:37:27.395", "11115", "\tat com.x.Main.onCreate(Main.java:1)"),
                "2022-04-12 22:37:27.405 11115 11131 I Other: done".to_string(),
            ],
        );
        let block = aggregator.take_trace_block().expect("block");
        assert!(block.body.contains("com.x.Main.onCreate"));
    }
}
