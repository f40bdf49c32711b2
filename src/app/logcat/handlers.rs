use std::sync::Arc;

use regex::Regex;
use tracing::{info, warn};

use crate::app::error::AppError;
use crate::app::logcat::chain::{HandlerChain, HandlerSpec, LogHandler};
use crate::app::logcat::trace::TraceAggregator;
use crate::app::models::LogEvent;

/// Receiver of component lifecycle signals extracted from the log.
pub trait ComponentSignals: Send + Sync {
    fn on_activity_displayed(&self, component: &str);
    fn on_begin_of_crash(&self);
}

/// Called with the port an agent announced it is listening on.
pub type PortAnnouncer = Arc<dyn Fn(u16) + Send + Sync>;

pub const AGENT_PORT_ANNOUNCEMENT: &str = "Test RPCServer started at port";

pub struct ActivityDisplayedHandler {
    signals: Arc<dyn ComponentSignals>,
    re_displayed: Regex,
}

impl ActivityDisplayedHandler {
    pub fn new(signals: Arc<dyn ComponentSignals>) -> Self {
        Self {
            signals,
            re_displayed: Regex::new(r"Displayed (?P<comp>[^\s:]+)(?:[^:]*): (?P<delay>.*)").unwrap(),
        }
    }

    pub fn spec() -> Result<HandlerSpec, AppError> {
        HandlerSpec::new("ActivityDisplayed", 1)
            .with_regex(r"I\s+Activity(?:Task)?Manager\s*:\s+Displayed")
    }
}

impl LogHandler for ActivityDisplayedHandler {
    fn handle(&self, event: &LogEvent) {
        let Some(message) = event.message.as_deref() else {
            return;
        };
        match self.re_displayed.captures(message) {
            Some(caps) => {
                let component = caps.name("comp").map(|m| m.as_str()).unwrap_or_default();
                let delay = caps.name("delay").map(|m| m.as_str()).unwrap_or_default();
                info!(component = %component, delay = %delay, "activity displayed");
                self.signals.on_activity_displayed(component);
            }
            None => warn!(message = %message, "displayed line without component"),
        }
    }
}

pub struct BeginOfCrashHandler {
    signals: Arc<dyn ComponentSignals>,
}

impl BeginOfCrashHandler {
    pub fn new(signals: Arc<dyn ComponentSignals>) -> Self {
        Self { signals }
    }

    pub fn spec() -> Result<HandlerSpec, AppError> {
        HandlerSpec::new("BeginOfCrash", 20).with_regex(r"^[-\s]+beginning of crash")
    }
}

impl LogHandler for BeginOfCrashHandler {
    fn handle(&self, _event: &LogEvent) {
        warn!("beginning of crash detected");
        self.signals.on_begin_of_crash();
    }
}

pub struct AgentPortHandler {
    announcer: PortAnnouncer,
    re_port: Regex,
}

impl AgentPortHandler {
    pub fn new(announcer: PortAnnouncer) -> Self {
        Self {
            announcer,
            re_port: Regex::new(r"Test RPCServer started at port (?P<port>\d+)").unwrap(),
        }
    }

    pub fn spec() -> HandlerSpec {
        HandlerSpec::new("AgentPortAnnouncer", 10).with_keywords([AGENT_PORT_ANNOUNCEMENT])
    }
}

impl LogHandler for AgentPortHandler {
    fn handle(&self, event: &LogEvent) {
        let port = self
            .re_port
            .captures(&event.raw_line)
            .and_then(|caps| caps.name("port"))
            .and_then(|m| m.as_str().parse::<u16>().ok());
        match port {
            Some(port) => {
                info!(port, "agent announced rpc port");
                (self.announcer)(port);
            }
            None => warn!(line = %event.raw_line, "agent port announcement without a valid port"),
        }
    }
}

/// The controller's handler chain: crash detector, trace aggregator, port announcer
/// and display detector.
pub fn default_chain(
    signals: Arc<dyn ComponentSignals>,
    announcer: PortAnnouncer,
    traces: Arc<TraceAggregator>,
) -> Result<HandlerChain, AppError> {
    Ok(HandlerChain::builder()
        .register(
            ActivityDisplayedHandler::spec()?,
            Arc::new(ActivityDisplayedHandler::new(Arc::clone(&signals))),
        )
        .register(BeginOfCrashHandler::spec()?, Arc::new(BeginOfCrashHandler::new(signals)))
        .register(AgentPortHandler::spec(), Arc::new(AgentPortHandler::new(announcer)))
        .register(HandlerSpec::new("TraceAggregator", 10), traces)
        .build())
}
