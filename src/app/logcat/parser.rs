use regex::Regex;
use tracing::warn;

use crate::app::error::AppError;
use crate::app::models::LogEvent;

/// Parses `logcat -v year` (and the compatible `threadtime`) lines.
pub struct LogParser {
    re_header: Regex,
}

impl Default for LogParser {
    fn default() -> Self {
        Self {
            re_header: Regex::new(
                r"^(?P<time>[\d-]+\s[\d:.]+)\s+(?P<pid>\d+)\s+(?P<tid>\d+)\s+(?P<level>[A-Z])\s+(?P<tag>\S*?)\s*:\s",
            )
            .unwrap(),
        }
    }
}

impl LogParser {
    pub fn for_format(verbosity: &str, trace_id: &str) -> Result<Self, AppError> {
        match verbosity.trim() {
            "year" | "threadtime" => Ok(Self::default()),
            other => Err(AppError::validation(
                format!("Unsupported logcat format: {other}"),
                trace_id,
            )),
        }
    }

    /// Never fails: an unrecognised line yields an event with only `raw_line` set.
    pub fn parse(&self, line: &str) -> LogEvent {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(caps) = self.re_header.captures(line) else {
            if !line.trim().is_empty() && !line.starts_with("---------") {
                warn!(line = %line, "unrecognised logcat line");
            }
            return LogEvent::raw(line);
        };
        let header_end = caps.get(0).map(|m| m.end()).unwrap_or(0);
        let field = |name: &str| caps.name(name).map(|m| m.as_str().to_string());
        LogEvent {
            timestamp: field("time"),
            pid: field("pid"),
            tid: field("tid"),
            level: field("level"),
            tag: field("tag"),
            message: Some(line[header_end..].to_string()),
            raw_line: line.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_year_format() {
        let line = "2022-05-07 13:45:39.597  1310  1812 E ActivityManager: java.lang.Throwable";
        let event = LogParser::default().parse(line);
        assert_eq!(event.timestamp.as_deref(), Some("2022-05-07 13:45:39.597"));
        assert_eq!(event.pid.as_deref(), Some("1310"));
        assert_eq!(event.tid.as_deref(), Some("1812"));
        assert_eq!(event.level.as_deref(), Some("E"));
        assert_eq!(event.tag.as_deref(), Some("ActivityManager"));
        assert_eq!(event.message.as_deref(), Some("java.lang.Throwable"));
        assert_eq!(event.raw_line, line);
    }

    #[test]
    fn keeps_padding_tags_and_leading_tabs() {
        let parser = LogParser::default();
        let event = parser.parse("2022-04-12 22:38:28.127 11185 11196 I art     : Starting a blocking GC");
        assert_eq!(event.tag.as_deref(), Some("art"));
        assert_eq!(event.message.as_deref(), Some("Starting a blocking GC"));

        let event = parser.parse("2022-04-12 22:37:27.395 11115 11115 W System.err: \tat a.b.C.d(C.java:1)");
        assert_eq!(event.tag.as_deref(), Some("System.err"));
        assert_eq!(event.message.as_deref(), Some("\tat a.b.C.d(C.java:1)"));
    }

    #[test]
    fn message_may_contain_colons() {
        let event = LogParser::default()
            .parse("2022-05-07 13:45:40.001  1310  1340 I ActivityManager: Displayed com.x/.Main: +350ms");
        assert_eq!(event.message.as_deref(), Some("Displayed com.x/.Main: +350ms"));
    }

    #[test]
    fn unparsed_line_keeps_raw_text() {
        let event = LogParser::default().parse("--------- beginning of crash");
        assert_eq!(event.raw_line, "--------- beginning of crash");
        assert!(event.message.is_none());
        assert!(event.tag.is_none());
    }

    #[test]
    fn rejects_unknown_format() {
        assert!(LogParser::for_format("year", "t").is_ok());
        let err = LogParser::for_format("brief", "t").err().expect("error");
        assert_eq!(err.code, "ERR_VALIDATION");
    }
}
