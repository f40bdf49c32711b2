use regex::Regex;

/// Shape of the `mCurrentFocus` window as reported by `dumpsys window windows`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CurrentFocus {
    /// An "Application Error" dialog owns the focus.
    ApplicationError(String),
    /// A `pkg/Class` window, normalised to `pkg/.Class` where possible.
    Component(String),
    /// A window without a component name (e.g. a system dialog).
    Other(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowFocus {
    pub current: Option<CurrentFocus>,
    pub focused_app: Option<String>,
    pub last_closing_app: Option<String>,
}

impl WindowFocus {
    /// The focused component: `mCurrentFocus` when it names one, otherwise `mFocusedApp`.
    pub fn focused_component(&self) -> Option<&str> {
        match &self.current {
            Some(CurrentFocus::Component(name)) => Some(name.as_str()),
            _ => self.focused_app.as_deref(),
        }
    }
}

pub struct FocusParser {
    re_current_focus: Regex,
    re_focused_app: Regex,
    re_last_closing_app: Regex,
}

impl Default for FocusParser {
    fn default() -> Self {
        Self {
            re_current_focus: Regex::new(
                r"(?m)^\s*mCurrentFocus=[^{]+\{\S+\s+\S+\s+(?P<comp>[^}]+)\}\s*$",
            )
            .unwrap(),
            re_focused_app: Regex::new(
                r"(?m)^\s*mFocusedApp=.*?ActivityRecord\{\S+\s+\S+\s+(?P<comp>\S+)",
            )
            .unwrap(),
            re_last_closing_app: Regex::new(
                r"(?m)^\s*mLastClosingApp=.*?ActivityRecord\{\S+\s+\S+\s+(?P<comp>\S+)",
            )
            .unwrap(),
        }
    }
}

impl FocusParser {
    pub fn parse(&self, dump: &str) -> WindowFocus {
        let current = self
            .re_current_focus
            .captures(dump)
            .and_then(|caps| caps.name("comp"))
            .map(|comp| classify_current_focus(comp.as_str().trim()));
        let focused_app = self
            .re_focused_app
            .captures(dump)
            .and_then(|caps| caps.name("comp"))
            .map(|comp| normalize_focus_name(comp.as_str()));
        let last_closing_app = self
            .re_last_closing_app
            .captures(dump)
            .and_then(|caps| caps.name("comp"))
            .map(|comp| comp.as_str().to_string());
        WindowFocus {
            current,
            focused_app,
            last_closing_app,
        }
    }
}

fn classify_current_focus(name: &str) -> CurrentFocus {
    if name.starts_with("Application Error") {
        CurrentFocus::ApplicationError(name.to_string())
    } else if name.contains('/') {
        CurrentFocus::Component(normalize_focus_name(name))
    } else {
        CurrentFocus::Other(name.to_string())
    }
}

/// `com.x/com.x.ui.Main` -> `com.x/.ui.Main`; other shapes are returned unchanged.
pub fn normalize_focus_name(raw: &str) -> String {
    let Some((package, class)) = raw.split_once('/') else {
        return raw.to_string();
    };
    match class.strip_prefix(package) {
        Some(rest) if rest.starts_with('.') => format!("{package}/{rest}"),
        _ => raw.to_string(),
    }
}

/// Canonical `pkg/Class` name for a component under test.
///
/// `Main` becomes `pkg/Main`, `pkg.ui.Main` becomes `pkg/.ui.Main`, and names that
/// already contain `/` are kept.
pub fn normalize_component_name(package: &str, component: &str) -> String {
    if component.contains('/') {
        return component.to_string();
    }
    match component.strip_prefix(package) {
        Some(rest) if rest.starts_with('.') => format!("{package}/{rest}"),
        _ => format!("{package}/{component}"),
    }
}

/// `adb forward tcp:0 tcp:<remote>` prints the allocated local port.
pub fn parse_forward_port(output: &str) -> Option<u16> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.rsplit(':').next())
        .find_map(|token| token.trim().parse::<u16>().ok())
}

/// Looks for an exact `package:<name>` entry in `pm list packages` output.
pub fn parse_package_listed(output: &str, package: &str) -> bool {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .any(|name| name.trim() == package)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW_DUMP: &str = "\
WINDOW MANAGER WINDOWS (dumpsys window windows)
  Window #3 Window{a1b2c3 u0 com.example.app/com.example.app.ui.MainActivity}:
  mCurrentFocus=Window{a1b2c3 u0 com.example.app/com.example.app.ui.MainActivity}
  mFocusedApp=AppWindowToken{9f8e7d token=Token{5a7c2b ActivityRecord{e9d0a3a u0 com.example.app/.ui.MainActivity t12}}}
  mLastClosingApp=AppWindowToken{111 token=Token{222 ActivityRecord{333 u0 com.test.apptestclient/.activities.MainActivity t11}}}
";

    #[test]
    fn parses_current_focus_component() {
        let focus = FocusParser::default().parse(WINDOW_DUMP);
        assert_eq!(
            focus.current,
            Some(CurrentFocus::Component(
                "com.example.app/.ui.MainActivity".to_string()
            ))
        );
        assert_eq!(
            focus.focused_component(),
            Some("com.example.app/.ui.MainActivity")
        );
        assert_eq!(
            focus.last_closing_app.as_deref(),
            Some("com.test.apptestclient/.activities.MainActivity")
        );
    }

    #[test]
    fn detects_application_error_dialog() {
        let dump = "  mCurrentFocus=Window{77 u0 Application Error: com.example.app}\n";
        let focus = FocusParser::default().parse(dump);
        assert_eq!(
            focus.current,
            Some(CurrentFocus::ApplicationError(
                "Application Error: com.example.app".to_string()
            ))
        );
        assert_eq!(focus.focused_component(), None);
    }

    #[test]
    fn falls_back_to_focused_app() {
        let dump = "\
  mCurrentFocus=null
  mFocusedApp=ActivityRecord{e9d0a3a u0 com.android.launcher3/.uioverrides.QuickstepLauncher t1}
";
        let focus = FocusParser::default().parse(dump);
        assert_eq!(focus.current, None);
        assert_eq!(
            focus.focused_component(),
            Some("com.android.launcher3/.uioverrides.QuickstepLauncher")
        );
    }

    #[test]
    fn unnamed_window_is_other() {
        let dump = "  mCurrentFocus=Window{42 u0 DeprecatedTargetSdkVersionDialog}\n";
        let focus = FocusParser::default().parse(dump);
        assert_eq!(
            focus.current,
            Some(CurrentFocus::Other(
                "DeprecatedTargetSdkVersionDialog".to_string()
            ))
        );
    }

    #[test]
    fn normalizes_component_names() {
        assert_eq!(normalize_component_name("com.x", "Main"), "com.x/Main");
        assert_eq!(normalize_component_name("com.x", "com.x.ui.Main"), "com.x/.ui.Main");
        assert_eq!(normalize_component_name("com.x", "com.x/.Main"), "com.x/.Main");
        assert_eq!(normalize_component_name("com.x", "com.xy.Main"), "com.x/com.xy.Main");
        assert_eq!(normalize_focus_name("com.x/com.x.Main"), "com.x/.Main");
        assert_eq!(normalize_focus_name("com.x/org.other.Main"), "com.x/org.other.Main");
    }

    #[test]
    fn parses_forward_and_package_output() {
        assert_eq!(parse_forward_port("41235\n"), Some(41235));
        assert_eq!(parse_forward_port("tcp:41235"), Some(41235));
        assert_eq!(parse_forward_port(""), None);
        let packages = "package:com.example.app\npackage:com.example.app.test\n";
        assert!(parse_package_listed(packages, "com.example.app"));
        assert!(!parse_package_listed(packages, "com.example"));
    }
}
