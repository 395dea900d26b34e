use std::env;

pub const CAPTURE_ENV: &str = "ETRADE_AUTH_CAPTURE";
pub const NO_BROWSER_ENV: &str = "ETRADE_NO_BROWSER";

/// How the verification code reaches the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Local web page the user pastes the code into.
    Page,
    /// Code typed directly into the host process.
    Prompt,
}

/// Helper responsible for choosing the capture mode and whether to launch a browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowPreference {
    capture: CaptureMode,
    open_browser: bool,
}

impl FlowPreference {
    pub fn new(capture: CaptureMode, open_browser: bool) -> Self {
        Self {
            capture,
            open_browser,
        }
    }

    /// Detect preferences from environment variables and terminal capabilities.
    pub fn detect() -> Self {
        let capture = env::var(CAPTURE_ENV)
            .ok()
            .and_then(|value| match value.parse::<CaptureMode>() {
                Ok(mode) => Some(mode),
                Err(err) => {
                    tracing::warn!(error = %err, "ignoring {CAPTURE_ENV}");
                    None
                }
            })
            .unwrap_or(CaptureMode::Page);
        Self {
            capture,
            open_browser: browser_available(),
        }
    }

    pub fn capture_mode(&self) -> CaptureMode {
        self.capture
    }

    pub fn with_capture_mode(mut self, capture: CaptureMode) -> Self {
        self.capture = capture;
        self
    }

    /// Whether we should attempt to spawn the system browser automatically.
    pub fn open_browser(&self) -> bool {
        self.open_browser
    }
}

fn browser_available() -> bool {
    if env::var_os(NO_BROWSER_ENV).is_some() {
        return false;
    }

    if env::var_os("SSH_CONNECTION").is_some() && env::var_os("DISPLAY").is_none() {
        return false;
    }

    if env::var_os("DISPLAY").is_some() || env::var_os("WAYLAND_DISPLAY").is_some() {
        return true;
    }

    cfg!(target_os = "windows") || cfg!(target_os = "macos")
}

impl std::str::FromStr for CaptureMode {
    type Err = InvalidCaptureMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "page" | "web" | "browser" => Ok(CaptureMode::Page),
            "prompt" | "manual" | "terminal" => Ok(CaptureMode::Prompt),
            other => Err(InvalidCaptureMode(other.to_owned())),
        }
    }
}

impl std::fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            CaptureMode::Page => "page",
            CaptureMode::Prompt => "prompt",
        };
        write!(f, "{value}")
    }
}

/// Error reported when parsing an unsupported capture mode.
#[derive(Debug, thiserror::Error)]
#[error("invalid capture mode '{0}'")]
pub struct InvalidCaptureMode(pub String);
