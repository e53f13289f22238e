//! Token-scanning user-agent classifier.
//!
//! Covers the browsers, operating systems and crawlers that make up the bulk
//! of real traffic. Anything it does not recognise comes back with empty
//! names and [`DeviceClass::Unknown`].

use super::{DeviceClass, NameAndVersion, UserAgentClassifier, UserAgentInfo};

/// Substrings that mark automated clients (matched case-insensitively)
const BOT_MARKERS: [&str; 8] = [
    "bot",
    "crawler",
    "spider",
    "slurp",
    "curl/",
    "wget/",
    "python-requests",
    "headless",
];

/// Browser tokens in priority order. Chromium derivatives also carry
/// `Chrome/` and `Safari/`, so they must be tested first.
const BROWSERS: [(&str, &str); 9] = [
    ("Edg/", "Edge"),
    ("EdgiOS/", "Edge"),
    ("OPR/", "Opera"),
    ("SamsungBrowser/", "Samsung Browser"),
    ("Firefox/", "Firefox"),
    ("FxiOS/", "Firefox"),
    ("CriOS/", "Chrome"),
    ("Chrome/", "Chrome"),
    ("Version/", "Safari"),
];

#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicClassifier;

impl UserAgentClassifier for HeuristicClassifier {
    fn classify(&self, user_agent: &str) -> UserAgentInfo {
        let lower = user_agent.to_ascii_lowercase();
        let is_bot = BOT_MARKERS.iter().any(|m| lower.contains(m));

        UserAgentInfo {
            browser: browser(user_agent),
            os: os(user_agent),
            device: device(user_agent, is_bot),
        }
    }
}

fn browser(ua: &str) -> NameAndVersion {
    for (token, name) in BROWSERS {
        if let Some(version) = version_after(ua, token) {
            // Version/ is only Safari when the Safari token is present too
            if name == "Safari" && !ua.contains("Safari/") {
                continue;
            }
            return NameAndVersion::new(name, version);
        }
    }
    NameAndVersion::default()
}

fn os(ua: &str) -> NameAndVersion {
    if let Some(version) = version_after(ua, "Windows NT ") {
        return NameAndVersion::new("Windows", version);
    }
    if let Some(version) = version_after(ua, "Android ") {
        return NameAndVersion::new("Android", version);
    }
    if ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iPod") {
        let version = version_after(ua, "iPhone OS ")
            .or_else(|| version_after(ua, "CPU OS "))
            .unwrap_or_default();
        return NameAndVersion::new("iOS", version);
    }
    if let Some(version) = version_after(ua, "Mac OS X ") {
        return NameAndVersion::new("macOS", version);
    }
    if ua.contains("CrOS") {
        return NameAndVersion::new("ChromeOS", "");
    }
    if ua.contains("Linux") {
        return NameAndVersion::new("Linux", "");
    }
    NameAndVersion::default()
}

fn device(ua: &str, is_bot: bool) -> DeviceClass {
    if is_bot {
        DeviceClass::Bot
    } else if ua.contains("iPad")
        || ua.contains("Tablet")
        || (ua.contains("Android") && !ua.contains("Mobile"))
    {
        DeviceClass::Tablet
    } else if ua.contains("Mobi") || ua.contains("iPhone") || ua.contains("iPod") {
        DeviceClass::Mobile
    } else if ["Windows", "Macintosh", "X11", "CrOS", "Linux"]
        .iter()
        .any(|t| ua.contains(t))
    {
        DeviceClass::Desktop
    } else {
        DeviceClass::Unknown
    }
}

/// Returns the dotted version following `token`, normalising `_` to `.`
/// (iOS and macOS write `17_2_1`).
fn version_after(ua: &str, token: &str) -> Option<String> {
    let start = ua.find(token)? + token.len();
    let version: String = ua[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '_')
        .map(|c| if c == '_' { '.' } else { c })
        .collect();
    Some(version.trim_end_matches('.').to_string())
}
