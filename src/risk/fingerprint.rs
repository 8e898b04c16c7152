//! Device fingerprinting from request headers.
//!
//! Only attributes that stay put across a device's normal life go into the
//! hash. The client address changes on every network hop and the browser
//! version on every update, so neither is hashed.

use std::fmt::Write as _;
use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Raw request attributes the analyzer works from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestSignals {
    pub user_agent: String,
    pub accept_language: Option<String>,
    /// `Sec-CH-UA-Platform` client hint, when the browser sends one.
    pub platform_hint: Option<String>,
    pub ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Desktop,
    Mobile,
    Tablet,
    Bot,
}

impl DeviceClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
            Self::Tablet => "tablet",
            Self::Bot => "bot",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceComponents {
    pub ua_family: String,
    /// Reported for display; not part of the hash.
    pub ua_major: Option<String>,
    pub platform: String,
    pub device_class: DeviceClass,
    pub language: Option<String>,
    pub platform_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    pub stable_hash: String,
    pub components: DeviceComponents,
}

static BOT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)(bot|crawler|spider|curl|wget|python-requests|httpclient|okhttp)").ok()
});

/// Ordered: the first family whose pattern matches wins, so Chromium
/// derivatives are listed before Chrome and Chrome before Safari.
static FAMILIES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("Edge", r"Edg(?:e|A|iOS)?/(\d+)"),
        ("Opera", r"OPR/(\d+)"),
        ("Samsung Internet", r"SamsungBrowser/(\d+)"),
        ("Firefox", r"(?:Firefox|FxiOS)/(\d+)"),
        ("Chrome", r"(?:Chrome|CriOS)/(\d+)"),
        ("Safari", r"Version/(\d+)[\d.]* (?:Mobile/\S+ )?Safari/"),
    ]
    .into_iter()
    .filter_map(|(family, pattern)| Regex::new(pattern).ok().map(|re| (family, re)))
    .collect()
});

fn ua_family(user_agent: &str) -> (String, Option<String>) {
    if let Some(found) = BOT.as_ref().and_then(|re| re.find(user_agent)) {
        return (found.as_str().to_lowercase(), None);
    }
    for (family, re) in FAMILIES.iter() {
        if let Some(captures) = re.captures(user_agent) {
            let major = captures.get(1).map(|m| m.as_str().to_string());
            return ((*family).to_string(), major);
        }
    }
    ("Other".to_string(), None)
}

fn platform(user_agent: &str) -> &'static str {
    if user_agent.contains("Windows") {
        "Windows"
    } else if ["iPhone", "iPad", "iPod"].iter().any(|d| user_agent.contains(d)) {
        "iOS"
    } else if user_agent.contains("Android") {
        "Android"
    } else if user_agent.contains("CrOS") {
        "ChromeOS"
    } else if user_agent.contains("Mac OS X") || user_agent.contains("Macintosh") {
        "macOS"
    } else if user_agent.contains("Linux") {
        "Linux"
    } else {
        "Other"
    }
}

fn device_class(user_agent: &str, is_bot: bool) -> DeviceClass {
    if is_bot {
        DeviceClass::Bot
    } else if user_agent.contains("iPad")
        || user_agent.contains("Tablet")
        || (user_agent.contains("Android") && !user_agent.contains("Mobile"))
    {
        DeviceClass::Tablet
    } else if user_agent.contains("Mobile") || user_agent.contains("iPhone") {
        DeviceClass::Mobile
    } else {
        DeviceClass::Desktop
    }
}

/// First language tag of an `Accept-Language` header, lowercased.
fn primary_language(header: &str) -> Option<String> {
    header
        .split(',')
        .next()
        .and_then(|tag| tag.split(';').next())
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty() && tag != "*")
}

/// Derive the fingerprint for one request. Deterministic: the same signals
/// (ignoring the address and browser version) always produce the same hash.
#[must_use]
pub fn fingerprint(signals: &RequestSignals) -> DeviceFingerprint {
    let user_agent = signals.user_agent.trim();
    let is_bot = BOT.as_ref().is_some_and(|re| re.is_match(user_agent));
    let (ua_family, ua_major) = ua_family(user_agent);

    let components = DeviceComponents {
        ua_family,
        ua_major,
        platform: platform(user_agent).to_string(),
        device_class: device_class(user_agent, is_bot),
        language: signals.accept_language.as_deref().and_then(primary_language),
        platform_hint: signals
            .platform_hint
            .as_deref()
            .map(|hint| hint.trim().trim_matches('"').to_lowercase())
            .filter(|hint| !hint.is_empty()),
    };

    let normalized = format!(
        "{}|{}|{}|{}|{}",
        components.ua_family,
        components.platform,
        components.device_class.as_str(),
        components.language.as_deref().unwrap_or(""),
        components.platform_hint.as_deref().unwrap_or(""),
    );
    let digest = Sha256::digest(normalized.as_bytes());
    let stable_hash = digest.iter().fold(String::with_capacity(64), |mut hex, byte| {
        let _ = write!(hex, "{byte:02x}");
        hex
    });

    DeviceFingerprint {
        stable_hash,
        components,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME_MAC: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.6367.91 Safari/537.36";
    const SAFARI_IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1";
    const EDGE_WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.2478.80";

    fn signals(user_agent: &str, ip: &str) -> RequestSignals {
        RequestSignals {
            user_agent: user_agent.to_string(),
            accept_language: Some("en-US,en;q=0.9".to_string()),
            platform_hint: None,
            ip: ip.parse().ok(),
        }
    }

    #[test]
    fn parses_common_browsers() {
        let chrome = fingerprint(&signals(CHROME_MAC, "192.0.2.1")).components;
        assert_eq!(chrome.ua_family, "Chrome");
        assert_eq!(chrome.ua_major.as_deref(), Some("124"));
        assert_eq!(chrome.platform, "macOS");
        assert_eq!(chrome.device_class, DeviceClass::Desktop);
        assert_eq!(chrome.language.as_deref(), Some("en-us"));

        let safari = fingerprint(&signals(SAFARI_IPHONE, "192.0.2.1")).components;
        assert_eq!(safari.ua_family, "Safari");
        assert_eq!(safari.ua_major.as_deref(), Some("17"));
        assert_eq!(safari.platform, "iOS");
        assert_eq!(safari.device_class, DeviceClass::Mobile);

        let edge = fingerprint(&signals(EDGE_WINDOWS, "192.0.2.1")).components;
        assert_eq!(edge.ua_family, "Edge");
        assert_eq!(edge.platform, "Windows");
    }

    #[test]
    fn address_does_not_change_the_hash() {
        let home = fingerprint(&signals(CHROME_MAC, "192.0.2.1"));
        let office = fingerprint(&signals(CHROME_MAC, "198.51.100.7"));
        assert_eq!(home.stable_hash, office.stable_hash);
        assert_eq!(home.stable_hash.len(), 64);

        let phone = fingerprint(&signals(SAFARI_IPHONE, "192.0.2.1"));
        assert_ne!(home.stable_hash, phone.stable_hash);
    }

    #[test]
    fn browser_updates_keep_the_hash() {
        let before = fingerprint(&signals(CHROME_MAC, "192.0.2.1"));
        for update in ["124.0.6367.207", "125.0.6422.60"] {
            let after = fingerprint(&signals(&CHROME_MAC.replace("124.0.6367.91", update), "192.0.2.1"));
            assert_eq!(before.stable_hash, after.stable_hash);
        }

        let updated = fingerprint(&signals(
            &CHROME_MAC.replace("124.0.6367.91", "125.0.6422.60"),
            "192.0.2.1",
        ));
        assert_eq!(updated.components.ua_major.as_deref(), Some("125"));

        // A different operating system is still a different device.
        let windows = fingerprint(&signals(
            &CHROME_MAC.replace("Macintosh; Intel Mac OS X 10_15_7", "Windows NT 10.0; Win64; x64"),
            "192.0.2.1",
        ));
        assert_ne!(before.stable_hash, windows.stable_hash);
    }

    #[test]
    fn flags_bots() {
        let curl = fingerprint(&signals("curl/8.4.0", "192.0.2.1")).components;
        assert_eq!(curl.device_class, DeviceClass::Bot);
        assert_eq!(curl.ua_family, "curl");
    }
}
