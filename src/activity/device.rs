// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use serde::{Deserialize, Serialize};

const UNKNOWN: &str = "Unknown";

/// Browser and operating system derived from a user agent string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub browser: String,
    pub os: String,
    pub version: String,
}

/// `(marker, browser name, name on mobile builds, token holding the version)`.
/// Order matters: Edge and Opera also announce Chrome, the iOS wrappers and
/// Chrome also announce Safari.
const BROWSERS: &[(&str, &str, &str, &str)] = &[
    ("EdgiOS/", "Edge", "Edge", "EdgiOS/"),
    ("EdgA/", "Edge", "Edge", "EdgA/"),
    ("Edg/", "Edge", "Edge", "Edg/"),
    ("OPR/", "Opera", "Opera", "OPR/"),
    ("SamsungBrowser/", "Samsung Browser", "Samsung Browser", "SamsungBrowser/"),
    ("CriOS/", "Chrome", "Chrome", "CriOS/"),
    ("FxiOS/", "Firefox", "Firefox", "FxiOS/"),
    ("Firefox/", "Firefox", "Mobile Firefox", "Firefox/"),
    ("Chromium/", "Chromium", "Chromium", "Chromium/"),
    ("Chrome/", "Chrome", "Chrome", "Chrome/"),
    ("Safari/", "Safari", "Mobile Safari", "Version/"),
    ("MSIE ", "IE", "IEMobile", "MSIE "),
    ("Trident/", "IE", "IEMobile", "rv:"),
    ("PostmanRuntime/", "Postman", "Postman", "PostmanRuntime/"),
    ("curl/", "curl", "curl", "curl/"),
];

/// Tokens mobile builds of Firefox, Safari and IE add to their agent.
const MOBILE_MARKERS: &[&str] = &["Mobile;", "Tablet;", "Mobile/", "IEMobile"];

/// `(marker, os name)`, Android before Linux, iOS devices before macOS.
const SYSTEMS: &[(&str, &str)] = &[
    ("Windows", "Windows"),
    ("Android", "Android"),
    ("iPhone", "iOS"),
    ("iPad", "iOS"),
    ("iPod", "iOS"),
    ("Mac OS X", "Mac OS"),
    ("CrOS", "Chrome OS"),
    ("Ubuntu", "Ubuntu"),
    ("Linux", "Linux"),
];

impl DeviceInfo {
    pub fn unknown() -> DeviceInfo {
        DeviceInfo {
            browser: UNKNOWN.to_owned(),
            os: UNKNOWN.to_owned(),
            version: UNKNOWN.to_owned(),
        }
    }

    /// Normalises `user_agent`; anything not recognised is reported as `Unknown`.
    pub fn from_user_agent(user_agent: Option<&str>) -> DeviceInfo {
        let ua = match user_agent.map(str::trim) {
            Some(ua) if !ua.is_empty() => ua,
            _ => return DeviceInfo::unknown(),
        };

        let mut info = DeviceInfo::unknown();

        if let Some((_, name, mobile_name, version_token)) =
            BROWSERS.iter().find(|(marker, _, _, _)| ua.contains(marker))
        {
            let mobile = MOBILE_MARKERS.iter().any(|marker| ua.contains(marker));
            let name = if mobile { mobile_name } else { name };
            info.browser = (*name).to_owned();
            if let Some(version) = token_value(ua, version_token) {
                info.version = version.to_owned();
            }
        }

        if let Some((_, name)) = SYSTEMS.iter().find(|(marker, _)| ua.contains(marker)) {
            info.os = (*name).to_owned();
        }

        info
    }
}

/// Text following `token` up to the next separator, if any.
fn token_value<'a>(ua: &'a str, token: &str) -> Option<&'a str> {
    let start = ua.find(token)? + token.len();
    let rest = &ua[start..];
    let end = rest
        .find(|c: char| c == ' ' || c == ';' || c == ')')
        .unwrap_or(rest.len());

    Some(&rest[..end]).filter(|v| !v.is_empty())
}
