//! Default rule-list parser.
//!
//! Turns raw list bytes into a canonical rules buffer plus the metadata,
//! counts and tracker attributions the engine tracks per source. Only
//! domain-level network rules are supported; everything else is counted.
//!
//! # Accepted syntax
//!
//! ```text
//! [Adblock Plus 2.0]
//! ! Title: Example list
//! ! Expires: 4 days
//! !#tracker tracker.example {"company": "Example Inc"}
//! ||ads.example.com^
//! ||cdn.example.net^$third-party
//! @@||good.example.com^$document
//! 0.0.0.0 telemetry.example.org
//! plain.example.com
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use ahash::AHashSet;
use bitflags::bitflags;
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::index::sha256_hex;
use crate::source::{AdBlockMetadata, FetchResult, RulesInfo};

/// Tracker attribution payloads keyed by domain.
pub type TrackerInfoMap = BTreeMap<String, serde_json::Value>;

/// Everything extracted from one successfully parsed list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedRuleList {
    /// SHA-256 (hex) of `rules_buffer`
    pub checksum: String,
    pub metadata: AdBlockMetadata,
    pub rules_info: RulesInfo,
    pub tracker_infos: TrackerInfoMap,
    /// Canonical valid rules, one per line
    pub rules_buffer: String,
}

/// Parses raw list content.
pub trait RuleListParser: Send + Sync {
    fn parse(&self, raw: &[u8], allow_abp_snippets: bool) -> Result<ParsedRuleList, FetchResult>;
}

bitflags! {
    /// Options attached to a network rule.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RuleOptions: u8 {
        /// `@@` exception rule
        const ALLOW = 0b0000_0001;
        /// `$document`
        const DOCUMENT = 0b0000_0010;
        /// `$third-party`
        const THIRD_PARTY = 0b0000_0100;
    }
}

/// A domain-level network rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkRule {
    pub domain: String,
    pub options: RuleOptions,
}

impl NetworkRule {
    /// Parse one canonical or source-form network rule line.
    pub fn parse(line: &str) -> Option<Self> {
        match classify_line(line.trim()) {
            Line::Network(rule) => Some(rule),
            _ => None,
        }
    }
}

impl fmt::Display for NetworkRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.options.contains(RuleOptions::ALLOW) {
            f.write_str("@@")?;
        }
        write!(f, "||{}^", self.domain)?;
        let mut opts = Vec::new();
        if self.options.contains(RuleOptions::DOCUMENT) {
            opts.push("document");
        }
        if self.options.contains(RuleOptions::THIRD_PARTY) {
            opts.push("third-party");
        }
        if !opts.is_empty() {
            write!(f, "${}", opts.join(","))?;
        }
        Ok(())
    }
}

static DOMAIN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9_](?:[a-z0-9_-]*[a-z0-9_])?(?:\.[a-z0-9_](?:[a-z0-9_-]*[a-z0-9_])?)*$")
        .expect("domain pattern is valid")
});

static HOSTS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:0\.0\.0\.0|127\.0\.0\.1|::1?)\s+(\S+)(?:\s+#.*)?$")
        .expect("hosts pattern is valid")
});

static METADATA_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^!\s*(title|homepage|license|redirect|version|expires)\s*:\s*(.*?)\s*$")
        .expect("metadata pattern is valid")
});

static EXPIRES_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(\d+)\s*(day|days|d|hour|hours|h)?\b").expect("expires pattern is valid")
});

/// Hostnames that show up in hosts files but are not rules.
const HOSTS_IGNORED: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "local",
    "broadcasthost",
    "0.0.0.0",
    "ip6-localhost",
    "ip6-loopback",
];

enum Line<'a> {
    Skip,
    Metadata(&'a str, &'a str),
    Tracker(&'a str, &'a str),
    Network(NetworkRule),
    Snippet,
    Unsupported,
    Invalid,
}

fn is_domain(s: &str) -> bool {
    s.len() <= 253 && DOMAIN_PATTERN.is_match(s)
}

fn classify_line(line: &str) -> Line<'_> {
    if line.is_empty() || (line.starts_with('[') && line.ends_with(']')) {
        return Line::Skip;
    }

    if let Some(rest) = line.strip_prefix("!#tracker") {
        let rest = rest.trim();
        return match rest.split_once(char::is_whitespace) {
            Some((domain, payload)) => Line::Tracker(domain, payload.trim()),
            None => Line::Invalid,
        };
    }

    if line.starts_with('!') {
        if let Some(caps) = METADATA_LINE.captures(line) {
            let key = caps.get(1).map_or("", |m| m.as_str());
            let value = caps.get(2).map_or("", |m| m.as_str());
            return Line::Metadata(key, value);
        }
        return Line::Skip;
    }

    if line.contains("#$#") || line.contains("##+js(") {
        return Line::Snippet;
    }
    if line.contains("##") || line.contains("#@#") || line.contains("#?#") {
        return Line::Unsupported;
    }

    // Hosts-file comments
    if line.starts_with('#') {
        return Line::Skip;
    }

    if let Some(caps) = HOSTS_LINE.captures(line) {
        let host = caps.get(1).map_or("", |m| m.as_str()).to_lowercase();
        if HOSTS_IGNORED.contains(&host.as_str()) {
            return Line::Skip;
        }
        return network_rule(&host, RuleOptions::empty());
    }

    let (body, mut options) = match line.strip_prefix("@@") {
        Some(rest) => (rest, RuleOptions::ALLOW),
        None => (line, RuleOptions::empty()),
    };

    let (pattern, option_text) = match body.rfind('$') {
        Some(pos) => (&body[..pos], Some(&body[pos + 1..])),
        None => (body, None),
    };

    if let Some(option_text) = option_text {
        for option in option_text.split(',') {
            match option.trim().to_lowercase().as_str() {
                "" => return Line::Invalid,
                "document" | "doc" => options |= RuleOptions::DOCUMENT,
                "third-party" | "3p" => options |= RuleOptions::THIRD_PARTY,
                _ => return Line::Unsupported,
            }
        }
    }

    if let Some(rest) = pattern.strip_prefix("||") {
        let domain = rest
            .strip_suffix("^|")
            .or_else(|| rest.strip_suffix('^'))
            .unwrap_or(rest);
        if domain.contains(['/', '*', '^', '|']) {
            return Line::Unsupported;
        }
        return network_rule(&domain.to_lowercase(), options);
    }

    if pattern.starts_with('/') || pattern.starts_with('|') || pattern.contains(['*', '^', '/']) {
        return Line::Unsupported;
    }

    let lowered = pattern.to_lowercase();
    if lowered.contains('.') && is_domain(&lowered) {
        return network_rule(&lowered, options);
    }

    if lowered.contains(char::is_whitespace) || lowered.is_empty() {
        return Line::Invalid;
    }
    Line::Unsupported
}

fn network_rule(domain: &str, options: RuleOptions) -> Line<'static> {
    let domain = domain.strip_suffix('.').unwrap_or(domain);
    if !is_domain(domain) {
        return Line::Invalid;
    }
    Line::Network(NetworkRule {
        domain: domain.to_string(),
        options,
    })
}

fn parse_expires(value: &str) -> Option<Duration> {
    let caps = EXPIRES_VALUE.captures(value.trim())?;
    let amount: u64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2).map_or("days", |m| m.as_str()).to_lowercase();
    let secs = if unit.starts_with('h') {
        amount.checked_mul(3600)?
    } else {
        amount.checked_mul(86_400)?
    };
    Some(Duration::from_secs(secs))
}

fn apply_metadata(metadata: &mut AdBlockMetadata, key: &str, value: &str) {
    match key.to_lowercase().as_str() {
        "title" => metadata.title = value.to_string(),
        "homepage" => metadata.homepage = Url::parse(value).ok(),
        "license" => metadata.license = Url::parse(value).ok(),
        "redirect" => metadata.redirect = Url::parse(value).ok(),
        "version" => {
            if let Ok(version) = value.parse::<i64>() {
                metadata.version = version;
            }
        }
        "expires" => metadata.expires = parse_expires(value),
        _ => {}
    }
}

fn looks_like_html(text: &str) -> bool {
    let first = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .to_lowercase();
    first.starts_with("<!doctype") || first.starts_with("<html")
}

/// Parser for Adblock-Plus style and hosts-file style domain lists.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdBlockListParser;

impl AdBlockListParser {
    pub fn new() -> Self {
        Self
    }
}

impl RuleListParser for AdBlockListParser {
    fn parse(&self, raw: &[u8], allow_abp_snippets: bool) -> Result<ParsedRuleList, FetchResult> {
        let text = std::str::from_utf8(raw).map_err(|_| FetchResult::FileUnsupported)?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        if looks_like_html(text) {
            return Err(FetchResult::FileUnsupported);
        }

        let mut parsed = ParsedRuleList::default();
        let mut seen: AHashSet<NetworkRule> = AHashSet::new();
        let mut snippets = 0u64;

        for line in text.lines() {
            match classify_line(line.trim()) {
                Line::Skip => {}
                Line::Metadata(key, value) => apply_metadata(&mut parsed.metadata, key, value),
                Line::Tracker(domain, payload) => {
                    let domain = domain.to_lowercase();
                    match serde_json::from_str::<serde_json::Value>(payload) {
                        Ok(value) if value.is_object() && is_domain(&domain) => {
                            parsed.tracker_infos.insert(domain, value);
                        }
                        _ => parsed.rules_info.invalid_rules += 1,
                    }
                }
                Line::Network(rule) => {
                    if seen.insert(rule.clone()) {
                        parsed.rules_buffer.push_str(&rule.to_string());
                        parsed.rules_buffer.push('\n');
                        parsed.rules_info.valid_rules += 1;
                    }
                }
                Line::Snippet => {
                    snippets += 1;
                    parsed.rules_info.unsupported_rules += 1;
                }
                Line::Unsupported => parsed.rules_info.unsupported_rules += 1,
                Line::Invalid => parsed.rules_info.invalid_rules += 1,
            }
        }

        if snippets > 0 && !allow_abp_snippets {
            log::debug!("Ignored {} snippet rules from a list without snippet permission", snippets);
        }

        parsed.checksum = sha256_hex(parsed.rules_buffer.as_bytes());
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> ParsedRuleList {
        AdBlockListParser::new().parse(text.as_bytes(), false).unwrap()
    }

    #[test]
    fn test_parse_rules_and_metadata() {
        let text = r#"[Adblock Plus 2.0]
! Title: Example list
! Homepage: https://lists.example.com/
! Expires: 4 days (update frequency)
! Version: 202401010000
||ads.example.com^
@@||good.example.com^$document
||cdn.example.net^$third-party
0.0.0.0 telemetry.example.org
plain.example.com
example.com##.banner
/banner[0-9]+/
||bad domain^
"#;
        let parsed = parse(text);

        assert_eq!(parsed.metadata.title, "Example list");
        assert_eq!(
            parsed.metadata.homepage.as_ref().map(|u| u.as_str()),
            Some("https://lists.example.com/")
        );
        assert_eq!(parsed.metadata.expires, Some(Duration::from_secs(4 * 86_400)));
        assert_eq!(parsed.metadata.version, 202401010000);

        assert_eq!(parsed.rules_info.valid_rules, 5);
        assert_eq!(parsed.rules_info.unsupported_rules, 2);
        assert_eq!(parsed.rules_info.invalid_rules, 1);

        let lines: Vec<&str> = parsed.rules_buffer.lines().collect();
        assert_eq!(
            lines,
            vec![
                "||ads.example.com^",
                "@@||good.example.com^$document",
                "||cdn.example.net^$third-party",
                "||telemetry.example.org^",
                "||plain.example.com^",
            ]
        );
    }

    #[test]
    fn test_checksum_ignores_comments_and_metadata() {
        let a = parse("! Title: A\n||ads.example.com^\n");
        let b = parse("! Title: B\n! some comment\n||ads.example.com^\n");
        assert_eq!(a.checksum, b.checksum);

        let c = parse("||ads.example.com^\n||more.example.com^\n");
        assert_ne!(a.checksum, c.checksum);
    }

    #[test]
    fn test_duplicates_count_once() {
        let parsed = parse("||ads.example.com^\n||ADS.example.com^\nads.example.com\n");
        assert_eq!(parsed.rules_info.valid_rules, 1);
    }

    #[test]
    fn test_tracker_infos() {
        let parsed = parse(
            "!#tracker tracker.example {\"company\": \"Example Inc\"}\n!#tracker broken.example not-json\n",
        );
        assert_eq!(parsed.tracker_infos.len(), 1);
        assert_eq!(
            parsed.tracker_infos["tracker.example"]["company"],
            serde_json::json!("Example Inc")
        );
        assert_eq!(parsed.rules_info.invalid_rules, 1);
    }

    #[test]
    fn test_snippets_are_unsupported() {
        let parsed = parse("example.com#$#abort-on-property-read foo\nexample.com##+js(nowebrtc)\n");
        assert_eq!(parsed.rules_info.unsupported_rules, 2);
        assert_eq!(parsed.rules_info.valid_rules, 0);
    }

    #[test]
    fn test_hosts_file_ignores_local_names() {
        let parsed = parse("127.0.0.1 localhost\n# comment\n0.0.0.0 tracker.example.com # inline\n");
        assert_eq!(parsed.rules_info.valid_rules, 1);
        assert_eq!(parsed.rules_buffer, "||tracker.example.com^\n");
    }

    #[test]
    fn test_unknown_option_is_unsupported() {
        let parsed = parse("||ads.example.com^$script\n||ads.example.com^$\n");
        assert_eq!(parsed.rules_info.unsupported_rules, 1);
        assert_eq!(parsed.rules_info.invalid_rules, 1);
    }

    #[test]
    fn test_binary_and_html_are_unsupported() {
        let parser = AdBlockListParser::new();
        assert_eq!(
            parser.parse(&[0xff, 0xfe, 0x00, 0x01], false),
            Err(FetchResult::FileUnsupported)
        );
        assert_eq!(
            parser.parse(b"\n<!DOCTYPE html><html></html>", false),
            Err(FetchResult::FileUnsupported)
        );
    }

    #[test]
    fn test_network_rule_roundtrip_canonical() {
        let rule = NetworkRule::parse("@@||Example.com^$third-party,document").unwrap();
        assert_eq!(rule.to_string(), "@@||example.com^$document,third-party");
        assert_eq!(NetworkRule::parse(&rule.to_string()), Some(rule));
    }

    #[test]
    fn test_expires_hours() {
        assert_eq!(parse_expires("12 hours"), Some(Duration::from_secs(12 * 3600)));
        assert_eq!(parse_expires("2"), Some(Duration::from_secs(2 * 86_400)));
        assert_eq!(parse_expires("soon"), None);
    }
}
