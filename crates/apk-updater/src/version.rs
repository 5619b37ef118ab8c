//! Version precedence under Semantic Versioning 2.0.
//!
//! Release tags in the wild are not always strict SemVer ("1.0", "2.1.0.4"),
//! so comparison happens in two tiers:
//! - both sides strict SemVer: delegate to [`semver::Version`] ordering
//! - otherwise: a lenient comparison that accepts any number of numeric base
//!   segments and applies SemVer prerelease precedence
//!
//! Build metadata (everything after `+`) never affects precedence. Anything that
//! cannot be parsed is never considered newer.

use std::cmp::Ordering;

use semver::Version;

/// Returns true if `remote` has strictly higher precedence than `current`.
///
/// Empty or unparseable input on either side yields `false`.
///
/// ```
/// use apk_updater::version::is_newer_version;
///
/// assert!(is_newer_version("1.0.0-beta.10", "1.0.0-beta.2"));
/// assert!(!is_newer_version("1.0", "1.0.0"));
/// assert!(!is_newer_version("1.2.3+001", "1.2.3+002"));
/// ```
pub fn is_newer_version(remote: &str, current: &str) -> bool {
    compare_versions(remote, current) == Some(Ordering::Greater)
}

/// Compare two version strings by precedence.
///
/// Returns `None` if either side is empty or has a non-numeric base segment.
pub fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    let a = strip_build_metadata(a);
    let b = strip_build_metadata(b);
    if a.is_empty() || b.is_empty() {
        return None;
    }

    if let (Ok(va), Ok(vb)) = (Version::parse(a), Version::parse(b)) {
        return Some(va.cmp(&vb));
    }

    compare_lenient(a, b)
}

/// Lenient tier only. Inputs must already be stripped of build metadata.
pub(crate) fn compare_lenient(a: &str, b: &str) -> Option<Ordering> {
    let pa = LenientVersion::parse(a)?;
    let pb = LenientVersion::parse(b)?;
    Some(pa.cmp_precedence(&pb))
}

/// Strip a leading `v`/`V` from a release tag ("v3.0.0" -> "3.0.0").
pub fn normalize_tag(tag: &str) -> &str {
    let tag = tag.trim();
    tag.strip_prefix('v')
        .or_else(|| tag.strip_prefix('V'))
        .unwrap_or(tag)
}

fn strip_build_metadata(s: &str) -> &str {
    match s.split_once('+') {
        Some((head, _)) => head,
        None => s,
    }
}

/// Version parsed without SemVer's strictness on segment count and leading zeros.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LenientVersion<'a> {
    base: Vec<u64>,
    prerelease: Option<&'a str>,
}

impl<'a> LenientVersion<'a> {
    fn parse(s: &'a str) -> Option<Self> {
        let (base, prerelease) = match s.split_once('-') {
            Some((base, pre)) => (base, Some(pre).filter(|p| !p.is_empty())),
            None => (s, None),
        };

        let base = base
            .split('.')
            .map(|seg| {
                if !seg.is_empty() && seg.bytes().all(|c| c.is_ascii_digit()) {
                    seg.parse::<u64>().ok()
                } else {
                    None
                }
            })
            .collect::<Option<Vec<_>>>()?;

        Some(Self { base, prerelease })
    }

    fn cmp_precedence(&self, other: &Self) -> Ordering {
        let len = self.base.len().max(other.base.len());
        for i in 0..len {
            let a = self.base.get(i).copied().unwrap_or(0);
            let b = other.base.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }

        match (self.prerelease, other.prerelease) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => cmp_prerelease(a, b),
        }
    }
}

fn cmp_prerelease(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(x), Some(y)) => match cmp_identifier(x, y) {
                Ordering::Equal => continue,
                ord => return ord,
            },
        }
    }
}

fn cmp_identifier(a: &str, b: &str) -> Ordering {
    match (is_numeric(a), is_numeric(b)) {
        (true, true) => cmp_numeric(a, b),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.as_bytes().cmp(b.as_bytes()),
    }
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|c| c.is_ascii_digit())
}

// Digit strings of arbitrary length, compared by value.
fn cmp_numeric(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}
