use std::{
    collections::{BTreeMap, HashSet},
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use url::Url;

const NETSCAPE_HEADER: &str = "# Netscape HTTP Cookie File";
const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";
const CONSENT_COOKIE: &str = "CONSENT";
const CONSENT_VALUE: &str = "YES+";
// 2038-01-19, the largest expiry 32-bit cookie parsers accept.
const CONSENT_EXPIRY: i64 = 2_147_483_647;
const SID_LIKE: [&str; 7] = [
    "__Secure-1PSID",
    "__Secure-3PSID",
    "SID",
    "HSID",
    "SSID",
    "SAPISID",
    "APISID",
];
const PINTEREST_FLAGS: [&str; 1] = ["csrftoken"];

/// Sites for which a cookie store may be supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CookieSite {
    YouTube,
    Instagram,
    TikTok,
    Pinterest,
    Twitter,
}

impl CookieSite {
    pub const ALL: [CookieSite; 5] = [
        CookieSite::YouTube,
        CookieSite::Instagram,
        CookieSite::TikTok,
        CookieSite::Pinterest,
        CookieSite::Twitter,
    ];

    pub fn key(self) -> &'static str {
        match self {
            CookieSite::YouTube => "youtube",
            CookieSite::Instagram => "instagram",
            CookieSite::TikTok => "tiktok",
            CookieSite::Pinterest => "pinterest",
            CookieSite::Twitter => "twitter",
        }
    }

    fn file_names(self) -> &'static [&'static str] {
        match self {
            CookieSite::YouTube => &["youtube.txt"],
            CookieSite::Instagram => &["instagram.txt"],
            CookieSite::TikTok => &["tiktok.txt"],
            CookieSite::Pinterest => &["pinterest.txt"],
            CookieSite::Twitter => &["twitter.txt", "x.txt"],
        }
    }

    /// Domain under which a missing consent cookie is synthesized.
    fn consent_domain(self) -> Option<&'static str> {
        match self {
            CookieSite::YouTube => Some("youtube.com"),
            _ => None,
        }
    }

    /// Rows for the first domain are copied to the second, where requests are
    /// proxied through a shared sign-in provider.
    fn mirrored_domains(self) -> Option<(&'static str, &'static str)> {
        match self {
            CookieSite::YouTube => Some(("youtube.com", "google.com")),
            _ => None,
        }
    }

    fn required_flags(self) -> &'static [&'static str] {
        match self {
            CookieSite::YouTube => &SID_LIKE,
            CookieSite::Pinterest => &PINTEREST_FLAGS,
            _ => &[],
        }
    }

    pub fn for_url(input: &str) -> Option<Self> {
        let parsed = Url::parse(input).ok()?;
        let host = parsed.host_str()?.to_ascii_lowercase();
        let matches = |domain: &str| host == domain || host.ends_with(&format!(".{domain}"));

        if matches("youtube.com") || matches("youtu.be") {
            Some(CookieSite::YouTube)
        } else if matches("instagram.com") {
            Some(CookieSite::Instagram)
        } else if matches("tiktok.com") {
            Some(CookieSite::TikTok)
        } else if host.split('.').any(|label| label == "pinterest") || matches("pin.it") {
            Some(CookieSite::Pinterest)
        } else if matches("twitter.com") || matches("x.com") {
            Some(CookieSite::Twitter)
        } else {
            None
        }
    }
}

/// Augmented copy of a cookie store. The backing temp file is removed when the
/// bundle is dropped.
#[derive(Debug)]
pub struct CookieBundle {
    site: Option<CookieSite>,
    rows: usize,
    file: NamedTempFile,
}

impl CookieBundle {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// `None` for an uploaded store whose URL matches no known site.
    pub fn site(&self) -> Option<CookieSite> {
        self.site
    }

    pub fn rows(&self) -> usize {
        self.rows
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CookieStatus {
    pub found: bool,
    pub row_count: usize,
    pub has_consent_flag: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_other_required_flags: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct CookieReconciler {
    search_dirs: Vec<PathBuf>,
}

impl CookieReconciler {
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Self { search_dirs }
    }

    /// Candidate files in lookup order: every directory is tried for a file
    /// name before moving on to the next name.
    pub fn candidates(&self, site: CookieSite) -> Vec<PathBuf> {
        site.file_names()
            .iter()
            .flat_map(|name| self.search_dirs.iter().map(move |dir| dir.join(name)))
            .collect()
    }

    pub fn locate(&self, site: CookieSite) -> Option<PathBuf> {
        self.candidates(site).into_iter().find(|path| {
            fs::metadata(path)
                .map(|metadata| metadata.is_file() && metadata.len() > 0)
                .unwrap_or(false)
        })
    }

    /// Builds a fresh bundle from `source`. The source file is only read.
    pub fn reconcile(&self, site: CookieSite, source: &Path) -> io::Result<CookieBundle> {
        let raw = fs::read(source)?;
        write_bundle(Some(site), &String::from_utf8_lossy(&raw))
    }

    /// Bundle from a cookie store sent with the request. It goes through the
    /// same repairs as a store on disk; unknown sites only get the prefix and
    /// header repairs.
    pub fn from_upload(&self, url: &str, contents: &str) -> io::Result<CookieBundle> {
        write_bundle(CookieSite::for_url(url), contents)
    }

    /// Cookie bundle for `url` if one of the known sites has a store on disk.
    /// Any failure degrades to `None`: the download is then tried signed out.
    pub fn prepare(&self, url: &str) -> Option<CookieBundle> {
        let site = CookieSite::for_url(url)?;
        let Some(source) = self.locate(site) else {
            debug!("No cookie store found for {}", site.key());
            return None;
        };

        match self.reconcile(site, &source) {
            Ok(bundle) => {
                debug!(
                    "Cookie bundle for {} ready with {} row(s)",
                    site.key(),
                    bundle.rows()
                );
                Some(bundle)
            }
            Err(error) => {
                warn!(
                    "Could not prepare cookies for {}; continuing without them: {error}",
                    site.key()
                );
                None
            }
        }
    }

    pub fn overview(&self) -> BTreeMap<&'static str, CookieStatus> {
        CookieSite::ALL
            .iter()
            .map(|site| (site.key(), self.status(*site)))
            .collect()
    }

    fn status(&self, site: CookieSite) -> CookieStatus {
        let contents = self
            .locate(site)
            .and_then(|path| fs::read(path).ok())
            .map(|raw| String::from_utf8_lossy(&raw).into_owned());

        let Some(contents) = contents else {
            return CookieStatus {
                found: false,
                row_count: 0,
                has_consent_flag: false,
                has_other_required_flags: None,
            };
        };

        let names = contents
            .lines()
            .map(|line| line.strip_prefix(HTTP_ONLY_PREFIX).unwrap_or(line))
            .filter_map(cookie_name)
            .collect::<Vec<_>>();
        let required = site.required_flags();

        CookieStatus {
            found: true,
            row_count: names.len(),
            has_consent_flag: names.contains(&CONSENT_COOKIE),
            has_other_required_flags: (!required.is_empty())
                .then(|| names.iter().any(|name| required.contains(name))),
        }
    }
}

fn write_bundle(site: Option<CookieSite>, contents: &str) -> io::Result<CookieBundle> {
    let rows = reconcile_rows(site, contents);

    let prefix = site.map_or("uploaded", CookieSite::key);
    let mut file = tempfile::Builder::new()
        .prefix(&format!("{prefix}_cookies_"))
        .suffix(".txt")
        .tempfile()?;
    for row in &rows {
        writeln!(file, "{row}")?;
    }
    file.flush()?;

    Ok(CookieBundle {
        site,
        rows: rows.iter().filter(|row| cookie_fields(row).is_some()).count(),
        file,
    })
}

/// Applies the repairs in order: HttpOnly prefix removal, consent cookie, then
/// domain mirroring. Running it twice on the same input yields the same rows.
fn reconcile_rows(site: Option<CookieSite>, contents: &str) -> Vec<String> {
    let mut rows = contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.strip_prefix(HTTP_ONLY_PREFIX).unwrap_or(line).to_string())
        .collect::<Vec<_>>();

    if rows
        .first()
        .is_none_or(|first| !first.contains("HTTP Cookie File"))
    {
        rows.insert(0, NETSCAPE_HEADER.to_string());
    }

    if let Some(domain) = site.and_then(CookieSite::consent_domain)
        && !rows.iter().any(|row| cookie_name(row) == Some(CONSENT_COOKIE))
    {
        rows.push(format!(
            ".{domain}\tTRUE\t/\tTRUE\t{CONSENT_EXPIRY}\t{CONSENT_COOKIE}\t{CONSENT_VALUE}"
        ));
    }

    if let Some((from, to)) = site.and_then(CookieSite::mirrored_domains) {
        rows = mirror_rows(rows, from, to);
    }

    rows
}

fn mirror_rows(rows: Vec<String>, from: &str, to: &str) -> Vec<String> {
    let mut seen = rows.iter().cloned().collect::<HashSet<_>>();
    let mut merged = Vec::with_capacity(rows.len() * 2);

    for row in rows {
        let copy = mirrored_row(&row, from, to);
        merged.push(row);
        if let Some(copy) = copy
            && seen.insert(copy.clone())
        {
            merged.push(copy);
        }
    }

    merged
}

fn mirrored_row(row: &str, from: &str, to: &str) -> Option<String> {
    let fields = cookie_fields(row)?;
    let subdomain = fields[0].strip_suffix(from)?;
    if !(subdomain.is_empty() || subdomain.ends_with('.')) {
        return None;
    }

    Some(format!("{subdomain}{to}\t{}", fields[1..].join("\t")))
}

/// Columns of a cookie row: domain, subdomain flag, path, secure, expiry,
/// name, value.
fn cookie_fields(line: &str) -> Option<Vec<&str>> {
    if line.starts_with('#') {
        return None;
    }
    let fields = line.split('\t').collect::<Vec<_>>();
    (fields.len() >= 7).then_some(fields)
}

fn cookie_name(line: &str) -> Option<&str> {
    cookie_fields(line).map(|fields| fields[5])
}
