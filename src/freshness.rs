//! Deciding whether a served snapshot is still current.
//!
//! Mirrors the validator script that sanitized snapshots carry: fetch the live `/index.html`,
//! compare validator versions, and redirect to the disguised route when the snapshot is stale
//! or the live root forces origin traffic. Anything inconclusive keeps the snapshot.

use crate::restore::disguise_route;
use reqwest::header::CACHE_CONTROL;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::Serialize;
use snapshot_sanitizer::{FORCE_ORIGIN_ATTRIBUTE, VALIDATOR_SCRIPT_ID, VERSION_ATTRIBUTE};
use std::error::Error;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Upper bound on the root document fetch.
pub const ROOT_FETCH_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Path of the live root document.
pub const ROOT_DOCUMENT_PATH: &str = "/index.html";

const USER_AGENT: &str = concat!("truthseo-freshness/", env!("CARGO_PKG_VERSION"));

/// Validator attributes found in a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorTag {
    /// Trimmed `data-version`, `None` when absent or blank.
    pub version: Option<String>,
    /// `data-force-origin="true"`.
    pub force_origin: bool,
}

/// Reads the validator element out of `html`.
pub fn read_validator(html: &str) -> Option<ValidatorTag> {
    let selector = Selector::parse(&format!("#{VALIDATOR_SCRIPT_ID}")).ok()?;
    let document = Html::parse_document(html);
    let element = document.select(&selector).next()?;
    let attr = |name: &str| element.value().attr(name).map(str::trim);
    Some(ValidatorTag {
        version: attr(VERSION_ATTRIBUTE)
            .filter(|version| !version.is_empty())
            .map(str::to_string),
        force_origin: attr(FORCE_ORIGIN_ATTRIBUTE) == Some("true"),
    })
}

/// Why the snapshot was kept without a comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum SkipReason {
    /// The live root has no validator element.
    RootValidatorMissing,
    /// The live root's validator has no version.
    RootVersionMissing,
    /// The snapshot carries no version.
    SnapshotVersionMissing,
    /// The root document could not be fetched.
    FetchFailed(String),
    /// The root document fetch exceeded [`ROOT_FETCH_TIMEOUT`].
    TimedOut,
}

/// Why a snapshot redirects to the origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "cause")]
pub enum RedirectCause {
    /// The live root sets `data-force-origin="true"`.
    ForcedOrigin,
    /// Versions differ.
    VersionMismatch {
        /// Version in the snapshot.
        snapshot: String,
        /// Version in the live root.
        root: String,
    },
}

/// Outcome of a freshness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "verdict")]
pub enum FreshnessVerdict {
    /// Snapshot and root agree.
    Current {
        /// Shared version.
        version: String,
    },
    /// The snapshot should hand over to the live application.
    Redirect {
        /// Where to send the visitor.
        location: Url,
        /// What triggered the redirect.
        #[serde(flatten)]
        cause: RedirectCause,
    },
    /// Inconclusive; the snapshot stays.
    Skipped(SkipReason),
}

/// Errors setting up a freshness check.
#[derive(Debug)]
pub enum FreshnessError {
    /// The HTTP client could not be built.
    Client(reqwest::Error),
    /// The origin is not a base URL.
    InvalidOrigin {
        /// Origin as given.
        origin: String,
        /// Parse failure.
        source: url::ParseError,
    },
}

impl fmt::Display for FreshnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client(err) => write!(f, "http client error: {err}"),
            Self::InvalidOrigin { origin, source } => {
                write!(f, "invalid origin `{origin}`: {source}")
            }
        }
    }
}

impl Error for FreshnessError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Client(err) => Some(err),
            Self::InvalidOrigin { source, .. } => Some(source),
        }
    }
}

/// Compares a snapshot's validator with the live root document.
///
/// Checks run in the order the served validator applies them: root validator present, forced
/// origin, root version, snapshot version, then the comparison.
pub fn evaluate(
    snapshot: Option<&ValidatorTag>,
    root_html: &str,
    origin: &Url,
    path: &str,
) -> FreshnessVerdict {
    let Some(root) = read_validator(root_html) else {
        return FreshnessVerdict::Skipped(SkipReason::RootValidatorMissing);
    };
    let redirect = |cause| FreshnessVerdict::Redirect {
        location: disguise_route(origin, path),
        cause,
    };
    if root.force_origin {
        return redirect(RedirectCause::ForcedOrigin);
    }
    let Some(root_version) = root.version else {
        return FreshnessVerdict::Skipped(SkipReason::RootVersionMissing);
    };
    let Some(snapshot_version) = snapshot.and_then(|tag| tag.version.clone()) else {
        return FreshnessVerdict::Skipped(SkipReason::SnapshotVersionMissing);
    };
    if snapshot_version != root_version {
        return redirect(RedirectCause::VersionMismatch {
            snapshot: snapshot_version,
            root: root_version,
        });
    }
    FreshnessVerdict::Current {
        version: snapshot_version,
    }
}

/// HTTP client used for root document fetches.
pub fn build_client() -> Result<Client, FreshnessError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(FreshnessError::Client)
}

/// Fetches the live root of `origin` and evaluates `snapshot_html` served at `path` against it.
///
/// Network failures and timeouts are verdicts, not errors.
pub async fn check_freshness(
    client: &Client,
    snapshot_html: &str,
    origin: &str,
    path: &str,
) -> Result<FreshnessVerdict, FreshnessError> {
    let invalid = |source| FreshnessError::InvalidOrigin {
        origin: origin.to_string(),
        source,
    };
    let base = Url::parse(origin).map_err(invalid)?;
    let root_url = base.join(ROOT_DOCUMENT_PATH).map_err(invalid)?;
    let snapshot = read_validator(snapshot_html);

    debug!(url = %root_url, "fetching root document");
    let fetched = async {
        client
            .get(root_url.clone())
            .header(CACHE_CONTROL, "no-cache")
            .timeout(ROOT_FETCH_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
    .await;

    let root_html = match fetched {
        Ok(body) => body,
        Err(err) if err.is_timeout() => {
            warn!(url = %root_url, "root document fetch timed out, keeping snapshot");
            return Ok(FreshnessVerdict::Skipped(SkipReason::TimedOut));
        }
        Err(err) => {
            warn!(url = %root_url, error = %err, "root document fetch failed, keeping snapshot");
            return Ok(FreshnessVerdict::Skipped(SkipReason::FetchFailed(
                err.to_string(),
            )));
        }
    };

    let verdict = evaluate(snapshot.as_ref(), &root_html, &base, path);
    info!(path, ?verdict, "freshness evaluated");
    Ok(verdict)
}
