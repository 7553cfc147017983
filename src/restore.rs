//! Turning a disguised deep link (`/?route=%2Fdeep%2Fpath`) back into a real route.

use crate::page::{PageError, PageHost, ReadyState};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Query parameter carrying a disguised route.
pub const ROUTE_QUERY_KEY: &str = "route";

/// Decoded route hidden in `url`'s query, if any.
pub fn disguised_route(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == ROUTE_QUERY_KEY)
        .map(|(_, value)| value.into_owned())
        .filter(|route| !route.is_empty())
}

/// URL that disguises `path` as a root request, the inverse of [`disguised_route`].
pub fn disguise_route(origin: &Url, path: &str) -> Url {
    let mut url = origin.clone();
    url.set_path("/");
    url.set_fragment(None);
    url.query_pairs_mut()
        .clear()
        .append_pair(ROUTE_QUERY_KEY, path);
    url
}

/// Restores the disguised route of the current location, if there is one.
///
/// The visible URL is replaced right away; once the document has loaded and `delay` has passed
/// the route is pushed again and `popstate` fired so the router renders it. Returns the
/// restored route.
pub async fn restore_route(page: &dyn PageHost, delay: Duration) -> Result<Option<String>, PageError> {
    let location = page.location();
    let Some(route) = disguised_route(&location) else {
        return Ok(None);
    };
    let visible = match location.fragment() {
        Some(fragment) => format!("{route}#{fragment}"),
        None => route.clone(),
    };
    page.replace_state(&visible)?;
    debug!(path = %visible, "disguised route unwrapped");

    let mut ready = page.ready_state();
    ready
        .wait_for(|state| *state == ReadyState::Complete)
        .await
        .map_err(|_| PageError::Closed)?;
    tokio::time::sleep(delay).await;

    page.push_state(&route)?;
    page.dispatch_popstate();
    info!(path = %route, "route restored");
    Ok(Some(route))
}
