//! Client-side freshness validator appended to sanitized snapshots.

/// `id` of the validator `<script>` element, shared by snapshots and the live root document.
pub const VALIDATOR_SCRIPT_ID: &str = "truthorigin-snapshot";
/// Attribute carrying the version marker on the validator element.
pub const VERSION_ATTRIBUTE: &str = "data-version";
/// Attribute on the live root's validator element that forces every snapshot to redirect.
pub const FORCE_ORIGIN_ATTRIBUTE: &str = "data-force-origin";

const VALIDATOR_SOURCE: &str = include_str!("validator.js");

/// Builds the `<script>` element that checks a served snapshot against the live root document.
///
/// When the snapshot is opened by a browser the script fetches `/index.html`, compares its own
/// `data-version` with the root's, and redirects to `/?route=<path>` on a mismatch or when the
/// root sets `data-force-origin="true"`. Missing versions and network failures leave the
/// snapshot in place.
pub fn validator_element(snapshot_version: u32) -> String {
    format!(
        "<script id=\"{VALIDATOR_SCRIPT_ID}\" {VERSION_ATTRIBUTE}=\"{snapshot_version}\">\n{}\n</script>",
        VALIDATOR_SOURCE.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_carries_version_and_id() {
        let element = validator_element(9);
        assert!(element.starts_with(r#"<script id="truthorigin-snapshot" data-version="9">"#));
        assert!(element.ends_with("</script>"));
        assert!(element.contains("/index.html"));
    }

    #[test]
    fn source_never_closes_its_own_script_tag() {
        assert!(!VALIDATOR_SOURCE.contains("</script"));
    }
}
