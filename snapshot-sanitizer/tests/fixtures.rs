use pretty_assertions::assert_eq;

use snapshot_sanitizer::{sanitize, sanitize_or_passthrough, TransformOptions};

const NO_VALIDATOR: TransformOptions = TransformOptions {
    snapshot_version: 9,
    inject_validator: false,
};

#[test]
fn fixtures_match_expected_output() {
    let cases = [
        (
            "seo-heavy",
            include_str!("fixtures/html/seo-heavy.html"),
            include_str!("fixtures/expected/seo-heavy.html"),
        ),
        (
            "base-and-http-equiv",
            include_str!("fixtures/html/base-and-http-equiv.html"),
            include_str!("fixtures/expected/base-and-http-equiv.html"),
        ),
    ];

    for (name, html, expected) in cases {
        let actual = sanitize(html, &NO_VALIDATOR).expect("fixture sanitizes");
        assert_eq!(
            actual.trim_end(),
            expected.trim_end_matches('\n'),
            "fixture mismatch: {name}"
        );
    }
}

#[test]
fn fixtures_are_stable_under_resanitizing() {
    let documents = [
        include_str!("fixtures/html/seo-heavy.html"),
        include_str!("fixtures/html/base-and-http-equiv.html"),
    ];

    for html in documents {
        let options = TransformOptions::default();
        let once = sanitize(html, &options).expect("first pass");
        let twice = sanitize(&once, &options).expect("second pass");
        assert_eq!(once, twice);
    }
}

#[test]
fn fragment_fixture_passes_through() {
    let fragment = include_str!("fixtures/html/bare-fragment.html");
    assert_eq!(
        sanitize_or_passthrough(fragment, &TransformOptions::default()),
        fragment
    );
}
