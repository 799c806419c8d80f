use std::path::{Path, PathBuf};

use gscsync_adapters::{rows_from_response, PropertySchema, SearchAnalyticsResponse, SiteEntry};
use gscsync_core::AnalyticsRow;

fn fixture(rel: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(rel)
}

fn read_json(rel: &str) -> serde_json::Value {
    let path = fixture(rel);
    let text = std::fs::read_to_string(&path).expect("reading fixture");
    serde_json::from_str(&text).expect("parsing fixture")
}

#[test]
fn search_console_fixture_maps_to_rows_with_escaped_keys() {
    let response: SearchAnalyticsResponse =
        serde_json::from_value(read_json("searchconsole/query_response.json")).expect("shape");
    let rows = rows_from_response(response);

    assert_eq!(rows.len(), 2, "row with two keys must be skipped");
    assert_eq!(rows[0].query, "chaussures randonnée");
    assert_eq!(rows[0].clicks, 12);
    assert_eq!(rows[0].impressions, 340);
    assert_eq!(
        rows[0].key().as_str(),
        "2025-08-01|chaussures randonnée|https://danslesbottes.fr/randonnee/|fra|MOBILE"
    );
    assert_eq!(
        rows[1].key().as_str(),
        "2025-08-01|bottes \\| pluie|https://danslesbottes.fr/bottes/|bel|DESKTOP"
    );
}

#[test]
fn sites_fixture_lists_permission_levels() {
    let value = read_json("searchconsole/sites.json");
    let entries: Vec<SiteEntry> =
        serde_json::from_value(value["siteEntry"].clone()).expect("site entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].site_url, "sc-domain:danslesbottes.fr");
    assert_eq!(entries[0].permission_level, "siteOwner");
}

#[test]
fn notion_page_fixture_decodes_to_source_row_values() {
    let page = read_json("notion/page.json");
    let record = PropertySchema::default()
        .decode_page(&page)
        .expect("decodes");

    let response: SearchAnalyticsResponse =
        serde_json::from_value(read_json("searchconsole/query_response.json")).expect("shape");
    let row: AnalyticsRow = rows_from_response(response).remove(0);

    assert_eq!(record.id.as_str(), "59833787-2cf9-4fdf-8782-e53db20768a5");
    assert_eq!(record.properties.key, row.key());
    assert_eq!(record.properties.query, row.query);
    assert_eq!(record.properties.page, row.page);
    assert_eq!(record.properties.country, row.country);
    assert_eq!(record.properties.device, row.device);
    assert_eq!(record.properties.clicks, row.clicks);
    assert_eq!(record.properties.impressions, row.impressions);
    assert_eq!(record.properties.ctr, row.ctr);
    assert_eq!(record.properties.position, row.position);
}
