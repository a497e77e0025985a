// Shared fixtures for the behaviour tests
pub use vidgate_core::{HttpResponse, MockHttpClient};

/// Upstream stand-in for id lookups: answers `{"items":[...]}` with one item
/// per requested id that `render` produces an item for.
pub fn lookup_mock(render: fn(&str) -> Option<String>) -> MockHttpClient {
    MockHttpClient::new(move |request| {
        let items: Vec<String> = request
            .query_param("id")
            .unwrap_or_default()
            .split(',')
            .filter_map(render)
            .collect();
        Ok(HttpResponse::ok_json(format!(
            r#"{{"items":[{}]}}"#,
            items.join(",")
        )))
    })
}
