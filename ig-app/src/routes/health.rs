use axum::routing::get;

pub const HEALTH_TEXT: &str = "Instagram AI Bot server is running!";

pub fn router() -> axum::Router {
    axum::Router::new().route("/", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health() -> &'static str {
    HEALTH_TEXT
}
