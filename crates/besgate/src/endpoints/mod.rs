use axum::Router;
use axum::routing::get;
use tower::ServiceBuilder;

use crate::service::GatewayService;

mod catalog;
mod data;
mod error;
mod metrics;

pub use error::ResponseError;
use metrics::MetricsLayer;

use catalog::handle_catalog_request as catalog;
use data::handle_data_request as data;

pub async fn healthcheck() -> &'static str {
    crate::metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(service: GatewayService) -> Router {
    let layer = ServiceBuilder::new().layer(MetricsLayer);
    Router::new()
        .route("/catalog/*path", get(catalog))
        .route("/data/*path", get(data))
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use besgate_service::bes::BesError;
    use besgate_service::config::Config;
    use besgate_test::{ScriptedBes, setup};
    use tower::ServiceExt;

    use super::*;
    use crate::service::GatewayService;

    fn app(bes: ScriptedBes) -> Router {
        let service = GatewayService::with_backend(Config::default(), Arc::new(bes)).unwrap();
        create_app(service)
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_healthcheck() {
        setup();
        let app = app(ScriptedBes::new());
        let response = app
            .oneshot(Request::get("/healthcheck").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "ok");
    }

    #[tokio::test]
    async fn test_catalog_request() {
        setup();
        let app = app(ScriptedBes::new().respond_all("<node name=\"/data\"/>"));
        let response = app
            .oneshot(Request::get("/catalog/data").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("<node"));
    }

    #[tokio::test]
    async fn test_catalog_not_found() {
        setup();
        let app = app(ScriptedBes::new().fail_all(BesError::NotFound("nope".to_owned())));
        let response = app
            .oneshot(Request::get("/catalog/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_data_requires_delay_signal() {
        setup();
        let app = app(ScriptedBes::new());
        let response = app
            .oneshot(
                Request::get("/data/sst.nc")
                    .header("host", "localhost:3017")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().contains_key("x-dap-async-required"));
    }

    #[tokio::test]
    async fn test_data_accept_then_pending() {
        setup();
        let service =
            GatewayService::with_backend(Config::default(), Arc::new(ScriptedBes::new()))
                .unwrap();

        let request = || {
            Request::get("/data/sst.nc?async=60")
                .header("host", "localhost:3017")
                .body(Body::empty())
                .unwrap()
        };

        let response = create_app(service.clone()).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_string(response).await;
        assert!(body.contains("http://localhost:3017/data/sst.nc?async=60"));

        let response = create_app(service).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
