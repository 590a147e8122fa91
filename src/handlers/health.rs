use actix_web::{web, HttpResponse, Responder};
use serde::{Deserialize, Serialize};

use crate::services::relay_queue::RelayQueue;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    status: String,
    version: String,
    relay_backend: String,
}

pub async fn health_check(queue: web::Data<RelayQueue>) -> impl Responder {
    // Public endpoint, no session or queue contents
    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        relay_backend: queue.backend_name().to_string(),
    };

    HttpResponse::Ok().json(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::relay_queue::ChannelKeys;
    use actix_web::{test, App};

    #[actix_rt::test]
    async fn test_health_is_public() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(RelayQueue::new_memory(ChannelKeys::default())))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let resp: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request()).await;

        assert_eq!(resp["status"], "ok");
        assert_eq!(resp["relayBackend"], "memory");
    }
}
