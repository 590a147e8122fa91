use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tracing::info;

use crate::error::AppError;
use crate::models::envelope::{CMD_FIELD, SN_FIELD};
use crate::models::terminal::no_response_expected;
use crate::models::Envelope;
use crate::security::admin_auth::AdminAuthorized;
use crate::services::dispatch_bridge::{DispatchBridge, DispatchOutcome};
use crate::services::relay_queue::Direction;
use crate::services::session_registry::{SessionRegistry, SessionSummary};

/// Checks the push body and returns `(sn, command)`.
fn parse_push_body(body: &[u8]) -> Result<(String, Envelope), AppError> {
    let incomplete = || AppError::Validation("Incomplete or incorrect data.".to_string());

    let value: JsonValue = serde_json::from_slice(body).map_err(|_| incomplete())?;
    let object = value.as_object().filter(|o| !o.is_empty()).ok_or_else(incomplete)?;

    let sn = object
        .get(SN_FIELD)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(incomplete)?
        .to_string();
    object
        .get(CMD_FIELD)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(incomplete)?;

    let command = Envelope::from_value(value).map_err(|e| AppError::Validation(e.to_string()))?;
    Ok((sn, command))
}

/// Queue a command for a terminal and block until it answers
pub async fn push_command(
    _auth: AdminAuthorized,
    bridge: web::Data<DispatchBridge>,
    body: web::Bytes,
) -> Result<HttpResponse, AppError> {
    let (sn, command) = parse_push_body(&body)?;

    info!(device_sn = %sn, command = %command.kind(), "Admin dispatch requested");

    match bridge
        .dispatch(&sn, command, bridge.default_wait_timeout())
        .await?
    {
        DispatchOutcome::Reply(reply) => Ok(HttpResponse::Ok().json(reply.to_value())),
        DispatchOutcome::NoResponseExpected => Ok(HttpResponse::Ok().json(no_response_expected())),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsResponse {
    pub count: usize,
    pub sessions: Vec<SessionSummary>,
}

pub async fn list_sessions(
    _auth: AdminAuthorized,
    registry: web::Data<SessionRegistry>,
) -> Result<HttpResponse, AppError> {
    let sessions = registry.list();
    Ok(HttpResponse::Ok().json(SessionsResponse {
        count: sessions.len(),
        sessions,
    }))
}

pub async fn peek_last_entry(
    _auth: AdminAuthorized,
    bridge: web::Data<DispatchBridge>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, AppError> {
    let (sn, direction) = path.into_inner();
    let direction: Direction = direction.parse()?;

    match bridge.queue().peek_last(&sn, direction).await? {
        Some(entry) => Ok(HttpResponse::Ok().json(entry.to_value())),
        None => Err(AppError::NotFound(format!(
            "{} channel of {} is empty",
            direction, sn
        ))),
    }
}

pub async fn purge_channel(
    _auth: AdminAuthorized,
    bridge: web::Data<DispatchBridge>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, AppError> {
    let (sn, direction) = path.into_inner();
    let direction: Direction = direction.parse()?;

    let removed = bridge.queue().purge(&sn, direction).await?;
    info!(device_sn = %sn, direction = %direction, removed, "Relay channel purged by admin");

    Ok(HttpResponse::Ok().json(json!({
        "sn": sn,
        "direction": direction,
        "removed": removed
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::DispatchConfig;
    use crate::config::DispatchLockMode;
    use crate::routes::configure_admin_routes;
    use crate::security::admin_auth::AdminCredential;
    use crate::services::relay_queue::{ChannelKeys, RelayQueue};
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn bridge(wait: Duration) -> DispatchBridge {
        DispatchBridge::new(
            RelayQueue::new_memory(ChannelKeys::default()),
            &DispatchConfig {
                wait_timeout: wait,
                lock_timeout: Duration::from_secs(1),
                lock_mode: DispatchLockMode::PerDevice,
                poll_interval: Duration::from_millis(20),
            },
        )
    }

    macro_rules! admin_app {
        ($bridge:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new(AdminCredential::new("s3cret")))
                    .app_data(web::Data::new($bridge))
                    .app_data(web::Data::new(SessionRegistry::new()))
                    .configure(configure_admin_routes),
            )
            .await
        };
    }

    fn push(body: JsonValue) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/admin/push")
            .insert_header(("Authorization", "Bearer s3cret"))
            .set_json(body)
    }

    // `test` is actix_web::test in this module, so plain #[test] is unavailable
    #[actix_rt::test]
    async fn test_push_body_validation() {
        assert!(parse_push_body(br#"{"sn":"SN1","cmd":"getuserlist"}"#).is_ok());
        assert!(matches!(parse_push_body(b"{}"), Err(AppError::Validation(_))));
        assert!(matches!(parse_push_body(b"not json"), Err(AppError::Validation(_))));
        assert!(matches!(parse_push_body(br#"{"cmd":"reboot"}"#), Err(AppError::Validation(_))));
        assert!(matches!(parse_push_body(br#"{"sn":"SN1"}"#), Err(AppError::Validation(_))));
        assert!(matches!(parse_push_body(br#"{"sn":"SN1","cmd":""}"#), Err(AppError::Validation(_))));
        assert!(matches!(parse_push_body(br#"[1,2]"#), Err(AppError::Validation(_))));
    }

    #[actix_rt::test]
    async fn test_push_rejects_wrong_key() {
        let app = admin_app!(bridge(Duration::from_millis(100)));

        let req = test::TestRequest::post()
            .uri("/admin/push")
            .insert_header(("Authorization", "Bearer guess"))
            .set_json(json!({"sn": "SN1", "cmd": "reboot"}))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_rt::test]
    async fn test_push_rejects_missing_fields() {
        let app = admin_app!(bridge(Duration::from_millis(100)));

        let resp = test::call_service(&app, push(json!({"sn": "SN1"})).to_request()).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_rt::test]
    async fn test_push_reboot_returns_canned_status() {
        let bridge = bridge(Duration::from_secs(5));
        let queue = bridge.queue().clone();
        let app = admin_app!(bridge);

        let resp: JsonValue = test::call_and_read_body_json(
            &app,
            push(json!({"sn": "SN1", "cmd": "reboot"})).to_request(),
        )
        .await;

        assert_eq!(resp, json!({"status": "No response."}));
        assert_eq!(queue.len("SN1", Direction::Outbound).await.unwrap(), 1);
    }

    #[actix_rt::test]
    async fn test_push_returns_terminal_reply() {
        let bridge = bridge(Duration::from_secs(2));
        let queue = bridge.queue().clone();
        let app = admin_app!(bridge);

        actix_rt::spawn(async move {
            let cmd = queue
                .wait_dequeue("SN1", Direction::Outbound, Duration::from_secs(2))
                .await
                .unwrap()
                .unwrap();
            let reply = Envelope::from_value(json!({
                "ret": cmd.kind().name(),
                "sn": "SN1",
                "result": true,
                "count": 1,
                "record": [{"enrollid": 1, "name": "alice"}]
            }))
            .unwrap();
            queue.enqueue("SN1", Direction::Inbound, &reply).await.unwrap();
        });

        let resp: JsonValue = test::call_and_read_body_json(
            &app,
            push(json!({"sn": "SN1", "cmd": "getuserlist", "stn": true})).to_request(),
        )
        .await;

        assert_eq!(resp["ret"], "getuserlist");
        assert_eq!(resp["record"][0]["name"], "alice");
    }

    #[actix_rt::test]
    async fn test_push_times_out_with_gateway_timeout() {
        let app = admin_app!(bridge(Duration::from_millis(100)));

        let resp = test::call_service(
            &app,
            push(json!({"sn": "SN1", "cmd": "getuserlist"})).to_request(),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        let body: JsonValue = test::read_body_json(resp).await;
        assert_eq!(body["error_type"], "no_response");
    }

    #[actix_rt::test]
    async fn test_queue_inspection_and_purge() {
        let bridge = bridge(Duration::from_millis(100));
        let queue = bridge.queue().clone();
        let app = admin_app!(bridge);

        for name in ["getuserlist", "getuserinfo"] {
            let entry = Envelope::from_value(json!({"cmd": name, "sn": "SN1"})).unwrap();
            queue.enqueue("SN1", Direction::Outbound, &entry).await.unwrap();
        }

        let last: JsonValue = test::call_and_read_body_json(
            &app,
            test::TestRequest::get()
                .uri("/admin/queue/SN1/out/last")
                .insert_header(("Authorization", "Bearer s3cret"))
                .to_request(),
        )
        .await;
        assert_eq!(last["cmd"], "getuserinfo");

        let purged: JsonValue = test::call_and_read_body_json(
            &app,
            test::TestRequest::delete()
                .uri("/admin/queue/SN1/out")
                .insert_header(("Authorization", "Bearer s3cret"))
                .to_request(),
        )
        .await;
        assert_eq!(purged["removed"], 2);

        let empty = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/admin/queue/SN1/out/last")
                .insert_header(("Authorization", "Bearer s3cret"))
                .to_request(),
        )
        .await;
        assert_eq!(empty.status(), StatusCode::NOT_FOUND);

        let bad = test::call_service(
            &app,
            test::TestRequest::delete()
                .uri("/admin/queue/SN1/sideways")
                .insert_header(("Authorization", "Bearer s3cret"))
                .to_request(),
        )
        .await;
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_rt::test]
    async fn test_sessions_listing_requires_key() {
        let app = admin_app!(bridge(Duration::from_millis(100)));

        let denied = test::call_service(
            &app,
            test::TestRequest::get().uri("/admin/sessions").to_request(),
        )
        .await;
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let listed: JsonValue = test::call_and_read_body_json(
            &app,
            test::TestRequest::get()
                .uri("/admin/sessions")
                .insert_header(("Authorization", "Bearer s3cret"))
                .to_request(),
        )
        .await;
        assert_eq!(listed, json!({"count": 0, "sessions": []}));
    }
}
