use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use tracing::info;

use crate::services::terminal_session::{create_terminal_session, SessionServices, MAX_MESSAGE_SIZE};

/// WebSocket endpoint for terminals; any path is accepted
pub async fn terminal_ws(
    req: HttpRequest,
    stream: web::Payload,
    services: web::Data<SessionServices>,
) -> Result<HttpResponse, actix_web::Error> {
    info!(
        peer = ?req.peer_addr(),
        path = %req.path(),
        "Starting terminal WebSocket connection"
    );

    let session = create_terminal_session(services.get_ref());

    ws::WsResponseBuilder::new(session, &req, stream)
        .frame_size(MAX_MESSAGE_SIZE)
        .start()
}
