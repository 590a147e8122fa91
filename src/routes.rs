use actix_web::web;
use crate::handlers;

/// Admin listener routes. Everything under /admin requires the shared credential;
/// /health is public.
pub fn configure_admin_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/admin") // Base path: /admin
            .route("/push", web::post().to(handlers::admin_handlers::push_command))
            .route("/sessions", web::get().to(handlers::admin_handlers::list_sessions))
            .route(
                "/queue/{sn}/{direction}/last",
                web::get().to(handlers::admin_handlers::peek_last_entry),
            )
            .route(
                "/queue/{sn}/{direction}",
                web::delete().to(handlers::admin_handlers::purge_channel),
            ),
    );
    cfg.service(
        web::resource("/health")
            .route(web::get().to(handlers::health::health_check))
    );
}

/// Terminal listener routes: every GET, on any path, becomes a terminal session.
pub fn configure_terminal_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/{tail:.*}", web::get().to(handlers::terminal_handlers::terminal_ws));
}
