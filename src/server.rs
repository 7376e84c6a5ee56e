use actix_web::middleware::from_fn;
use actix_web::web;

use crate::routes;

pub fn webserver_routes(configuration: &mut web::ServiceConfig) {
    configuration
        .service(
            web::scope("/health")
                .service(routes::health::ready)
                .service(routes::health::lively),
        )
        .service(
            web::scope("/backup")
                .wrap(from_fn(routes::auth::require_api_key))
                // literal paths first so they never match as `{db}`
                .service(routes::backups::list_tasks)
                .service(routes::backups::get_task)
                .service(routes::backups::cancel_task)
                .service(routes::backups::download_backup)
                .service(routes::backups::delete_backup)
                .service(routes::backups::schedule_backup)
                .service(routes::backups::list_backups)
                .service(routes::backups::trigger_backup),
        );
}
