use actix_web::{get, http::StatusCode, web, web::JsonConfig, HttpResponse, Responder};

use crate::error::{Error, StatusBody};

pub mod message;
pub mod rate_limit;

#[get("/")]
async fn index() -> impl Responder {
    web::Json(StatusBody {
        code: StatusCode::OK.as_u16(),
        message: "application running".to_owned(),
    })
}

/// Fallback for unmatched routes.
pub async fn not_found() -> HttpResponse {
    HttpResponse::NotFound().json(StatusBody {
        code: StatusCode::NOT_FOUND.as_u16(),
        message: "route not found".to_owned(),
    })
}

/// Malformed JSON bodies are reported as validation errors.
pub fn json_config() -> JsonConfig {
    JsonConfig::default()
        .content_type_required(false)
        .error_handler(|err, _req| Error::validation(err.to_string()).into())
}

/// Registers every route; shared by the server and the HTTP tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(index)
        .service(message::service())
        .default_service(web::to(not_found));
}
