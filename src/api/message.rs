use actix_web::{get, http::StatusCode, post, web, HttpResponse, Responder, Scope};
use serde::{Deserialize, Serialize};

use crate::{error::Error, message::MessageStatistics, service::Service};

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateMessageRequest {
    pub content: String,
    pub status_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateMessageResponse {
    pub message: String,
    pub id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatisticsResponse {
    pub statistics: MessageStatistics,
}

#[post("")]
async fn create_message(
    service: web::Data<Service>,
    body: web::Json<CreateMessageRequest>,
) -> Result<impl Responder, Error> {
    let id = service.create_message(&body.content, body.status_id).await?;

    Ok(HttpResponse::build(StatusCode::CREATED).json(CreateMessageResponse {
        message: "Message create success".to_owned(),
        id,
    }))
}

#[get("/stat")]
async fn statistics(service: web::Data<Service>) -> Result<impl Responder, Error> {
    let statistics = service.statistics().await?;

    Ok(web::Json(StatisticsResponse { statistics }))
}

pub fn service() -> Scope {
    web::scope("/api/message")
        .service(create_message)
        .service(statistics)
}
