use std::str::FromStr;

use actix_web::{get, post, web, Responder, Scope};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::Error,
    service::{ScheduleRequest, Service},
    tracking::DeliveryStatus,
};

/// Accepts a message for delivery. Synchronous acceptance only; delivery
/// status is available from the tracking record.
#[post("")]
async fn schedule(
    service: web::Data<Service>,
    request: web::Json<ScheduleRequest>,
) -> Result<impl Responder, Error> {
    let receipt = service.schedule(request.into_inner()).await?;

    Ok(web::Json(receipt))
}

#[get("/{message_id}")]
async fn status(
    service: web::Data<Service>,
    path: web::Path<Uuid>,
) -> Result<impl Responder, Error> {
    let entry = service.status(*path).await?;

    Ok(web::Json(entry))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

#[get("")]
async fn list(
    service: web::Data<Service>,
    query: web::Query<ListQuery>,
) -> Result<impl Responder, Error> {
    let status_filter = query
        .status
        .as_deref()
        .map(DeliveryStatus::from_str)
        .transpose()
        .map_err(|_| Error::invalid_parameter("unknown status filter"))?;

    let entries = service.list_messages(status_filter).await?;

    Ok(web::Json(entries))
}

pub fn service() -> Scope {
    web::scope("/messages")
        .service(schedule)
        .service(list)
        .service(status)
}
