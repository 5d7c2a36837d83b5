use actix_web::{get, web, Responder, Scope};

use crate::{error::Error, service::Service};

/// The dead-letter channel, exposed read-only for the out-of-band consumer.
#[get("")]
async fn list(service: web::Data<Service>) -> Result<impl Responder, Error> {
    let letters = service.dead_letters().await?;

    Ok(web::Json(letters))
}

pub fn service() -> Scope {
    web::scope("/dead-letters").service(list)
}
