use actix_web::{get, web, Responder, Scope};

use crate::{error::Error, service::Service};

#[get("")]
async fn stats(service: web::Data<Service>) -> Result<impl Responder, Error> {
    let stats = service.statistics().await?;

    Ok(web::Json(stats))
}

pub fn service() -> Scope {
    web::scope("/stats").service(stats)
}
