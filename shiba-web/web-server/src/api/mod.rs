use actix_web::{
    dev::HttpServiceFactory,
    get, services,
    web::{self, Json},
};
use common::api_bindings::HealthResponse;

use crate::app::AppError;

pub mod signaling;
pub mod socket;
pub mod stream;

#[get("/health")]
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

pub fn api_service() -> impl HttpServiceFactory {
    let query_config = web::QueryConfig::default()
        .error_handler(|err, _| AppError::InvalidQuery(err.to_string()).into());

    web::scope("/api").app_data(query_config).service(services![
        health,
        // -- Stream
        stream::start_stream,
        socket::chat_socket,
    ])
}
