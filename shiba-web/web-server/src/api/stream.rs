use actix_web::{
    get, rt as actix_rt,
    web::{Data, Json, Query},
};
use common::api_bindings::{StartStreamQuery, StartStreamResponse};

use crate::app::{App, AppError, auth::AuthenticatedUser};

/// Starts the stream of a room and returns once every connected member got an offer
#[get("/stream")]
pub async fn start_stream(
    web_app: Data<App>,
    user: AuthenticatedUser,
    Query(query): Query<StartStreamQuery>,
) -> Result<Json<StartStreamResponse>, AppError> {
    let app = web_app.get_ref().clone();

    // A client hanging up must not abort the bring-up halfway
    let result = actix_rt::spawn(async move { app.start_stream(&user, &query.cid).await })
        .await
        .map_err(|_| AppError::Interrupted)?;
    result?;

    Ok(Json(StartStreamResponse::started()))
}
