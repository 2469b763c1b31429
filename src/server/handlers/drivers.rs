use axum::extract::{Extension, Json, Path};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::DriverAPI;
use crate::auth::User;
use crate::entities::{Driver, DriverSession, Location, RideType};
use crate::error::Error;
use crate::server::DynAPI;

#[derive(Serialize, Deserialize)]
pub struct CreateParams {
    license_number: String,
    vehicle_class: RideType,
}

#[derive(Serialize, Deserialize)]
pub struct OnlineParams {
    #[serde(default)]
    location: Option<Location>,
}

pub async fn create(
    Extension(api): Extension<DynAPI>,
    user: User,
    Json(params): Json<CreateParams>,
) -> Result<Json<Driver>, Error> {
    let driver = api
        .register_driver(user, params.license_number, params.vehicle_class)
        .await?;

    Ok(driver.into())
}

pub async fn find(
    Extension(api): Extension<DynAPI>,
    user: User,
    Path(id): Path<Uuid>,
) -> Result<Json<Driver>, Error> {
    let driver = api.find_driver(user, id).await?;

    Ok(driver.into())
}

pub async fn go_online(
    Extension(api): Extension<DynAPI>,
    user: User,
    Path(id): Path<Uuid>,
    Json(params): Json<OnlineParams>,
) -> Result<Json<DriverSession>, Error> {
    let session = api.go_online(user, id, params.location).await?;

    Ok(session.into())
}

pub async fn go_offline(
    Extension(api): Extension<DynAPI>,
    user: User,
    Path(id): Path<Uuid>,
) -> Result<Json<DriverSession>, Error> {
    let session = api.go_offline(user, id).await?;

    Ok(session.into())
}

pub async fn update_location(
    Extension(api): Extension<DynAPI>,
    user: User,
    Path(id): Path<Uuid>,
    Json(location): Json<Location>,
) -> Result<(), Error> {
    api.update_location(user, id, location).await
}
