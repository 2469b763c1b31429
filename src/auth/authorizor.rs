use oso::{Oso, PolarClass};

use crate::auth::{Platform, User};
use crate::entities::{Driver, Ride};
use crate::error::Result;

pub fn new() -> Result<Oso> {
    let mut o = Oso::new();

    o.register_class(Platform::get_polar_class())?;
    o.register_class(User::get_polar_class())?;
    o.register_class(Driver::get_polar_class())?;
    o.register_class(Ride::get_polar_class())?;

    o.load_str(include_str!("rules.polar"))?;

    Ok(o)
}

#[cfg(test)]
fn almaty_ride(passenger_id: uuid::Uuid) -> Ride {
    use crate::entities::{Location, RideType};

    Ride::new(
        "RIDE_20240101_001".into(),
        passenger_id,
        RideType::Economy,
        Location::new(43.222, 76.851),
        Location::new(43.238, 76.889),
    )
}

#[test]
fn platform_role_test() {
    use uuid::Uuid;

    let authorizor = new().unwrap();

    let member = User::new(Uuid::new_v4());
    let driver = User::new(Uuid::new_v4()).with_roles(["driver"]);
    let system = User::new_system_user();

    assert!(authorizor
        .is_allowed(member.clone(), "create_ride", Platform::default())
        .unwrap());
    assert!(!authorizor
        .is_allowed(member, "connect_driver", Platform::default())
        .unwrap());
    assert!(authorizor
        .is_allowed(driver, "connect_driver", Platform::default())
        .unwrap());
    assert!(authorizor
        .is_allowed(system, "connect_driver", Platform::default())
        .unwrap());
}

#[test]
fn ride_passenger_role_test() {
    use uuid::Uuid;

    let authorizor = new().unwrap();

    let passenger = User::new(Uuid::new_v4());
    let stranger = User::new(Uuid::new_v4());
    let ride = almaty_ride(passenger.id);

    assert!(authorizor
        .is_allowed(passenger.clone(), "read", ride.clone())
        .unwrap());
    assert!(authorizor
        .is_allowed(passenger.clone(), "cancel", ride.clone())
        .unwrap());
    assert!(!authorizor
        .is_allowed(passenger, "start", ride.clone())
        .unwrap());
    assert!(!authorizor.is_allowed(stranger, "read", ride).unwrap());
}

#[test]
fn ride_driver_role_test() {
    use uuid::Uuid;

    let authorizor = new().unwrap();

    let driver = User::new(Uuid::new_v4()).with_roles(["driver"]);
    let other_driver = User::new(Uuid::new_v4()).with_roles(["driver"]);
    let mut ride = almaty_ride(Uuid::new_v4());
    ride.driver_id = Some(driver.id);

    for action in ["read", "depart", "start", "complete", "cancel"] {
        assert!(authorizor
            .is_allowed(driver.clone(), action, ride.clone())
            .unwrap());
    }
    assert!(!authorizor
        .is_allowed(other_driver, "complete", ride.clone())
        .unwrap());
    assert!(authorizor
        .is_allowed(User::new_system_user(), "complete", ride)
        .unwrap());
}

#[test]
fn driver_owner_role_test() {
    use crate::entities::{Driver, RideType};
    use uuid::Uuid;

    let authorizor = new().unwrap();

    let owner = User::new(Uuid::new_v4()).with_roles(["driver"]);
    let driver = Driver::new(owner.id, "AB123456".into(), RideType::Comfort);

    assert!(authorizor
        .is_allowed(owner, "go_online", driver.clone())
        .unwrap());
    assert!(!authorizor
        .is_allowed(User::new(Uuid::new_v4()), "go_online", driver)
        .unwrap());
}
