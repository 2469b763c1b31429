mod driver;
mod location;
mod offer;
mod ride;

pub use driver::{Driver, DriverSession, Status as DriverStatus};
pub use location::{Coordinates, Location};
pub use offer::RideOffer;
pub use ride::{ride_number, Ride, RideEvent, RideType, Status as RideStatus, Transition};
