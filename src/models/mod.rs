pub mod actor;
pub mod presence;
pub mod ride;
pub mod trip_completion;

pub use actor::{Actor, Role};
pub use presence::{DriverPresence, DriverStatus};
pub use ride::{GeoPoint, Place, RideRequest, RideStatus};
pub use trip_completion::{Page, TripActuals, TripCompletion, TripHistory, TripRating};

pub type UserId = uuid::Uuid;
pub type RideId = uuid::Uuid;
