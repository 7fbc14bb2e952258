//! Turns committed dispatch outcomes into WebSocket envelopes and device
//! pushes. Delivery failures are logged and never reach the caller.

pub mod kafka;
pub mod push;

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::dispatch::machine::{Transition, TransitionKind};
use crate::hub::{Envelope, Hub};
use crate::models::{DriverPresence, RideRequest, Role, UserId};
use crate::presence::NearbyDriver;
use push::{PushEvent, PushSender};

pub const RIDE_REQUEST: &str = "ride_request";
pub const RIDE_ACCEPTED: &str = "ride_accepted";
pub const DRIVER_ARRIVED: &str = "driver_arrived";
pub const RIDE_STARTED: &str = "ride_started";
pub const RIDE_COMPLETED: &str = "ride_completed";
pub const RIDE_CANCELLED: &str = "ride_cancelled";
pub const DRIVER_LOCATION_UPDATE: &str = "driver_location_update";
pub const BROADCAST: &str = "broadcast";

/// Who an operator announcement goes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    #[default]
    All,
    Drivers,
    Clients,
}

#[derive(Clone)]
pub struct EventNotifier {
    hub: Hub,
    push: Arc<dyn PushSender>,
}

impl EventNotifier {
    pub fn new(hub: Hub, push: Arc<dyn PushSender>) -> Self {
        Self { hub, push }
    }

    /// Offers a new ride to each nearby driver. Returns how many live
    /// connections took the offer.
    pub fn ride_requested(&self, ride: &RideRequest, drivers: &[NearbyDriver]) -> usize {
        let mut delivered = 0;
        for driver in drivers {
            let mut data = ride_data(ride);
            data["clientId"] = json!(ride.client_id);
            data["pickup"] = json!(ride.pickup);
            data["destination"] = json!(ride.destination);
            data["price"] = json!(ride.price);
            data["distance"] = json!(ride.distance);
            data["duration"] = json!(ride.duration);
            data["driverDistance"] = json!(driver.distance_km);
            data["driverEta"] = json!(driver.eta_minutes);

            let driver_id = driver.presence.driver_id;
            delivered += self
                .hub
                .send_to_user(&driver_id, &Envelope::new(RIDE_REQUEST, data));
            self.push(
                driver_id,
                PushEvent {
                    kind: RIDE_REQUEST,
                    title: "New ride request".to_string(),
                    body: format!(
                        "{:.1} km away, fare {:.2}",
                        driver.distance_km, ride.price
                    ),
                    ride_id: Some(ride.id),
                },
            );
        }
        debug!(ride_id = %ride.id, drivers = drivers.len(), delivered, "Ride request fanned out");
        delivered
    }

    pub fn transitioned(&self, transition: &Transition) {
        let ride = &transition.ride;
        let mut data = ride_data(ride);

        match transition.kind {
            TransitionKind::Accept => {
                data["driverId"] = json!(ride.driver_id);
                data["etaMinutes"] = json!(transition.eta_minutes);
                let body = match transition.eta_minutes {
                    Some(eta) => format!("Your driver arrives in about {} min", eta),
                    None => "Your driver is on the way".to_string(),
                };
                self.notify(ride.client_id, RIDE_ACCEPTED, data, "Ride accepted", body, ride);
            }
            TransitionKind::Arrive => {
                data["driverId"] = json!(ride.driver_id);
                self.notify(
                    ride.client_id,
                    DRIVER_ARRIVED,
                    data,
                    "Driver arrived",
                    "Your driver is waiting at the pickup point".to_string(),
                    ride,
                );
            }
            TransitionKind::Start => {
                self.notify(
                    ride.client_id,
                    RIDE_STARTED,
                    data,
                    "Ride started",
                    format!("Heading to {}", ride.destination.address),
                    ride,
                );
            }
            TransitionKind::Complete => {
                if let Some(completion) = &transition.completion {
                    data["actualFare"] = json!(completion.actual_fare);
                    data["actualDistance"] = json!(completion.actual_distance);
                    data["actualDuration"] = json!(completion.actual_duration);
                }
                self.notify(
                    ride.client_id,
                    RIDE_COMPLETED,
                    data,
                    "Ride completed",
                    "Thanks for riding, rate your trip".to_string(),
                    ride,
                );
            }
            TransitionKind::Reject | TransitionKind::Cancel => {
                data["cancelledBy"] = json!(ride.cancelled_by);
                // The other party hears about it; the canceller has the response.
                let target = match ride.cancelled_by {
                    Some(Role::Client) => transition.previous_driver,
                    _ => Some(ride.client_id),
                };
                if let Some(target) = target {
                    self.notify(
                        target,
                        RIDE_CANCELLED,
                        data,
                        "Ride cancelled",
                        "The ride was cancelled".to_string(),
                        ride,
                    );
                }
            }
        }
    }

    /// Forwards a driver's position to the client of the ride they serve.
    pub fn driver_location(&self, presence: &DriverPresence, ride: &RideRequest) -> usize {
        let data = json!({
            "rideId": ride.id,
            "driverId": presence.driver_id,
            "lat": presence.latitude,
            "lng": presence.longitude,
            "heading": presence.heading,
        });
        self.hub
            .send_to_user(&ride.client_id, &Envelope::new(DRIVER_LOCATION_UPDATE, data))
    }

    /// Announcement to every live connection of the audience.
    pub fn broadcast(&self, audience: Audience, title: &str, body: &str, data: Value) -> usize {
        let envelope = Envelope::new(
            BROADCAST,
            json!({ "title": title, "body": body, "data": data }),
        );
        let delivered = match audience {
            Audience::All => self.hub.broadcast_all(&envelope),
            Audience::Drivers => self.hub.send_to_role(Role::Driver, &envelope),
            Audience::Clients => self.hub.send_to_role(Role::Client, &envelope),
        };
        info!(?audience, delivered, "Broadcast sent");
        delivered
    }

    fn notify(
        &self,
        target: UserId,
        kind: &'static str,
        data: Value,
        title: &str,
        body: String,
        ride: &RideRequest,
    ) {
        let delivered = self.hub.send_to_user(&target, &Envelope::new(kind, data));
        debug!(ride_id = %ride.id, target_user = %target, kind, delivered, "Ride event sent");
        self.push(
            target,
            PushEvent {
                kind,
                title: title.to_string(),
                body,
                ride_id: Some(ride.id),
            },
        );
    }

    fn push(&self, target: UserId, event: PushEvent) {
        let push = Arc::clone(&self.push);
        tokio::spawn(async move {
            if let Err(e) = push.send(target, &event).await {
                warn!(target_user = %target, kind = event.kind, "Push notification failed: {}", e);
            }
        });
    }
}

fn ride_data(ride: &RideRequest) -> Value {
    json!({
        "rideId": ride.id,
        "status": ride.status,
    })
}

#[cfg(test)]
mod tests {
    use super::push::testing::RecordingPush;
    use super::*;
    use crate::dispatch::machine::{self, tests::available_driver, tests::pending_ride};
    use crate::hub::Outbound;
    use crate::models::Actor;
    use chrono::Utc;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn next(rx: &mut mpsc::Receiver<Outbound>) -> Envelope {
        let message = rx.try_recv().expect("expected a queued message");
        serde_json::from_str(&message).unwrap()
    }

    #[tokio::test]
    async fn test_accept_notifies_client_with_eta() {
        let hub = Hub::new(8);
        let (push, mut pushes) = RecordingPush::new();
        let notifier = EventNotifier::new(hub.clone(), Arc::new(push));

        let client = Uuid::new_v4();
        let driver = Uuid::new_v4();
        let (_conn, mut rx) = hub.register(client, Role::Client);

        let ride = pending_ride(client);
        let t = machine::accept(
            &ride,
            Actor::Driver(driver),
            Some(&available_driver(driver)),
            Utc::now(),
        )
        .unwrap();
        notifier.transitioned(&t);

        let envelope = next(&mut rx);
        assert_eq!(envelope.kind, RIDE_ACCEPTED);
        assert_eq!(envelope.data["status"], "accepted");
        assert_eq!(envelope.data["driverId"], json!(driver));
        assert_eq!(envelope.data["etaMinutes"], 1);

        let (target, event) = pushes.recv().await.unwrap();
        assert_eq!(target, client);
        assert_eq!(event.kind, RIDE_ACCEPTED);
    }

    #[tokio::test]
    async fn test_client_cancel_notifies_released_driver() {
        let hub = Hub::new(8);
        let (push, _pushes) = RecordingPush::new();
        let notifier = EventNotifier::new(hub.clone(), Arc::new(push));

        let client = Uuid::new_v4();
        let driver = Uuid::new_v4();
        let (_c, mut client_rx) = hub.register(client, Role::Client);
        let (_d, mut driver_rx) = hub.register(driver, Role::Driver);

        let mut ride = pending_ride(client);
        ride.status = crate::models::RideStatus::Accepted;
        ride.driver_id = Some(driver);
        let t = machine::cancel(&ride, Actor::Client(client), None, Utc::now()).unwrap();
        notifier.transitioned(&t);

        let envelope = next(&mut driver_rx);
        assert_eq!(envelope.kind, RIDE_CANCELLED);
        assert_eq!(envelope.data["cancelledBy"], "client");
        assert!(client_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_respects_audience() {
        let hub = Hub::new(8);
        let (push, _pushes) = RecordingPush::new();
        let notifier = EventNotifier::new(hub.clone(), Arc::new(push));
        let (_d, mut driver_rx) = hub.register(Uuid::new_v4(), Role::Driver);
        let (_c, mut client_rx) = hub.register(Uuid::new_v4(), Role::Client);

        assert_eq!(
            notifier.broadcast(Audience::Drivers, "Surge", "Busy downtown", Value::Null),
            1
        );
        assert_eq!(next(&mut driver_rx).data["title"], "Surge");
        assert!(client_rx.try_recv().is_err());

        assert_eq!(
            notifier.broadcast(Audience::All, "Maintenance", "Tonight", json!({ "at": "02:00" })),
            2
        );
        assert_eq!(next(&mut client_rx).kind, BROADCAST);
    }

    #[tokio::test]
    async fn test_ride_request_carries_driver_distance() {
        let hub = Hub::new(8);
        let (push, _pushes) = RecordingPush::new();
        let notifier = EventNotifier::new(hub.clone(), Arc::new(push));

        let driver = Uuid::new_v4();
        let (_d, mut rx) = hub.register(driver, Role::Driver);
        let offline = Uuid::new_v4();

        let ride = pending_ride(Uuid::new_v4());
        let nearby: Vec<NearbyDriver> = [driver, offline]
            .into_iter()
            .map(|id| NearbyDriver {
                presence: available_driver(id),
                distance_km: 0.11,
                eta_minutes: 1,
            })
            .collect();

        assert_eq!(notifier.ride_requested(&ride, &nearby), 1);
        let envelope = next(&mut rx);
        assert_eq!(envelope.kind, RIDE_REQUEST);
        assert_eq!(envelope.data["rideId"], json!(ride.id));
        assert_eq!(envelope.data["driverEta"], 1);
        assert_eq!(envelope.data["pickup"]["address"], "Pickup");
    }
}
