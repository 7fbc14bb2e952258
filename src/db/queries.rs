pub const SCHEMA: [&str; 6] = [
    r#"
CREATE TABLE IF NOT EXISTS ride_requests (
    id UUID PRIMARY KEY,
    client_id UUID NOT NULL,
    driver_id UUID,
    pickup_lat DOUBLE PRECISION NOT NULL,
    pickup_lng DOUBLE PRECISION NOT NULL,
    pickup_addr TEXT NOT NULL DEFAULT '',
    dest_lat DOUBLE PRECISION NOT NULL,
    dest_lng DOUBLE PRECISION NOT NULL,
    dest_addr TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    price DOUBLE PRECISION NOT NULL,
    distance DOUBLE PRECISION NOT NULL,
    duration INTEGER NOT NULL,
    cancelled_by TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    CHECK ((driver_id IS NOT NULL) = (status IN ('accepted', 'arrived', 'started', 'completed')))
);
"#,
    r#"
CREATE INDEX IF NOT EXISTS ride_requests_driver_status_idx ON ride_requests (driver_id, status);
"#,
    r#"
CREATE TABLE IF NOT EXISTS driver_presence (
    driver_id UUID PRIMARY KEY,
    latitude DOUBLE PRECISION NOT NULL,
    longitude DOUBLE PRECISION NOT NULL,
    heading DOUBLE PRECISION NOT NULL DEFAULT 0,
    is_online BOOLEAN NOT NULL,
    is_available BOOLEAN NOT NULL,
    last_seen TIMESTAMPTZ NOT NULL,
    CHECK (NOT is_available OR is_online)
);
"#,
    r#"
CREATE TABLE IF NOT EXISTS trip_completions (
    ride_id UUID PRIMARY KEY REFERENCES ride_requests (id),
    driver_id UUID NOT NULL,
    client_id UUID NOT NULL,
    actual_fare DOUBLE PRECISION NOT NULL,
    actual_distance DOUBLE PRECISION NOT NULL,
    actual_duration INTEGER NOT NULL,
    driver_notes TEXT,
    client_rating DOUBLE PRECISION,
    client_notes TEXT,
    driver_rating DOUBLE PRECISION,
    created_at TIMESTAMPTZ NOT NULL
);
"#,
    r#"
CREATE INDEX IF NOT EXISTS trip_completions_driver_idx ON trip_completions (driver_id, created_at DESC);
"#,
    r#"
CREATE INDEX IF NOT EXISTS trip_completions_client_idx ON trip_completions (client_id, created_at DESC);
"#,
];

/// Bounds row-lock waits for the rest of the current transaction.
pub const SET_LOCK_TIMEOUT: &str = r#"
SELECT set_config('lock_timeout', $1, true);
"#;

pub const SELECT_RIDE: &str = r#"
SELECT id, client_id, driver_id, pickup_lat, pickup_lng, pickup_addr,
       dest_lat, dest_lng, dest_addr, status, price, distance, duration,
       cancelled_by, created_at, updated_at
FROM ride_requests WHERE id = $1;
"#;

pub const SELECT_RIDE_FOR_UPDATE: &str = r#"
SELECT id, client_id, driver_id, pickup_lat, pickup_lng, pickup_addr,
       dest_lat, dest_lng, dest_addr, status, price, distance, duration,
       cancelled_by, created_at, updated_at
FROM ride_requests WHERE id = $1 FOR UPDATE;
"#;

pub const SELECT_ACTIVE_RIDES_FOR_DRIVER: &str = r#"
SELECT id, client_id, driver_id, pickup_lat, pickup_lng, pickup_addr,
       dest_lat, dest_lng, dest_addr, status, price, distance, duration,
       cancelled_by, created_at, updated_at
FROM ride_requests
WHERE driver_id = $1 AND status IN ('accepted', 'arrived', 'started')
ORDER BY updated_at DESC;
"#;

pub const DRIVER_HAS_ACTIVE_RIDE: &str = r#"
SELECT EXISTS (
    SELECT 1 FROM ride_requests
    WHERE driver_id = $1 AND status IN ('accepted', 'arrived', 'started')
);
"#;

pub const INSERT_RIDE: &str = r#"
INSERT INTO ride_requests (
    id, client_id, driver_id, pickup_lat, pickup_lng, pickup_addr,
    dest_lat, dest_lng, dest_addr, status, price, distance, duration,
    cancelled_by, created_at, updated_at
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16);
"#;

/// Writes only if the ride still has the status the transition was computed from.
pub const UPDATE_RIDE_GUARDED: &str = r#"
UPDATE ride_requests
SET driver_id = $3,
    status = $4,
    cancelled_by = $5,
    updated_at = $6
WHERE id = $1 AND status = $2;
"#;

pub const SELECT_PRESENCE: &str = r#"
SELECT driver_id, latitude, longitude, heading, is_online, is_available, last_seen
FROM driver_presence WHERE driver_id = $1;
"#;

pub const SELECT_PRESENCE_FOR_UPDATE: &str = r#"
SELECT driver_id, latitude, longitude, heading, is_online, is_available, last_seen
FROM driver_presence WHERE driver_id = $1 FOR UPDATE;
"#;

pub const SELECT_AVAILABLE_PRESENCES: &str = r#"
SELECT driver_id, latitude, longitude, heading, is_online, is_available, last_seen
FROM driver_presence WHERE is_online AND is_available;
"#;

/// First sighting inserts an online but unavailable record.
pub const UPSERT_LOCATION: &str = r#"
INSERT INTO driver_presence (driver_id, latitude, longitude, heading, is_online, is_available, last_seen)
VALUES ($1, $2, $3, $4, true, false, $5)
ON CONFLICT (driver_id) DO UPDATE
SET latitude = $2,
    longitude = $3,
    heading = $4,
    is_online = true,
    last_seen = $5
RETURNING driver_id, latitude, longitude, heading, is_online, is_available, last_seen;
"#;

pub const SET_AVAILABILITY: &str = r#"
UPDATE driver_presence
SET is_available = $2,
    is_online = is_online OR $2,
    last_seen = $3
WHERE driver_id = $1
RETURNING driver_id, latitude, longitude, heading, is_online, is_available, last_seen;
"#;

pub const MARK_OFFLINE: &str = r#"
UPDATE driver_presence
SET is_online = false,
    is_available = false,
    last_seen = $2
WHERE driver_id = $1
RETURNING driver_id, latitude, longitude, heading, is_online, is_available, last_seen;
"#;

pub const UPDATE_PRESENCE_AVAILABILITY: &str = r#"
UPDATE driver_presence
SET is_online = $2,
    is_available = $3
WHERE driver_id = $1;
"#;

pub const SELECT_COMPLETION: &str = r#"
SELECT ride_id, driver_id, client_id, actual_fare, actual_distance, actual_duration,
       driver_notes, client_rating, client_notes, driver_rating, created_at
FROM trip_completions WHERE ride_id = $1;
"#;

pub const INSERT_COMPLETION: &str = r#"
INSERT INTO trip_completions (
    ride_id, driver_id, client_id, actual_fare, actual_distance, actual_duration,
    driver_notes, created_at
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (ride_id) DO NOTHING;
"#;

pub const RATE_AS_CLIENT: &str = r#"
UPDATE trip_completions
SET client_rating = $2,
    client_notes = $3
WHERE ride_id = $1
RETURNING ride_id, driver_id, client_id, actual_fare, actual_distance, actual_duration,
          driver_notes, client_rating, client_notes, driver_rating, created_at;
"#;

/// Driver notes written at completion are kept if the rating carries none.
pub const RATE_AS_DRIVER: &str = r#"
UPDATE trip_completions
SET driver_rating = $2,
    driver_notes = COALESCE($3, driver_notes)
WHERE ride_id = $1
RETURNING ride_id, driver_id, client_id, actual_fare, actual_distance, actual_duration,
          driver_notes, client_rating, client_notes, driver_rating, created_at;
"#;

pub const SELECT_DRIVER_COMPLETIONS: &str = r#"
SELECT ride_id, driver_id, client_id, actual_fare, actual_distance, actual_duration,
       driver_notes, client_rating, client_notes, driver_rating, created_at
FROM trip_completions WHERE driver_id = $1
ORDER BY created_at DESC
OFFSET $2 LIMIT $3;
"#;

pub const COUNT_DRIVER_COMPLETIONS: &str = r#"
SELECT COUNT(*) FROM trip_completions WHERE driver_id = $1;
"#;

pub const SELECT_CLIENT_COMPLETIONS: &str = r#"
SELECT ride_id, driver_id, client_id, actual_fare, actual_distance, actual_duration,
       driver_notes, client_rating, client_notes, driver_rating, created_at
FROM trip_completions WHERE client_id = $1
ORDER BY created_at DESC
OFFSET $2 LIMIT $3;
"#;

pub const COUNT_CLIENT_COMPLETIONS: &str = r#"
SELECT COUNT(*) FROM trip_completions WHERE client_id = $1;
"#;
