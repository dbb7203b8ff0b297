//! File server metrics.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "connections_accepted",
    description = "Total client connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Currently connected clients"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "bytes_received", description = "Application bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "bytes_sent", description = "Application bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(name = "uploads_started", description = "Uploads begun (offset zero)")]
pub static UPLOADS_STARTED: Counter = Counter::new();

#[metric(name = "uploads_completed", description = "Uploads fully received")]
pub static UPLOADS_COMPLETED: Counter = Counter::new();

#[metric(name = "downloads_started", description = "Downloads begun")]
pub static DOWNLOADS_STARTED: Counter = Counter::new();

#[metric(name = "downloads_completed", description = "Downloads fully served")]
pub static DOWNLOADS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "protocol_errors",
    description = "Malformed frames or requests that closed a connection"
)]
pub static PROTOCOL_ERRORS: Counter = Counter::new();
