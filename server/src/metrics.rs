//! Server metrics, exposed through the metriken registry.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "cmd_get", description = "get/gets commands dispatched")]
pub static GETS: Counter = Counter::new();

#[metric(name = "cmd_set", description = "set commands dispatched")]
pub static SETS: Counter = Counter::new();

#[metric(name = "cmd_delete", description = "delete commands dispatched")]
pub static DELETES: Counter = Counter::new();

#[metric(name = "cache_hits", description = "Keys found by get commands")]
pub static HITS: Counter = Counter::new();

#[metric(name = "cache_misses", description = "Keys missed by get commands")]
pub static MISSES: Counter = Counter::new();

#[metric(name = "client_errors", description = "CLIENT_ERROR responses sent")]
pub static CLIENT_ERRORS: Counter = Counter::new();

#[metric(name = "server_errors", description = "SERVER_ERROR responses sent")]
pub static SERVER_ERRORS: Counter = Counter::new();
