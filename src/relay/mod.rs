//! The relay itself. Each configured [route_mapping::RouteMapping] becomes a
//!  [relay_direction::RelayDirection] that receives datagrams, holds them in a
//!  [schedule_queue::ScheduleQueue] for the current delay, and sends them on when they are due.
//!  The [orchestrator::RelayOrchestrator] starts and supervises all directions.

pub mod endpoint_factory;
pub mod orchestrator;
pub mod relay_config;
pub mod relay_direction;
pub mod route_mapping;
pub mod schedule_queue;
