// Domain layer: experiment-facing types and the traits user modules implement.

pub mod model;
pub mod ports;
