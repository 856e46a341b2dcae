//! Supporting algorithms: communication backends, graph colouring and halo
//! data exchange.

pub mod colour;
pub mod communicator;
pub mod halo;
