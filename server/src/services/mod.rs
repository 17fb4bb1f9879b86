//! Offer lifecycle services and their collaborators

pub mod notify;
pub mod offers;
pub mod store;
pub mod sweeper;
